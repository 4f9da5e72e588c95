//! Multi-stack application: cross-stack resolution, deployment order and
//! the on-disk cloud assembly.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::audit::check_database_exposure;
use crate::error::{SynthError, SynthResult};
use crate::stack::Stack;
use crate::template::Template;

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: &str = "1";

#[derive(Debug, Default)]
pub struct App {
    stacks: Vec<Stack>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stack(&mut self, stack: Stack) -> SynthResult<()> {
        if self.stacks.iter().any(|s| s.name() == stack.name()) {
            return Err(SynthError::DuplicateStack(stack.name().to_string()));
        }
        self.stacks.push(stack);
        Ok(())
    }

    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(Stack::name).collect()
    }

    /// Synthesize every stack and resolve imports against exports.
    ///
    /// All-or-nothing: any error aborts before a template is produced.
    pub fn synth(&self) -> SynthResult<CloudAssembly> {
        let mut templates = Vec::with_capacity(self.stacks.len());
        for stack in &self.stacks {
            templates.push((stack.name().to_string(), stack.synth()?));
        }

        let exports = export_index(&templates)?;

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, template) in &templates {
            let deps = dependencies.entry(name.clone()).or_default();
            for import in template.imported_names() {
                match exports.get(&import) {
                    Some(producer) if producer == name => {
                        return Err(SynthError::SelfImport {
                            stack: name.clone(),
                            export: import,
                        });
                    }
                    Some(producer) => {
                        deps.insert(producer.clone());
                    }
                    None => {
                        return Err(SynthError::UnresolvedImport {
                            stack: name.clone(),
                            export: import,
                        });
                    }
                }
            }
        }

        let declared: Vec<String> = templates.iter().map(|(n, _)| n.clone()).collect();
        let order = deployment_order(&declared, &dependencies)?;
        check_database_exposure(&templates)?;

        let mut stacks = Vec::with_capacity(templates.len());
        for (stack, (name, template)) in self.stacks.iter().zip(templates) {
            debug!(stack = %name, resources = template.resources.len(), "Synthesized stack");
            stacks.push(SynthesizedStack {
                environment: stack.target().uri(),
                dependencies: dependencies.remove(&name).unwrap_or_default(),
                name,
                template,
            });
        }
        info!(stacks = stacks.len(), exports = exports.len(), order = ?order, "Synthesized app");

        Ok(CloudAssembly {
            stacks,
            order,
            exports,
        })
    }
}

/// Export name -> producing stack; an export name must be unique app-wide
pub fn export_index(templates: &[(String, Template)]) -> SynthResult<BTreeMap<String, String>> {
    let mut index: BTreeMap<String, String> = BTreeMap::new();
    for (name, template) in templates {
        for export in template.export_names() {
            if let Some(first) = index.get(&export) {
                return Err(SynthError::DuplicateExport {
                    export,
                    first: first.clone(),
                    second: name.clone(),
                });
            }
            index.insert(export, name.clone());
        }
    }
    Ok(index)
}

/// Producers before consumers; ties keep declaration order.
pub fn deployment_order(
    declared: &[String],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> SynthResult<Vec<String>> {
    let mut remaining: Vec<&String> = declared.iter().collect();
    let mut order: Vec<String> = Vec::with_capacity(declared.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|name| {
            dependencies
                .get(*name)
                .is_none_or(|deps| deps.iter().all(|d| order.contains(d)))
        });
        match ready {
            Some(i) => order.push(remaining.remove(i).clone()),
            None => return Err(SynthError::CyclicDependency(find_cycle(&remaining, dependencies))),
        }
    }
    Ok(order)
}

// Walk dependency edges among the blocked stacks until a name repeats.
fn find_cycle(blocked: &[&String], dependencies: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut path: Vec<String> = Vec::new();
    let mut current = blocked.first().map(|s| (*s).clone());
    while let Some(name) = current {
        if let Some(start) = path.iter().position(|p| *p == name) {
            let mut cycle = path.split_off(start);
            cycle.push(name);
            return cycle;
        }
        current = dependencies
            .get(&name)
            .and_then(|deps| deps.iter().find(|d| blocked.contains(d)).cloned());
        path.push(name);
    }
    path
}

#[derive(Debug, Clone)]
pub struct SynthesizedStack {
    pub name: String,
    pub environment: String,
    pub dependencies: BTreeSet<String>,
    pub template: Template,
}

impl SynthesizedStack {
    pub fn template_file(&self) -> String {
        format!("{}.template.json", self.name)
    }
}

/// Result of a successful synth
#[derive(Debug, Clone)]
pub struct CloudAssembly {
    pub stacks: Vec<SynthesizedStack>,
    pub order: Vec<String>,
    pub exports: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    version: &'static str,
    artifacts: BTreeMap<&'a str, Artifact<'a>>,
    order: &'a [String],
}

#[derive(Debug, Serialize)]
struct Artifact<'a> {
    #[serde(rename = "type")]
    artifact_type: &'static str,
    environment: &'a str,
    properties: ArtifactProperties,
    dependencies: &'a BTreeSet<String>,
    exports: BTreeSet<String>,
    imports: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactProperties {
    template_file: String,
}

impl CloudAssembly {
    pub fn stack(&self, name: &str) -> SynthResult<&SynthesizedStack> {
        self.stacks
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SynthError::UnknownStack(name.to_string()))
    }

    pub fn manifest_json(&self) -> SynthResult<String> {
        let artifacts = self
            .stacks
            .iter()
            .map(|s| {
                (
                    s.name.as_str(),
                    Artifact {
                        artifact_type: "aws:cloudformation:stack",
                        environment: &s.environment,
                        properties: ArtifactProperties {
                            template_file: s.template_file(),
                        },
                        dependencies: &s.dependencies,
                        exports: s.template.export_names(),
                        imports: s.template.imported_names(),
                    },
                )
            })
            .collect();
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            artifacts,
            order: &self.order,
        };
        let mut text = serde_json::to_string_pretty(&manifest)?;
        text.push('\n');
        Ok(text)
    }

    /// Write the selected stacks (all when `only` is empty) and the manifest.
    ///
    /// Everything is rendered in memory first so a serialization failure
    /// leaves the directory untouched.
    pub fn write_to(&self, dir: &Path, only: &[String]) -> SynthResult<Vec<PathBuf>> {
        for name in only {
            self.stack(name)?;
        }
        let mut files: Vec<(PathBuf, String)> = Vec::new();
        for stack in &self.stacks {
            if only.is_empty() || only.contains(&stack.name) {
                files.push((dir.join(stack.template_file()), stack.template.to_json_pretty()?));
            }
        }
        files.push((dir.join(MANIFEST_FILE), self.manifest_json()?));

        fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(files.len());
        for (path, contents) in files {
            fs::write(&path, contents)?;
            debug!(path = %path.display(), "Wrote assembly file");
            written.push(path);
        }
        Ok(written)
    }
}
