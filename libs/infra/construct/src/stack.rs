use core_config::deploy::DeployTarget;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{SynthError, SynthResult};
use crate::security_group::{IngressRule, SecurityGroupHandle, SecurityGroupState};
use crate::template::{Expr, Output, Parameter, Resource, Template};

/// A declarative building block that adds resources to a stack.
///
/// `declare` validates the props, registers the resources and returns a
/// handle carrying the expressions other constructs need (ids, ARNs,
/// endpoints).
pub trait Construct {
    type Handle;

    fn declare(self, stack: &mut Stack) -> SynthResult<Self::Handle>;
}

/// Build a CloudFormation logical id from path segments.
///
/// Non-alphanumeric characters are dropped; logical ids only allow `[A-Za-z0-9]`.
pub fn logical_id(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.chars())
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// An independently deployable unit of declared resources.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    target: DeployTarget,
    template: Template,
    security_groups: BTreeMap<String, SecurityGroupState>,
}

impl Stack {
    pub fn new(name: impl Into<String>, target: DeployTarget) -> Self {
        Self {
            name: name.into(),
            target,
            template: Template::default(),
            security_groups: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.template.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &DeployTarget {
        &self.target
    }

    /// Declare a construct in this stack
    pub fn add<C: Construct>(&mut self, construct: C) -> SynthResult<C::Handle> {
        construct.declare(self)
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.template.resources.contains_key(logical_id)
            || self.template.parameters.contains_key(logical_id)
            || self.security_groups.contains_key(logical_id)
    }

    pub fn add_resource(&mut self, logical_id: &str, resource: Resource) -> SynthResult<()> {
        if self.contains(logical_id) {
            return Err(SynthError::DuplicateLogicalId {
                stack: self.name.clone(),
                logical_id: logical_id.to_string(),
            });
        }
        debug!(stack = %self.name, logical_id, resource_type = %resource.resource_type, "Declared resource");
        self.template.resources.insert(logical_id.to_string(), resource);
        Ok(())
    }

    /// Parameters are shared: declaring an identical one twice is a no-op.
    pub fn add_parameter(&mut self, logical_id: &str, parameter: Parameter) -> SynthResult<Expr> {
        match self.template.parameters.get(logical_id) {
            Some(existing) if *existing == parameter => {}
            Some(_) => {
                return Err(SynthError::DuplicateLogicalId {
                    stack: self.name.clone(),
                    logical_id: logical_id.to_string(),
                });
            }
            None => {
                if self.contains(logical_id) {
                    return Err(SynthError::DuplicateLogicalId {
                        stack: self.name.clone(),
                        logical_id: logical_id.to_string(),
                    });
                }
                self.template
                    .parameters
                    .insert(logical_id.to_string(), parameter);
            }
        }
        Ok(Expr::reference(logical_id))
    }

    /// Add an output; an export name may appear on only one output per stack
    pub fn add_output(&mut self, output_id: &str, output: Output) -> SynthResult<()> {
        if self.template.outputs.contains_key(output_id) {
            return Err(SynthError::DuplicateOutput {
                stack: self.name.clone(),
                output: output_id.to_string(),
            });
        }
        if let Some(export) = &output.export {
            if self.template.export_names().contains(&export.name) {
                return Err(SynthError::DuplicateExport {
                    export: export.name.clone(),
                    first: self.name.clone(),
                    second: self.name.clone(),
                });
            }
        }
        self.template.outputs.insert(output_id.to_string(), output);
        Ok(())
    }

    /// Publish `value` under a named export for other stacks to import
    pub fn export(&mut self, output_id: &str, value: Expr, export_name: &str) -> SynthResult<()> {
        self.add_output(output_id, Output::new(value).with_export(export_name))
    }

    /// Reference an export published by another stack
    pub fn import_value(&self, export_name: &str) -> Expr {
        Expr::import(export_name)
    }

    pub(crate) fn register_security_group(
        &mut self,
        logical_id: &str,
        state: SecurityGroupState,
    ) -> SynthResult<()> {
        if self.contains(logical_id) {
            return Err(SynthError::DuplicateLogicalId {
                stack: self.name.clone(),
                logical_id: logical_id.to_string(),
            });
        }
        self.security_groups.insert(logical_id.to_string(), state);
        Ok(())
    }

    /// Add an allow-rule to a security group declared in this stack.
    ///
    /// Identical rules are only kept once.
    pub fn add_ingress_rule(
        &mut self,
        group: &SecurityGroupHandle,
        rule: IngressRule,
    ) -> SynthResult<()> {
        let state = self
            .security_groups
            .get_mut(&group.logical_id)
            .ok_or_else(|| SynthError::UnknownSecurityGroup(group.logical_id.clone()))?;
        if !state.rules.contains(&rule) {
            state.rules.push(rule);
        }
        Ok(())
    }

    /// Union of the allow-rules of every given group
    pub fn effective_ingress(&self, groups: &[&SecurityGroupHandle]) -> SynthResult<Vec<IngressRule>> {
        let mut rules: Vec<IngressRule> = Vec::new();
        for group in groups {
            let state = self
                .security_groups
                .get(&group.logical_id)
                .ok_or_else(|| SynthError::UnknownSecurityGroup(group.logical_id.clone()))?;
            for rule in &state.rules {
                if !rules.contains(rule) {
                    rules.push(rule.clone());
                }
            }
        }
        Ok(rules)
    }

    /// Render the final template.
    ///
    /// Fails when a `Ref`/`Fn::GetAtt`/`DependsOn` names a logical id that
    /// is not declared in this stack.
    pub fn synth(&self) -> SynthResult<Template> {
        let mut template = self.template.clone();
        for (logical_id, state) in &self.security_groups {
            for (id, resource) in state.render(logical_id)? {
                if template.resources.contains_key(&id) {
                    return Err(SynthError::DuplicateLogicalId {
                        stack: self.name.clone(),
                        logical_id: id,
                    });
                }
                template.resources.insert(id, resource);
            }
        }

        for id in template.referenced_ids() {
            if !template.resources.contains_key(&id) && !template.parameters.contains_key(&id) {
                return Err(SynthError::property(
                    &self.name,
                    format!("reference to undeclared logical id '{}'", id),
                ));
            }
        }

        Ok(template)
    }
}
