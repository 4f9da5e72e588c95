//! CloudFormation template model.
//!
//! Every map is a `BTreeMap` and `serde_json` is used without
//! `preserve_order`, so serializing the same template twice always yields
//! the same bytes.

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumString};

pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// A value expression inside a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Str(String),
    Num(i64),
    Bool(bool),
    Ref(String),
    GetAtt(String, String),
    ImportValue(String),
    Join(String, Vec<Expr>),
    Sub(String),
    Base64(Box<Expr>),
    Select(u32, Box<Expr>),
    GetAzs,
    Cidr(Box<Expr>, u32, u32),
    List(Vec<Expr>),
}

impl Expr {
    pub fn str(value: impl Into<String>) -> Self {
        Expr::Str(value.into())
    }

    pub fn reference(logical_id: impl Into<String>) -> Self {
        Expr::Ref(logical_id.into())
    }

    pub fn get_att(logical_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Expr::GetAtt(logical_id.into(), attribute.into())
    }

    pub fn import(export_name: impl Into<String>) -> Self {
        Expr::ImportValue(export_name.into())
    }

    pub fn join(separator: impl Into<String>, parts: Vec<Expr>) -> Self {
        Expr::Join(separator.into(), parts)
    }

    pub fn base64(inner: Expr) -> Self {
        Expr::Base64(Box::new(inner))
    }

    /// `Fn::Select [index, Fn::GetAZs ""]`
    pub fn availability_zone(index: u32) -> Self {
        Expr::Select(index, Box::new(Expr::GetAzs))
    }

    pub fn region() -> Self {
        Expr::Ref("AWS::Region".to_string())
    }

    pub fn partition() -> Self {
        Expr::Ref("AWS::Partition".to_string())
    }

    pub fn account_id() -> Self {
        Expr::Ref("AWS::AccountId".to_string())
    }

    pub fn url_suffix() -> Self {
        Expr::Ref("AWS::URLSuffix".to_string())
    }

    /// `arn:${Partition}:iam::aws:policy/<name>`
    pub fn managed_policy_arn(name: &str) -> Self {
        Expr::join(
            "",
            vec![
                Expr::str("arn:"),
                Expr::partition(),
                Expr::str(format!(":iam::aws:policy/{}", name)),
            ],
        )
    }

    /// Secrets Manager dynamic reference resolved by CloudFormation at deploy time
    pub fn secret_field(secret: Expr, field: &str) -> Self {
        Expr::join(
            "",
            vec![
                Expr::str("{{resolve:secretsmanager:"),
                secret,
                Expr::str(format!(":SecretString:{}::}}}}", field)),
            ],
        )
    }

    pub fn to_json(&self) -> Value {
        match self {
            Expr::Str(s) => Value::String(s.clone()),
            Expr::Num(n) => json!(n),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Ref(id) => json!({ "Ref": id }),
            Expr::GetAtt(id, attr) => json!({ "Fn::GetAtt": [id, attr] }),
            Expr::ImportValue(name) => json!({ "Fn::ImportValue": name }),
            Expr::Join(sep, parts) => {
                let parts: Vec<Value> = parts.iter().map(Expr::to_json).collect();
                json!({ "Fn::Join": [sep, parts] })
            }
            Expr::Sub(template) => json!({ "Fn::Sub": template }),
            Expr::Base64(inner) => json!({ "Fn::Base64": inner.to_json() }),
            Expr::Select(index, list) => json!({ "Fn::Select": [index, list.to_json()] }),
            Expr::GetAzs => json!({ "Fn::GetAZs": "" }),
            Expr::Cidr(block, count, bits) => {
                json!({ "Fn::Cidr": [block.to_json(), count, bits] })
            }
            Expr::List(items) => Value::Array(items.iter().map(Expr::to_json).collect()),
        }
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Str(value.to_string())
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::Str(value)
    }
}

impl From<Expr> for Value {
    fn from(value: Expr) -> Self {
        value.to_json()
    }
}

impl From<&Expr> for Value {
    fn from(value: &Expr) -> Self {
        value.to_json()
    }
}

/// What happens to a resource when it leaves the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RemovalPolicy {
    Destroy,
    #[default]
    Retain,
    Snapshot,
}

impl RemovalPolicy {
    pub fn deletion_policy(&self) -> &'static str {
        match self {
            RemovalPolicy::Destroy => "Delete",
            RemovalPolicy::Retain => "Retain",
            RemovalPolicy::Snapshot => "Snapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(rename = "Properties", skip_serializing_if = "is_empty_object")]
    pub properties: Value,
    #[serde(rename = "DependsOn", skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
    #[serde(rename = "UpdateReplacePolicy", skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<String>,
}

fn is_empty_object(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, properties: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties,
            depends_on: BTreeSet::new(),
            deletion_policy: None,
            update_replace_policy: None,
        }
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.insert(logical_id.into());
        self
    }

    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.deletion_policy = Some(policy.deletion_policy().to_string());
        self.update_replace_policy = Some(policy.deletion_policy().to_string());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub parameter_type: String,
    #[serde(rename = "Default", skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSpec {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Value")]
    pub value: Value,
    #[serde(rename = "Export", skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportSpec>,
}

impl Output {
    pub fn new(value: Expr) -> Self {
        Self {
            description: None,
            value: value.to_json(),
            export: None,
        }
    }

    pub fn with_export(mut self, name: impl Into<String>) -> Self {
        self.export = Some(ExportSpec { name: name.into() });
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Parameters", skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Resource>,
    #[serde(rename = "Outputs", skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            format_version: TEMPLATE_FORMAT_VERSION.to_string(),
            description: None,
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl Template {
    /// Names published through `Outputs.*.Export.Name`
    pub fn export_names(&self) -> BTreeSet<String> {
        self.outputs
            .values()
            .filter_map(|o| o.export.as_ref().map(|e| e.name.clone()))
            .collect()
    }

    /// Output value for an export name
    pub fn export_value(&self, export_name: &str) -> Option<&Value> {
        self.outputs
            .values()
            .find(|o| o.export.as_ref().is_some_and(|e| e.name == export_name))
            .map(|o| &o.value)
    }

    /// Every `Fn::ImportValue` name used anywhere in resources or outputs
    pub fn imported_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for resource in self.resources.values() {
            collect_imports(&resource.properties, &mut names);
        }
        for output in self.outputs.values() {
            collect_imports(&output.value, &mut names);
        }
        names
    }

    /// Every logical id targeted by `Ref`, `Fn::GetAtt` or `DependsOn`
    pub fn referenced_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for resource in self.resources.values() {
            collect_refs(&resource.properties, &mut ids);
            ids.extend(resource.depends_on.iter().cloned());
        }
        for output in self.outputs.values() {
            collect_refs(&output.value, &mut ids);
        }
        ids
    }

    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }
}

fn single_key<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if map.len() == 1 {
        map.get(key)
    } else {
        None
    }
}

fn collect_imports(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(name)) = single_key(map, "Fn::ImportValue") {
                out.insert(name.clone());
                return;
            }
            for v in map.values() {
                collect_imports(v, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_imports(v, out)),
        _ => {}
    }
}

fn collect_refs(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(id)) = single_key(map, "Ref") {
                if !id.starts_with("AWS::") {
                    out.insert(id.clone());
                }
                return;
            }
            if let Some(Value::Array(parts)) = single_key(map, "Fn::GetAtt") {
                if let Some(Value::String(id)) = parts.first() {
                    out.insert(id.clone());
                }
                return;
            }
            for v in map.values() {
                collect_refs(v, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/// Resolve the logical id a `Ref` / `Fn::GetAtt` value points at
pub fn target_logical_id(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if let Some(Value::String(id)) = single_key(map, "Ref") {
        return Some(id);
    }
    if let Some(Value::Array(parts)) = single_key(map, "Fn::GetAtt") {
        return parts.first().and_then(Value::as_str);
    }
    None
}

/// Export name when the value is a bare `Fn::ImportValue`
pub fn import_name(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    single_key(map, "Fn::ImportValue").and_then(Value::as_str)
}
