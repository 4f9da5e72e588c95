//! Cross-stack reachability audit of database ports.
//!
//! Works on synthesized templates so rules added from any stack (inline,
//! standalone, or on an imported group id) are all seen.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::cidr::is_unrestricted_cidr;
use crate::database::POSTGRES_PORT;
use crate::error::{SynthError, SynthResult};
use crate::template::{Template, import_name, target_logical_id};

/// A rule admitting the whole internet to a database port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exposure {
    /// Stack declaring the offending rule
    pub stack: String,
    /// `(stack, logical id)` of the security group the rule opens
    pub group: (String, String),
    pub database: String,
    pub port: u16,
}

impl From<Exposure> for SynthError {
    fn from(value: Exposure) -> Self {
        SynthError::DatabaseExposed {
            stack: value.stack,
            security_group: value.group.1,
            port: value.port,
        }
    }
}

type GroupKey = (String, String);

struct Index<'a> {
    stacks: &'a [(String, Template)],
    exports: BTreeMap<&'a str, (&'a str, &'a Value)>,
}

impl<'a> Index<'a> {
    fn new(stacks: &'a [(String, Template)]) -> Self {
        let mut exports = BTreeMap::new();
        for (name, template) in stacks {
            for output in template.outputs.values() {
                if let Some(export) = &output.export {
                    exports.insert(export.name.as_str(), (name.as_str(), &output.value));
                }
            }
        }
        Self { stacks, exports }
    }

    /// Resolve a group id expression used in `stack` to the declaring stack
    /// and logical id, following imports through the export index.
    fn resolve_group(&self, stack: &str, value: &Value) -> Option<GroupKey> {
        if let Some(id) = target_logical_id(value) {
            return Some((stack.to_string(), id.to_string()));
        }
        let export = import_name(value)?;
        let (producer, exported) = self.exports.get(export)?;
        target_logical_id(exported).map(|id| (producer.to_string(), id.to_string()))
    }

    /// Every ingress rule object attached to `group`, with the stack that declares it
    fn rules_for(&self, group: &GroupKey) -> Vec<(&'a str, &'a Value)> {
        let mut rules = Vec::new();
        for (name, template) in self.stacks {
            if *name == group.0 {
                if let Some(sg) = template.resources.get(&group.1) {
                    if let Some(Value::Array(inline)) = sg.property("SecurityGroupIngress") {
                        rules.extend(inline.iter().map(|r| (name.as_str(), r)));
                    }
                }
            }
            for (_, resource) in template.resources_of_type("AWS::EC2::SecurityGroupIngress") {
                let target = resource
                    .property("GroupId")
                    .and_then(|v| self.resolve_group(name, v));
                if target.as_ref() == Some(group) {
                    rules.push((name.as_str(), &resource.properties));
                }
            }
        }
        rules
    }
}

fn is_unrestricted(rule: &Value) -> bool {
    ["CidrIp", "CidrIpv6"]
        .iter()
        .filter_map(|key| rule.get(*key).and_then(Value::as_str))
        .any(is_unrestricted_cidr)
}

fn as_port(value: Option<&Value>) -> Option<u16> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn covers_tcp(rule: &Value, port: u16) -> bool {
    let protocol = match rule.get("IpProtocol") {
        Some(Value::String(p)) => p.as_str(),
        Some(Value::Number(n)) if n.as_i64() == Some(-1) => "-1",
        Some(Value::Number(n)) if n.as_i64() == Some(6) => "tcp",
        _ => return false,
    };
    match protocol {
        "-1" => true,
        "tcp" | "6" => {
            let from = as_port(rule.get("FromPort")).unwrap_or(0);
            let to = as_port(rule.get("ToPort")).unwrap_or(u16::MAX);
            from <= port && port <= to
        }
        _ => false,
    }
}

fn database_port(properties: &Value) -> u16 {
    as_port(properties.get("Port")).unwrap_or(POSTGRES_PORT)
}

/// Find every unrestricted allow-rule reaching a database port.
pub fn find_database_exposures(stacks: &[(String, Template)]) -> Vec<Exposure> {
    let index = Index::new(stacks);
    let mut exposures = Vec::new();

    for (name, template) in stacks {
        for (db_id, db) in template.resources_of_type("AWS::RDS::DBInstance") {
            let port = database_port(&db.properties);
            let groups = match db.property("VPCSecurityGroups") {
                Some(Value::Array(groups)) => groups,
                _ => continue,
            };
            for group in groups.iter().filter_map(|g| index.resolve_group(name, g)) {
                for (rule_stack, rule) in index.rules_for(&group) {
                    if is_unrestricted(rule) && covers_tcp(rule, port) {
                        exposures.push(Exposure {
                            stack: rule_stack.to_string(),
                            group: group.clone(),
                            database: format!("{}/{}", name, db_id),
                            port,
                        });
                    }
                }
            }
        }
    }
    exposures
}

/// Fail on the first database reachable from an unrestricted source
pub fn check_database_exposure(stacks: &[(String, Template)]) -> SynthResult<()> {
    match find_database_exposures(stacks).into_iter().next() {
        Some(exposure) => Err(exposure.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{Expr, Output, Resource};
    use serde_json::json;

    fn base(ingress: Value) -> Template {
        let mut template = Template::default();
        template.resources.insert(
            "DbSg".into(),
            Resource::new(
                "AWS::EC2::SecurityGroup",
                json!({ "GroupDescription": "db", "SecurityGroupIngress": ingress }),
            ),
        );
        template.resources.insert(
            "Db".into(),
            Resource::new(
                "AWS::RDS::DBInstance",
                json!({ "Port": "5432", "VPCSecurityGroups": [Expr::get_att("DbSg", "GroupId").to_json()] }),
            ),
        );
        template.outputs.insert(
            "DbSgId".into(),
            Output::new(Expr::get_att("DbSg", "GroupId")).with_export("BaseDbSecurityGroupId"),
        );
        template
    }

    #[test]
    fn test_inline_world_rule_on_db_port_is_reported() {
        let stacks = vec![(
            "Base".to_string(),
            base(json!([{ "CidrIp": "0.0.0.0/0", "IpProtocol": "tcp", "FromPort": 5432, "ToPort": 5432 }])),
        )];
        let exposures = find_database_exposures(&stacks);
        assert_eq!(exposures.len(), 1);
        assert_eq!(exposures[0].group, ("Base".to_string(), "DbSg".to_string()));
        assert!(matches!(
            check_database_exposure(&stacks),
            Err(SynthError::DatabaseExposed { port: 5432, .. })
        ));
    }

    #[test]
    fn test_world_rule_on_other_port_or_restricted_source_is_fine() {
        let stacks = vec![(
            "Base".to_string(),
            base(json!([
                { "CidrIp": "0.0.0.0/0", "IpProtocol": "tcp", "FromPort": 80, "ToPort": 80 },
                { "CidrIp": "10.0.0.0/16", "IpProtocol": "-1" },
            ])),
        )];
        assert!(check_database_exposure(&stacks).is_ok());
    }

    #[test]
    fn test_non_canonical_world_spellings_are_reported() {
        for (key, cidr) in [("CidrIpv6", "0::/0"), ("CidrIpv6", "::0/0"), ("CidrIp", "0.0.0.0/00")] {
            let stacks = vec![(
                "Base".to_string(),
                base(json!([{ key: cidr, "IpProtocol": "tcp", "FromPort": 5432, "ToPort": 5432 }])),
            )];
            assert_eq!(find_database_exposures(&stacks).len(), 1, "{} {}", key, cidr);
        }
    }

    #[test]
    fn test_rule_on_imported_group_from_other_stack_is_reported() {
        let mut consumer = Template::default();
        consumer.resources.insert(
            "Open".into(),
            Resource::new(
                "AWS::EC2::SecurityGroupIngress",
                json!({
                    "GroupId": Expr::import("BaseDbSecurityGroupId").to_json(),
                    "CidrIpv6": "::/0",
                    "IpProtocol": "-1",
                }),
            ),
        );
        let stacks = vec![
            ("Base".to_string(), base(json!([]))),
            ("Etl".to_string(), consumer),
        ];
        let exposures = find_database_exposures(&stacks);
        assert_eq!(exposures.len(), 1);
        assert_eq!(exposures[0].stack, "Etl");
        assert_eq!(exposures[0].database, "Base/Db");
    }
}
