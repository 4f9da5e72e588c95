//! Managed Postgres on RDS with generated credentials.

use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use tracing::debug;

use crate::compute::InstanceType;
use crate::error::{SynthError, SynthResult};
use crate::network::{SubnetSelection, SubnetType, VpcHandle};
use crate::security_group::{IngressRule, Peer, Port, SecurityGroupHandle};
use crate::stack::{Construct, Stack, logical_id};
use crate::template::{Expr, RemovalPolicy, Resource};

pub const POSTGRES_PORT: u16 = 5432;
pub const MIN_ALLOCATED_STORAGE: u32 = 20;
pub const MAX_ALLOCATED_STORAGE: u32 = 65536;
const SUPPORTED_POSTGRES: std::ops::RangeInclusive<u8> = 11..=16;
const RESERVED_USERNAMES: &[&str] = &["admin", "rdsadmin", "root", "user", "public"];
const PASSWORD_EXCLUDED_CHARS: &str = " %+~`#$&*()|[]{}:;<>?!'/@\"\\";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    Postgres { major_version: u8 },
}

impl DatabaseEngine {
    pub fn postgres(major_version: u8) -> Self {
        DatabaseEngine::Postgres { major_version }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DatabaseEngine::Postgres { .. } => "postgres",
        }
    }

    pub fn version(&self) -> String {
        match self {
            DatabaseEngine::Postgres { major_version } => major_version.to_string(),
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseEngine::Postgres { .. } => POSTGRES_PORT,
        }
    }

    fn validate(&self, construct: &str) -> SynthResult<()> {
        match self {
            DatabaseEngine::Postgres { major_version } => {
                if !SUPPORTED_POSTGRES.contains(major_version) {
                    return Err(SynthError::property(
                        construct,
                        format!(
                            "postgres {} is not supported (expected {}..={})",
                            major_version,
                            SUPPORTED_POSTGRES.start(),
                            SUPPORTED_POSTGRES.end()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseInstance {
    id: String,
    vpc: VpcHandle,
    engine: DatabaseEngine,
    instance_type: InstanceType,
    allocated_storage: u32,
    max_allocated_storage: Option<u32>,
    subnets: SubnetSelection,
    security_groups: Vec<SecurityGroupHandle>,
    publicly_accessible: bool,
    removal_policy: RemovalPolicy,
    deletion_protection: bool,
    database_name: Option<String>,
    username: String,
    port: Option<u16>,
}

impl DatabaseInstance {
    pub fn new(id: &str, vpc: &VpcHandle, engine: DatabaseEngine, instance_type: InstanceType) -> Self {
        Self {
            id: logical_id(&[id]),
            vpc: vpc.clone(),
            engine,
            instance_type,
            allocated_storage: 100,
            max_allocated_storage: None,
            subnets: SubnetSelection::Type(SubnetType::PrivateIsolated),
            security_groups: Vec::new(),
            publicly_accessible: false,
            removal_policy: RemovalPolicy::Snapshot,
            deletion_protection: false,
            database_name: None,
            username: "postgres".to_string(),
            port: None,
        }
    }

    pub fn storage(mut self, allocated: u32, max_allocated: Option<u32>) -> Self {
        self.allocated_storage = allocated;
        self.max_allocated_storage = max_allocated;
        self
    }

    pub fn subnets(mut self, selection: SubnetSelection) -> Self {
        self.subnets = selection;
        self
    }

    pub fn security_group(mut self, group: &SecurityGroupHandle) -> Self {
        self.security_groups.push(group.clone());
        self
    }

    pub fn publicly_accessible(mut self, public: bool) -> Self {
        self.publicly_accessible = public;
        self
    }

    pub fn removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    pub fn deletion_protection(mut self, enabled: bool) -> Self {
        self.deletion_protection = enabled;
        self
    }

    pub fn database_name(mut self, name: &str) -> Self {
        self.database_name = Some(name.to_string());
        self
    }

    pub fn username(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn validate(&self) -> SynthResult<()> {
        self.engine.validate(&self.id)?;
        if !(MIN_ALLOCATED_STORAGE..=MAX_ALLOCATED_STORAGE).contains(&self.allocated_storage) {
            return Err(SynthError::property(
                &self.id,
                format!(
                    "allocated storage {} GiB must be between {} and {}",
                    self.allocated_storage, MIN_ALLOCATED_STORAGE, MAX_ALLOCATED_STORAGE
                ),
            ));
        }
        if let Some(max) = self.max_allocated_storage {
            if max < self.allocated_storage || max > MAX_ALLOCATED_STORAGE {
                return Err(SynthError::property(
                    &self.id,
                    format!(
                        "max allocated storage {} GiB must be at least the allocated {} GiB",
                        max, self.allocated_storage
                    ),
                ));
            }
        }
        if self.security_groups.is_empty() {
            return Err(SynthError::property(&self.id, "at least one security group is required"));
        }
        if let Some(name) = &self.database_name {
            let valid = name.len() <= 63
                && name.starts_with(|c: char| c.is_ascii_alphabetic())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(SynthError::property(
                    &self.id,
                    format!("database name '{}' is invalid", name),
                ));
            }
        }
        let username_ok = !self.username.is_empty()
            && self.username.len() <= 16
            && self.username.starts_with(|c: char| c.is_ascii_alphabetic())
            && self.username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !RESERVED_USERNAMES.contains(&self.username.to_ascii_lowercase().as_str());
        if !username_ok {
            return Err(SynthError::property(
                &self.id,
                format!("master username '{}' is invalid or reserved", self.username),
            ));
        }
        Ok(())
    }
}

/// Declared database instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHandle {
    pub logical_id: String,
    pub endpoint_address: Expr,
    pub endpoint_port: Expr,
    pub secret_arn: Expr,
    pub port: u16,
    pub username: String,
    pub database_name: Option<String>,
    pub security_groups: Vec<SecurityGroupHandle>,
}

impl DatabaseHandle {
    /// Open the database port on every attached group to `peer`
    pub fn allow_default_port_from(
        &self,
        stack: &mut Stack,
        peer: Peer,
        description: &str,
    ) -> SynthResult<()> {
        for group in &self.security_groups {
            stack.add_ingress_rule(
                group,
                IngressRule::new(peer.clone(), Port::Tcp(self.port), description),
            )?;
        }
        Ok(())
    }
}

impl Construct for DatabaseInstance {
    type Handle = DatabaseHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<DatabaseHandle> {
        self.validate()?;
        let subnets = self.vpc.select(&self.subnets)?;
        if let Some(bad) = subnets.iter().find(|s| {
            if self.publicly_accessible {
                s.subnet_type != SubnetType::Public
            } else {
                s.subnet_type != SubnetType::PrivateIsolated
            }
        }) {
            if self.publicly_accessible {
                return Err(SynthError::property(
                    &self.id,
                    "publicly accessible databases must be placed in public subnets",
                ));
            }
            return Err(SynthError::DatabasePlacement {
                construct: self.id.clone(),
                subnet_type: bad.subnet_type.to_string(),
            });
        }
        let zones: BTreeSet<u32> = subnets.iter().map(|s| s.az_index).collect();
        if subnets.len() < 2 || zones.len() < 2 {
            return Err(SynthError::property(
                &self.id,
                "database subnet groups need subnets in at least two availability zones",
            ));
        }

        let port = self.port.unwrap_or_else(|| self.engine.default_port());
        let subnet_group = format!("{}SubnetGroup", self.id);
        let secret = format!("{}Secret", self.id);
        let attachment = format!("{}SecretAttachment", self.id);

        stack.add_resource(
            &subnet_group,
            Resource::new(
                "AWS::RDS::DBSubnetGroup",
                json!({
                    "DBSubnetGroupDescription": format!("Subnet group for {} database", self.id),
                    "SubnetIds": subnets.iter().map(|s| s.subnet_id.to_json()).collect::<Vec<_>>(),
                }),
            ),
        )?;

        stack.add_resource(
            &secret,
            Resource::new(
                "AWS::SecretsManager::Secret",
                json!({
                    "Description": format!("Generated credentials for {}/{}", stack.name(), self.id),
                    "GenerateSecretString": {
                        "ExcludeCharacters": PASSWORD_EXCLUDED_CHARS,
                        "GenerateStringKey": "password",
                        "PasswordLength": 30,
                        "SecretStringTemplate": json!({ "username": self.username }).to_string(),
                    },
                }),
            )
            .with_removal_policy(match self.removal_policy {
                RemovalPolicy::Snapshot => RemovalPolicy::Retain,
                other => other,
            }),
        )?;

        let secret_ref = Expr::reference(&secret);
        let mut props = Map::new();
        props.insert("AllocatedStorage".into(), json!(self.allocated_storage.to_string()));
        if let Some(max) = self.max_allocated_storage {
            props.insert("MaxAllocatedStorage".into(), json!(max));
        }
        props.insert("CopyTagsToSnapshot".into(), json!(true));
        props.insert("DBInstanceClass".into(), json!(self.instance_type.db_class()));
        props.insert("DBSubnetGroupName".into(), Expr::reference(&subnet_group).to_json());
        props.insert("DeletionProtection".into(), json!(self.deletion_protection));
        props.insert("Engine".into(), json!(self.engine.name()));
        props.insert("EngineVersion".into(), json!(self.engine.version()));
        props.insert(
            "MasterUsername".into(),
            Expr::secret_field(secret_ref.clone(), "username").to_json(),
        );
        props.insert(
            "MasterUserPassword".into(),
            Expr::secret_field(secret_ref.clone(), "password").to_json(),
        );
        props.insert("Port".into(), json!(port.to_string()));
        props.insert("PubliclyAccessible".into(), json!(self.publicly_accessible));
        props.insert("StorageType".into(), json!("gp2"));
        props.insert(
            "VPCSecurityGroups".into(),
            Value::Array(self.security_groups.iter().map(|g| g.group_id.to_json()).collect()),
        );
        if let Some(name) = &self.database_name {
            props.insert("DBName".into(), json!(name));
        }
        stack.add_resource(
            &self.id,
            Resource::new("AWS::RDS::DBInstance", Value::Object(props))
                .with_removal_policy(self.removal_policy),
        )?;

        stack.add_resource(
            &attachment,
            Resource::new(
                "AWS::SecretsManager::SecretTargetAttachment",
                json!({
                    "SecretId": secret_ref.to_json(),
                    "TargetId": Expr::reference(&self.id).to_json(),
                    "TargetType": "AWS::RDS::DBInstance",
                }),
            ),
        )?;
        debug!(
            stack = %stack.name(),
            database = %self.id,
            engine = self.engine.name(),
            version = %self.engine.version(),
            public = self.publicly_accessible,
            "Declared database"
        );

        Ok(DatabaseHandle {
            endpoint_address: Expr::get_att(&self.id, "Endpoint.Address"),
            endpoint_port: Expr::get_att(&self.id, "Endpoint.Port"),
            // the attachment ARN carries host/port once the instance exists
            secret_arn: Expr::reference(&attachment),
            logical_id: self.id,
            port,
            username: self.username,
            database_name: self.database_name,
            security_groups: self.security_groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{InstanceClass, InstanceSize};
    use crate::network::{SubnetConfiguration, Vpc};
    use crate::security_group::SecurityGroup;
    use core_config::deploy::DeployTarget;

    fn setup() -> (Stack, VpcHandle, SecurityGroupHandle) {
        let mut stack = Stack::new("Db", DeployTarget::default());
        let vpc = stack
            .add(
                Vpc::new("Vpc")
                    .cidr("10.0.0.0/22".parse().unwrap())
                    .max_azs(2)
                    .subnet_configuration(vec![
                        SubnetConfiguration::new("Public", SubnetType::Public).with_mask(24),
                        SubnetConfiguration::new("Private", SubnetType::PrivateIsolated)
                            .with_mask(24),
                    ]),
            )
            .unwrap();
        let sg = stack.add(SecurityGroup::new("DbSg", vpc.vpc_id.clone())).unwrap();
        (stack, vpc, sg)
    }

    fn postgres(vpc: &VpcHandle, sg: &SecurityGroupHandle) -> DatabaseInstance {
        DatabaseInstance::new(
            "Database",
            vpc,
            DatabaseEngine::postgres(13),
            InstanceType::of(InstanceClass::Burstable3, InstanceSize::Micro),
        )
        .storage(20, Some(100))
        .security_group(sg)
        .removal_policy(RemovalPolicy::Destroy)
    }

    #[test]
    fn test_database_renders_without_plaintext_credentials() {
        let (mut stack, vpc, sg) = setup();
        let db = stack.add(postgres(&vpc, &sg).database_name("chinook")).unwrap();
        let template = stack.synth().unwrap();
        let text = template.to_json_pretty().unwrap();

        let props = &template.resources["Database"].properties;
        assert_eq!(props["DBInstanceClass"], "db.t3.micro");
        assert_eq!(props["EngineVersion"], "13");
        assert_eq!(props["AllocatedStorage"], "20");
        assert_eq!(props["MaxAllocatedStorage"], 100);
        assert_eq!(props["PubliclyAccessible"], false);
        assert_eq!(
            template.resources["Database"].deletion_policy.as_deref(),
            Some("Delete")
        );
        assert!(props["MasterUserPassword"]["Fn::Join"][1][0]
            .as_str()
            .unwrap()
            .starts_with("{{resolve:secretsmanager:"));
        assert!(!text.contains("MasterUserPassword\": \""));
        assert_eq!(db.port, 5432);
        assert_eq!(db.endpoint_address, Expr::get_att("Database", "Endpoint.Address"));
    }

    #[test]
    fn test_private_database_rejects_public_subnets() {
        let (mut stack, vpc, sg) = setup();
        let err = stack
            .add(postgres(&vpc, &sg).subnets(SubnetSelection::Type(SubnetType::Public)))
            .unwrap_err();
        assert!(matches!(err, SynthError::DatabasePlacement { .. }));
    }

    #[test]
    fn test_public_database_requires_public_subnets() {
        let (mut stack, vpc, sg) = setup();
        assert!(stack
            .add(postgres(&vpc, &sg).publicly_accessible(true))
            .is_err());
        assert!(stack
            .add(
                postgres(&vpc, &sg)
                    .publicly_accessible(true)
                    .subnets(SubnetSelection::Type(SubnetType::Public))
            )
            .is_ok());
    }

    #[test]
    fn test_storage_and_version_bounds() {
        let (mut stack, vpc, sg) = setup();
        assert!(stack.add(postgres(&vpc, &sg).storage(10, None)).is_err());
        assert!(stack.add(postgres(&vpc, &sg).storage(50, Some(40))).is_err());
        let old = DatabaseInstance::new(
            "Old",
            &vpc,
            DatabaseEngine::postgres(9),
            InstanceType::of(InstanceClass::Burstable3, InstanceSize::Micro),
        )
        .security_group(&sg);
        assert!(stack.add(old).is_err());
        assert!(stack.add(postgres(&vpc, &sg).username("admin")).is_err());
    }

    #[test]
    fn test_allow_default_port_from_peer_group() {
        let (mut stack, vpc, sg) = setup();
        let app = stack.add(SecurityGroup::new("AppSg", vpc.vpc_id.clone())).unwrap();
        let db = stack.add(postgres(&vpc, &sg)).unwrap();
        db.allow_default_port_from(&mut stack, app.as_peer(), "from app")
            .unwrap();
        let rules = stack.effective_ingress(&[&sg]).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].port, Port::Tcp(5432));
        assert!(!rules[0].is_unrestricted());
    }
}
