//! Env-driven settings for the stacks.
//!
//! Every value has a default matching the data-engineering training setup,
//! so an empty environment synthesizes the stock base + ETL pair.

use core_config::deploy::DeployTarget;
use core_config::{
    ConfigError, Environment, FromEnv, env_list, env_or_default, env_parse_optional,
    env_parse_or_default,
};
use infra_construct::compute::{InstanceClass, InstanceSize, InstanceType};
use infra_construct::{Ipv4Cidr, RemovalPolicy};
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use strum::{Display, EnumString};
use validator::{Validate, ValidationError};

use crate::exports::ExportNames;

static STACK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").unwrap());

static PREFIX_LIST_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pl-[0-9a-f]{8,17}$").unwrap());

static GLUE_JOB_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

fn validate_stack_name(name: &str) -> Result<(), ValidationError> {
    if !STACK_NAME.is_match(name) {
        return Err(ValidationError::new("invalid_stack_name"));
    }
    Ok(())
}

fn validate_prefix_list(id: &str) -> Result<(), ValidationError> {
    if !PREFIX_LIST_ID.is_match(id) {
        return Err(ValidationError::new("invalid_prefix_list_id"));
    }
    Ok(())
}

fn validate_bucket_name(name: &str) -> Result<(), ValidationError> {
    infra_construct::storage::validate_bucket_name(name)
        .map_err(|_| ValidationError::new("invalid_bucket_name"))
}

fn validate_job_name(name: &str) -> Result<(), ValidationError> {
    if !GLUE_JOB_NAME.is_match(name) {
        return Err(ValidationError::new("invalid_job_name"));
    }
    Ok(())
}

fn validate_s3_url(url: &str) -> Result<(), ValidationError> {
    match url.strip_prefix("s3://") {
        Some(rest) if rest.contains('/') => Ok(()),
        _ => Err(ValidationError::new("invalid_s3_url")),
    }
}

fn validate_base_bounds(config: &BaseStackConfig) -> Result<(), ValidationError> {
    if config.db_max_allocated_storage < config.db_allocated_storage {
        return Err(ValidationError::new("max_storage_below_allocated"));
    }
    if config.compute == ComputeMode::Asg
        && !(config.asg_min <= config.asg_desired && config.asg_desired <= config.asg_max)
    {
        return Err(ValidationError::new("asg_capacity_out_of_order"));
    }
    if config.bucket_auto_delete && config.removal_policy != RemovalPolicy::Destroy {
        return Err(ValidationError::new("auto_delete_requires_destroy"));
    }
    Ok(())
}

fn t3_micro() -> InstanceType {
    InstanceType::of(InstanceClass::Burstable3, InstanceSize::Micro)
}

/// How the base stack runs the dashboard host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ComputeMode {
    #[default]
    Instance,
    Asg,
}

/// Settings of the base stack
#[derive(Debug, Clone, Validate)]
#[validate(schema(function = "validate_base_bounds"))]
pub struct BaseStackConfig {
    #[validate(length(min = 1, max = 128), custom(function = "validate_stack_name"))]
    pub stack_name: String,
    pub vpc_cidr: Ipv4Cidr,
    #[validate(range(min = 2, max = 6))]
    pub max_azs: u32,
    #[validate(range(min = 16, max = 28))]
    pub subnet_mask: u8,
    pub dual_stack: bool,
    /// The isolated subnets have no NAT route; the ETL job reaches S3 through this
    pub s3_gateway_endpoint: bool,
    pub compute: ComputeMode,
    #[validate(range(max = 10))]
    pub asg_min: u32,
    #[validate(range(min = 1, max = 10))]
    pub asg_max: u32,
    pub asg_desired: u32,
    pub instance_type: InstanceType,
    #[validate(range(min = 8, max = 1024))]
    pub root_volume_gib: u32,
    /// EC2 Instance Connect prefix list; no SSH rule when unset
    #[validate(custom(function = "validate_prefix_list"))]
    pub instance_connect_prefix_list: Option<String>,
    #[validate(custom(function = "validate_bucket_name"))]
    pub bucket_name: Option<String>,
    pub removal_policy: RemovalPolicy,
    pub bucket_auto_delete: bool,
    pub db_instance_type: InstanceType,
    #[validate(range(min = 11, max = 16))]
    pub db_postgres_version: u8,
    #[validate(range(min = 20, max = 65536))]
    pub db_allocated_storage: u32,
    pub db_max_allocated_storage: u32,
    #[validate(length(min = 1, max = 63))]
    pub db_name: String,
    #[validate(length(min = 1, max = 1024))]
    pub health_check_path: String,
}

impl Default for BaseStackConfig {
    fn default() -> Self {
        Self {
            stack_name: "MyBaseStack".to_string(),
            vpc_cidr: Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 22).unwrap_or(Ipv4Cidr::any()),
            max_azs: 2,
            subnet_mask: 24,
            dual_stack: true,
            s3_gateway_endpoint: true,
            compute: ComputeMode::Instance,
            asg_min: 1,
            asg_max: 2,
            asg_desired: 1,
            instance_type: t3_micro(),
            root_volume_gib: 20,
            instance_connect_prefix_list: None,
            bucket_name: None,
            removal_policy: RemovalPolicy::Destroy,
            bucket_auto_delete: true,
            db_instance_type: t3_micro(),
            db_postgres_version: 13,
            db_allocated_storage: 20,
            db_max_allocated_storage: 100,
            db_name: "chinook".to_string(),
            health_check_path: "/api/health".to_string(),
        }
    }
}

impl FromEnv for BaseStackConfig {
    /// `BASE_*` variables. In production the bucket and database are
    /// retained by default instead of destroyed.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let production = Environment::from_env().is_production();
        let (removal_default, auto_delete_default) = if production {
            (RemovalPolicy::Retain, false)
        } else {
            (defaults.removal_policy, defaults.bucket_auto_delete)
        };

        let config = Self {
            stack_name: env_or_default("BASE_STACK_NAME", &defaults.stack_name),
            vpc_cidr: env_parse_or_default("BASE_VPC_CIDR", defaults.vpc_cidr)?,
            max_azs: env_parse_or_default("BASE_MAX_AZS", defaults.max_azs)?,
            subnet_mask: env_parse_or_default("BASE_SUBNET_MASK", defaults.subnet_mask)?,
            dual_stack: env_parse_or_default("BASE_DUAL_STACK", defaults.dual_stack)?,
            s3_gateway_endpoint: env_parse_or_default(
                "BASE_S3_GATEWAY_ENDPOINT",
                defaults.s3_gateway_endpoint,
            )?,
            compute: env_parse_or_default("BASE_COMPUTE", defaults.compute)?,
            asg_min: env_parse_or_default("BASE_ASG_MIN", defaults.asg_min)?,
            asg_max: env_parse_or_default("BASE_ASG_MAX", defaults.asg_max)?,
            asg_desired: env_parse_or_default("BASE_ASG_DESIRED", defaults.asg_desired)?,
            instance_type: env_parse_or_default("BASE_INSTANCE_TYPE", defaults.instance_type)?,
            root_volume_gib: env_parse_or_default("BASE_ROOT_VOLUME_GIB", defaults.root_volume_gib)?,
            instance_connect_prefix_list: env_parse_optional("BASE_INSTANCE_CONNECT_PREFIX_LIST")?,
            bucket_name: env_parse_optional("BASE_BUCKET_NAME")?,
            removal_policy: env_parse_or_default("BASE_REMOVAL_POLICY", removal_default)?,
            bucket_auto_delete: env_parse_or_default("BASE_BUCKET_AUTO_DELETE", auto_delete_default)?,
            db_instance_type: env_parse_or_default("BASE_DB_INSTANCE_TYPE", defaults.db_instance_type)?,
            db_postgres_version: env_parse_or_default(
                "BASE_DB_POSTGRES_VERSION",
                defaults.db_postgres_version,
            )?,
            db_allocated_storage: env_parse_or_default(
                "BASE_DB_ALLOCATED_STORAGE",
                defaults.db_allocated_storage,
            )?,
            db_max_allocated_storage: env_parse_or_default(
                "BASE_DB_MAX_ALLOCATED_STORAGE",
                defaults.db_max_allocated_storage,
            )?,
            db_name: env_or_default("BASE_DB_NAME", &defaults.db_name),
            health_check_path: env_or_default("BASE_HEALTH_CHECK_PATH", &defaults.health_check_path),
        };
        config.validate().map_err(invalid)?;
        Ok(config)
    }
}

/// Settings of the Glue ETL stack
#[derive(Debug, Clone, Validate)]
pub struct EtlStackConfig {
    pub enabled: bool,
    #[validate(length(min = 1, max = 128), custom(function = "validate_stack_name"))]
    pub stack_name: String,
    #[validate(length(min = 1, max = 255), custom(function = "validate_job_name"))]
    pub job_name: String,
    /// Launcher run by the Python shell job; defaults to
    /// `s3://{bucket}/scripts/run_chinook_etl.py` on the base bucket
    #[validate(custom(function = "validate_s3_url"))]
    pub script_location: Option<String>,
    /// `chinook-etl` binary fetched by the launcher; defaults to
    /// `s3://{bucket}/bin/chinook-etl` on the base bucket
    #[validate(custom(function = "validate_s3_url"))]
    pub binary_location: Option<String>,
    #[validate(range(min = 1))]
    pub db_port: u16,
    pub max_capacity: f64,
    #[validate(range(min = 1, max = 2880))]
    pub timeout_minutes: u32,
    #[validate(range(max = 10))]
    pub max_retries: u32,
    /// Tables to extract; the job's built-in list when empty
    pub tables: Vec<String>,
    #[validate(length(min = 1, max = 255))]
    pub key_prefix: String,
}

impl Default for EtlStackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stack_name: "MyETLBasicStack".to_string(),
            job_name: "chinook-etl".to_string(),
            script_location: None,
            binary_location: None,
            db_port: 5432,
            max_capacity: 0.0625,
            timeout_minutes: 60,
            max_retries: 0,
            tables: Vec::new(),
            key_prefix: "chinook".to_string(),
        }
    }
}

impl FromEnv for EtlStackConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            enabled: env_parse_or_default("ETL_ENABLED", defaults.enabled)?,
            stack_name: env_or_default("ETL_STACK_NAME", &defaults.stack_name),
            job_name: env_or_default("ETL_JOB_NAME", &defaults.job_name),
            script_location: env_parse_optional("ETL_SCRIPT_LOCATION")?,
            binary_location: env_parse_optional("ETL_BINARY_LOCATION")?,
            db_port: env_parse_or_default("ETL_DB_PORT", defaults.db_port)?,
            max_capacity: env_parse_or_default("ETL_MAX_CAPACITY", defaults.max_capacity)?,
            timeout_minutes: env_parse_or_default("ETL_TIMEOUT_MINUTES", defaults.timeout_minutes)?,
            max_retries: env_parse_or_default("ETL_MAX_RETRIES", defaults.max_retries)?,
            tables: env_list("ETL_TABLES").unwrap_or_default(),
            key_prefix: env_or_default("ETL_KEY_PREFIX", &defaults.key_prefix),
        };
        config.validate().map_err(invalid)?;
        Ok(config)
    }
}

/// Settings of the stand-alone public database stack
#[derive(Debug, Clone, Validate)]
pub struct SandboxConfig {
    #[validate(length(min = 1, max = 128), custom(function = "validate_stack_name"))]
    pub stack_name: String,
    /// Only source allowed to reach the database; the stack is skipped when unset
    pub trusted_cidr: Option<Ipv4Cidr>,
    pub db_instance_type: InstanceType,
    #[validate(range(min = 11, max = 16))]
    pub db_postgres_version: u8,
}

impl SandboxConfig {
    pub fn enabled(&self) -> bool {
        self.trusted_cidr.is_some()
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            stack_name: "MyStack".to_string(),
            trusted_cidr: None,
            db_instance_type: t3_micro(),
            db_postgres_version: 13,
        }
    }
}

impl FromEnv for SandboxConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            stack_name: env_or_default("SANDBOX_STACK_NAME", &defaults.stack_name),
            trusted_cidr: env_parse_optional("SANDBOX_TRUSTED_CIDR")?,
            db_instance_type: env_parse_or_default(
                "SANDBOX_DB_INSTANCE_TYPE",
                defaults.db_instance_type,
            )?,
            db_postgres_version: env_parse_or_default(
                "SANDBOX_DB_POSTGRES_VERSION",
                defaults.db_postgres_version,
            )?,
        };
        config.validate().map_err(invalid)?;
        Ok(config)
    }
}

/// Everything needed to assemble the app
#[derive(Debug, Clone, Default)]
pub struct InfraConfig {
    pub target: DeployTarget,
    pub exports: ExportNames,
    pub base: BaseStackConfig,
    pub etl: EtlStackConfig,
    pub sandbox: SandboxConfig,
}

impl FromEnv for InfraConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            target: DeployTarget::from_env()?,
            exports: ExportNames::from_env()?,
            base: BaseStackConfig::from_env()?,
            etl: EtlStackConfig::from_env()?,
            sandbox: SandboxConfig::from_env()?,
        })
    }
}

fn invalid(errors: validator::ValidationErrors) -> ConfigError {
    ConfigError::Invalid(errors.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(BaseStackConfig::default().validate().is_ok());
        assert!(EtlStackConfig::default().validate().is_ok());
        assert!(SandboxConfig::default().validate().is_ok());
        assert!(!SandboxConfig::default().enabled());
        assert_eq!(BaseStackConfig::default().vpc_cidr.to_string(), "10.0.0.0/22");
        assert!(BaseStackConfig::default().s3_gateway_endpoint);
    }

    #[test]
    fn test_base_from_env_overrides() {
        temp_env::with_vars(
            [
                ("APP_ENV", None),
                ("BASE_VPC_CIDR", Some("10.1.0.0/20")),
                ("BASE_COMPUTE", Some("ASG")),
                ("BASE_INSTANCE_TYPE", Some("t3.small")),
                ("BASE_INSTANCE_CONNECT_PREFIX_LIST", Some("pl-000f9420a91cfc3b6")),
            ],
            || {
                let config = BaseStackConfig::from_env().unwrap();
                assert_eq!(config.vpc_cidr.to_string(), "10.1.0.0/20");
                assert_eq!(config.compute, ComputeMode::Asg);
                assert_eq!(config.instance_type.to_string(), "t3.small");
                assert_eq!(
                    config.instance_connect_prefix_list.as_deref(),
                    Some("pl-000f9420a91cfc3b6")
                );
                assert_eq!(config.removal_policy, RemovalPolicy::Destroy);
            },
        );
    }

    #[test]
    fn test_base_production_retains_data() {
        temp_env::with_vars([("APP_ENV", Some("production")), ("BASE_BUCKET_AUTO_DELETE", None)], || {
            let config = BaseStackConfig::from_env().unwrap();
            assert_eq!(config.removal_policy, RemovalPolicy::Retain);
            assert!(!config.bucket_auto_delete);
        });
    }

    #[test]
    fn test_base_rejects_bad_values() {
        temp_env::with_var("BASE_VPC_CIDR", Some("10.0.0.1/22"), || {
            assert!(matches!(
                BaseStackConfig::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
        temp_env::with_var("BASE_INSTANCE_CONNECT_PREFIX_LIST", Some("sg-123"), || {
            assert!(matches!(BaseStackConfig::from_env(), Err(ConfigError::Invalid(_))));
        });
        temp_env::with_var("BASE_BUCKET_NAME", Some("Not_A_Bucket"), || {
            assert!(BaseStackConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_base_schema_checks() {
        let config = BaseStackConfig {
            db_max_allocated_storage: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BaseStackConfig {
            compute: ComputeMode::Asg,
            asg_min: 3,
            asg_desired: 2,
            asg_max: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BaseStackConfig {
            removal_policy: RemovalPolicy::Retain,
            bucket_auto_delete: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_etl_from_env() {
        temp_env::with_vars(
            [
                ("ETL_TABLES", Some("Album, Artist")),
                ("ETL_SCRIPT_LOCATION", Some("s3://artifacts/etl/chinook.py")),
            ],
            || {
                let config = EtlStackConfig::from_env().unwrap();
                assert_eq!(config.tables, vec!["Album", "Artist"]);
                assert_eq!(
                    config.script_location.as_deref(),
                    Some("s3://artifacts/etl/chinook.py")
                );
            },
        );
        temp_env::with_var("ETL_SCRIPT_LOCATION", Some("/local/chinook.py"), || {
            assert!(EtlStackConfig::from_env().is_err());
        });
        temp_env::with_var("ETL_BINARY_LOCATION", Some("s3://artifacts"), || {
            assert!(EtlStackConfig::from_env().is_err());
        });
        temp_env::with_var("ETL_JOB_NAME", Some("chinook etl"), || {
            assert!(EtlStackConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_sandbox_enabled_by_trusted_cidr() {
        temp_env::with_var("SANDBOX_TRUSTED_CIDR", Some("203.0.113.0/24"), || {
            let config = SandboxConfig::from_env().unwrap();
            assert!(config.enabled());
        });
    }
}
