//! Export names shared by the base stack and its consumers.
//!
//! These strings are the only contract between producer and consumer
//! stacks: renaming one on the producer side without updating the
//! consumer breaks synthesis with an unresolved import.

use core_config::{ConfigError, FromEnv, env_or_default};

pub const DEFAULT_EXPORT_PREFIX: &str = "Base";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportNames {
    pub vpc_id: String,
    pub bucket_name: String,
    pub database_endpoint: String,
    pub database_name: String,
    pub ec2_security_group_id: String,
    pub db_security_group_id: String,
    pub database_secret_arn: String,
    pub isolated_subnet_id: String,
    pub isolated_subnet_az: String,
}

impl ExportNames {
    /// `{prefix}VpcId`, `{prefix}BucketName`, ...
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            vpc_id: format!("{}VpcId", prefix),
            bucket_name: format!("{}BucketName", prefix),
            database_endpoint: format!("{}DatabaseEndpoint", prefix),
            database_name: format!("{}DatabaseName", prefix),
            ec2_security_group_id: format!("{}Ec2SecurityGroupId", prefix),
            db_security_group_id: format!("{}DbSecurityGroupId", prefix),
            database_secret_arn: format!("{}DatabaseSecretArn", prefix),
            isolated_subnet_id: format!("{}IsolatedSubnetId", prefix),
            isolated_subnet_az: format!("{}IsolatedSubnetAz", prefix),
        }
    }

    pub fn all(&self) -> [&str; 9] {
        [
            self.vpc_id.as_str(),
            self.bucket_name.as_str(),
            self.database_endpoint.as_str(),
            self.database_name.as_str(),
            self.ec2_security_group_id.as_str(),
            self.db_security_group_id.as_str(),
            self.database_secret_arn.as_str(),
            self.isolated_subnet_id.as_str(),
            self.isolated_subnet_az.as_str(),
        ]
    }
}

impl Default for ExportNames {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_EXPORT_PREFIX)
    }
}

impl FromEnv for ExportNames {
    fn from_env() -> Result<Self, ConfigError> {
        let prefix = env_or_default("EXPORT_PREFIX", DEFAULT_EXPORT_PREFIX);
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::Invalid(format!(
                "EXPORT_PREFIX '{}' must be alphanumeric",
                prefix
            )));
        }
        Ok(Self::with_prefix(&prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let names = ExportNames::default();
        assert_eq!(names.vpc_id, "BaseVpcId");
        assert_eq!(names.bucket_name, "BaseBucketName");
        assert_eq!(names.database_endpoint, "BaseDatabaseEndpoint");
        assert_eq!(names.database_name, "BaseDatabaseName");
        assert_eq!(names.ec2_security_group_id, "BaseEc2SecurityGroupId");
        assert_eq!(names.db_security_group_id, "BaseDbSecurityGroupId");
    }

    #[test]
    fn test_prefix_from_env() {
        temp_env::with_var("EXPORT_PREFIX", Some("Staging"), || {
            let names = ExportNames::from_env().unwrap();
            assert_eq!(names.vpc_id, "StagingVpcId");
        });
        temp_env::with_var("EXPORT_PREFIX", Some("bad-prefix"), || {
            assert!(ExportNames::from_env().is_err());
        });
    }
}
