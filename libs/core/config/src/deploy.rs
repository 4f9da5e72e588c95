use crate::{env_optional, ConfigError, FromEnv};

pub const DEFAULT_REGION: &str = "ap-southeast-1";

/// Account and region a stack is synthesized for.
///
/// The account is optional: without it the templates stay
/// environment-agnostic and the deploying credentials decide.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployTarget {
    pub account: Option<String>,
    pub region: String,
}

impl DeployTarget {
    pub fn new(account: Option<String>, region: impl Into<String>) -> Self {
        Self {
            account,
            region: region.into(),
        }
    }

    /// Human readable `aws://account/region`, `unknown-account` when unset
    pub fn uri(&self) -> String {
        format!(
            "aws://{}/{}",
            self.account.as_deref().unwrap_or("unknown-account"),
            self.region
        )
    }
}

impl FromEnv for DeployTarget {
    /// Reads, first match wins:
    /// - account: INFRA_ACCOUNT, CDK_DEFAULT_ACCOUNT
    /// - region: INFRA_REGION, CDK_DEFAULT_REGION, AWS_REGION (default ap-southeast-1)
    fn from_env() -> Result<Self, ConfigError> {
        let account = env_optional("INFRA_ACCOUNT").or_else(|| env_optional("CDK_DEFAULT_ACCOUNT"));

        if let Some(ref id) = account {
            if id.len() != 12 || !id.chars().all(|c| c.is_ascii_digit()) {
                return Err(ConfigError::ParseError {
                    key: "INFRA_ACCOUNT".to_string(),
                    details: format!("'{}' is not a 12 digit account id", id),
                });
            }
        }

        let region = env_optional("INFRA_REGION")
            .or_else(|| env_optional("CDK_DEFAULT_REGION"))
            .or_else(|| env_optional("AWS_REGION"))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        Ok(Self { account, region })
    }
}

impl Default for DeployTarget {
    fn default() -> Self {
        Self::new(None, DEFAULT_REGION)
    }
}
