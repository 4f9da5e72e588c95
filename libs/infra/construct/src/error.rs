use thiserror::Error;

pub type SynthResult<T> = Result<T, SynthError>;

/// Everything that aborts synthesis.
///
/// Synthesis is all-or-nothing: the first error stops the app and no
/// template is written.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("Invalid CIDR '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("Address space {parent} exhausted while allocating a /{mask} block")]
    AddressSpaceExhausted { parent: String, mask: u8 },

    #[error("Subnet {first} overlaps subnet {second}")]
    OverlappingSubnets { first: String, second: String },

    #[error("Subnet {subnet} is outside of VPC block {parent}")]
    SubnetOutsideVpc { subnet: String, parent: String },

    #[error("Invalid network configuration for '{construct}': {reason}")]
    InvalidNetwork { construct: String, reason: String },

    #[error("Duplicate logical id '{logical_id}' in stack '{stack}'")]
    DuplicateLogicalId { stack: String, logical_id: String },

    #[error("Duplicate output '{output}' in stack '{stack}'")]
    DuplicateOutput { stack: String, output: String },

    #[error("Unknown security group '{0}'")]
    UnknownSecurityGroup(String),

    #[error("Invalid property on '{construct}': {reason}")]
    InvalidProperty { construct: String, reason: String },

    #[error("Database '{construct}' is not publicly accessible but is placed in {subnet_type} subnets")]
    DatabasePlacement { construct: String, subnet_type: String },

    #[error(
        "Database port {port} is reachable from an unrestricted source via security group '{security_group}' in stack '{stack}'"
    )]
    DatabaseExposed {
        stack: String,
        security_group: String,
        port: u16,
    },

    #[error("Invalid bucket name '{name}': {reason}")]
    InvalidBucketName { name: String, reason: String },

    #[error("Duplicate stack name '{0}'")]
    DuplicateStack(String),

    #[error("Unknown stack '{0}'")]
    UnknownStack(String),

    #[error("Export '{export}' is produced by both '{first}' and '{second}'")]
    DuplicateExport {
        export: String,
        first: String,
        second: String,
    },

    #[error("Stack '{stack}' imports '{export}' which no stack exports")]
    UnresolvedImport { stack: String, export: String },

    #[error("Stack '{stack}' imports its own export '{export}'")]
    SelfImport { stack: String, export: String },

    #[error("Cyclic dependency between stacks: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Failed to serialize template: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write cloud assembly: {0}")]
    Io(#[from] std::io::Error),
}

impl SynthError {
    pub(crate) fn property(construct: &str, reason: impl Into<String>) -> Self {
        Self::InvalidProperty {
            construct: construct.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn network(construct: &str, reason: impl Into<String>) -> Self {
        Self::InvalidNetwork {
            construct: construct.to_string(),
            reason: reason.into(),
        }
    }
}
