use core_config::ConfigError;
use infra_construct::SynthError;
use thiserror::Error;
use validator::ValidationErrors;

#[derive(Debug, Error)]
pub enum StackConfigError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid stack configuration: {0}")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Synth(#[from] SynthError),

    #[error("ETL stack '{etl}' needs an S3 gateway endpoint in base stack '{base}'")]
    MissingS3Endpoint { base: String, etl: String },
}

pub type StacksResult<T> = Result<T, StackConfigError>;
