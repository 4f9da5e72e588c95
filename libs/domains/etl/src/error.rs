use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Missing job argument --{0}")]
    MissingArgument(String),

    #[error("Invalid job argument --{key}: {details}")]
    InvalidArgument { key: String, details: String },

    #[error("Invalid table identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Table '{0}' not found or has no columns")]
    TableNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Failed to encode CSV: {0}")]
    Encoding(String),

    #[error("Object storage error: {0}")]
    Storage(String),
}

pub type EtlResult<T> = Result<T, EtlError>;

impl From<sea_orm::DbErr> for EtlError {
    fn from(err: sea_orm::DbErr) -> Self {
        EtlError::Database(err.to_string())
    }
}

impl From<csv::Error> for EtlError {
    fn from(err: csv::Error) -> Self {
        EtlError::Encoding(err.to_string())
    }
}
