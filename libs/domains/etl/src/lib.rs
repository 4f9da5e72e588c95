//! Chinook extract job: read tables from Postgres, write CSV objects to S3.

pub mod error;
pub mod models;
pub mod postgres;
pub mod repository;
pub mod retry;
pub mod s3;
pub mod service;

pub use error::{EtlError, EtlResult};
pub use models::{
    CHINOOK_TABLES, DEFAULT_KEY_PREFIX, JobArguments, REQUIRED_ARGUMENTS, TableData, object_key,
};
pub use postgres::PgTableSource;
pub use repository::{InMemoryObjectSink, InMemoryTableSource, ObjectSink, TableSource};
pub use retry::RetryPolicy;
pub use s3::S3ObjectSink;
pub use service::{EtlService, ExportedTable, RunReport};
