//! Chinook ETL job
//!
//! Run by the managed job runner with `--KEY value` parameters. Reads each
//! requested table from Postgres and writes it as CSV to the output bucket.
//! Exits non-zero when any table failed.

use core_config::Environment;
use core_config::tracing::{init_tracing, install_color_eyre};
use domain_etl::{EtlService, JobArguments, PgTableSource, RetryPolicy, S3ObjectSink};
use eyre::{Result, WrapErr, eyre};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let args = JobArguments::resolve(std::env::args().skip(1))
        .wrap_err("Invalid job arguments")?;
    info!(
        endpoint = %args.db_endpoint,
        database = %args.db_name,
        bucket = %args.output_bucket,
        tables = args.tables.len(),
        "Starting Chinook ETL"
    );

    let policy = RetryPolicy::new().with_max_retries(5);
    let source = PgTableSource::connect(&args, &policy)
        .await
        .wrap_err("Database connection failed")?;
    let sink = S3ObjectSink::from_env().await;

    let service = EtlService::new(source, sink, &args.output_bucket, &args.key_prefix);
    let report = service.run(&args.tables).await;

    for exported in &report.exported {
        info!(table = %exported.table, key = %exported.key, rows = exported.rows, "Uploaded");
    }
    if !report.is_success() {
        for (table, reason) in &report.failed {
            error!(table = %table, reason = %reason, "Table not exported");
        }
        return Err(eyre!(
            "{} of {} tables failed",
            report.failed.len(),
            args.tables.len()
        ));
    }

    Ok(())
}
