use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::error::EtlResult;
use crate::models::{object_key, validate_identifier};
use crate::repository::{ObjectSink, TableSource};

/// One table written to the bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedTable {
    pub table: String,
    pub key: String,
    pub rows: usize,
}

/// Outcome of a run over several tables
#[derive(Debug, Default)]
pub struct RunReport {
    pub exported: Vec<ExportedTable>,
    pub failed: Vec<(String, String)>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Extracts tables from a source and writes each as CSV to a sink
pub struct EtlService<S: TableSource, O: ObjectSink> {
    source: Arc<S>,
    sink: Arc<O>,
    bucket: String,
    key_prefix: String,
}

impl<S: TableSource, O: ObjectSink> EtlService<S, O> {
    pub fn new(
        source: S,
        sink: O,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            source: Arc::new(source),
            sink: Arc::new(sink),
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Extract one table and upload it under a key stamped with `at`
    #[instrument(skip(self, at), fields(bucket = %self.bucket))]
    pub async fn export_table(&self, table: &str, at: DateTime<Utc>) -> EtlResult<ExportedTable> {
        validate_identifier(table)?;
        let data = self.source.fetch_table(table).await?;
        let body = data.to_csv()?;
        let key = object_key(&self.key_prefix, table, at);
        self.sink.put_object(&self.bucket, &key, body).await?;

        info!(table, key = %key, rows = data.row_count(), "Exported table");
        Ok(ExportedTable {
            table: table.to_string(),
            key,
            rows: data.row_count(),
        })
    }

    /// Export every table in order; a failing table is recorded and the
    /// rest still run
    pub async fn run(&self, tables: &[String]) -> RunReport {
        let mut report = RunReport::default();
        for table in tables {
            match self.export_table(table, Utc::now()).await {
                Ok(exported) => report.exported.push(exported),
                Err(e) => {
                    error!(table = %table, error = %e, "Failed to export table");
                    report.failed.push((table.clone(), e.to_string()));
                }
            }
        }
        info!(
            exported = report.exported.len(),
            failed = report.failed.len(),
            "ETL run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EtlError;
    use crate::models::TableData;
    use crate::repository::{MockObjectSink, MockTableSource};
    use chrono::TimeZone;
    use mockall::predicate::eq;

    fn genre() -> TableData {
        TableData {
            name: "Genre".into(),
            columns: vec!["GenreId".into(), "Name".into()],
            rows: vec![
                vec![Some("1".into()), Some("Rock".into())],
                vec![Some("2".into()), Some("Jazz".into())],
            ],
        }
    }

    #[tokio::test]
    async fn test_export_table_writes_csv_under_timestamped_key() {
        let mut source = MockTableSource::new();
        source
            .expect_fetch_table()
            .with(eq("Genre"))
            .times(1)
            .returning(|_| Ok(genre()));

        let mut sink = MockObjectSink::new();
        sink.expect_put_object()
            .withf(|bucket, key, body| {
                bucket == "training-bucket"
                    && key == "chinook/Genre/20240101_120000_Genre.csv"
                    && body.as_slice() == b"GenreId,Name\n1,Rock\n2,Jazz\n"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = EtlService::new(source, sink, "training-bucket", "chinook");
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let exported = service.export_table("Genre", at).await.unwrap();
        assert_eq!(exported.rows, 2);
        assert_eq!(exported.key, "chinook/Genre/20240101_120000_Genre.csv");
    }

    #[tokio::test]
    async fn test_invalid_table_never_reaches_source() {
        let source = MockTableSource::new();
        let sink = MockObjectSink::new();
        let service = EtlService::new(source, sink, "b", "p");
        let result = service.export_table("Genre; DROP", Utc::now()).await;
        assert!(matches!(result, Err(EtlError::InvalidIdentifier(_))));
    }

    #[tokio::test]
    async fn test_run_continues_after_failure() {
        let mut source = MockTableSource::new();
        source
            .expect_fetch_table()
            .with(eq("Missing"))
            .returning(|t| Err(EtlError::TableNotFound(t.to_string())));
        source
            .expect_fetch_table()
            .with(eq("Genre"))
            .returning(|_| Ok(genre()));

        let mut sink = MockObjectSink::new();
        sink.expect_put_object().times(1).returning(|_, _, _| Ok(()));

        let service = EtlService::new(source, sink, "b", "chinook");
        let report = service
            .run(&["Missing".to_string(), "Genre".to_string()])
            .await;
        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "Missing");
        assert_eq!(report.exported.len(), 1);
        assert_eq!(report.exported[0].table, "Genre");
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported() {
        let mut source = MockTableSource::new();
        source.expect_fetch_table().returning(|_| Ok(genre()));
        let mut sink = MockObjectSink::new();
        sink.expect_put_object()
            .returning(|_, _, _| Err(EtlError::Storage("access denied".into())));

        let service = EtlService::new(source, sink, "b", "chinook");
        let report = service.run(&["Genre".to_string()]).await;
        assert!(report.exported.is_empty());
        assert!(report.failed[0].1.contains("access denied"));
    }
}
