use async_trait::async_trait;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, FromQueryResult,
    Statement,
};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{EtlError, EtlResult};
use crate::models::{DEFAULT_SCHEMA, JobArguments, TableData, quote_identifier, validate_identifier};
use crate::repository::TableSource;
use crate::retry::{RetryPolicy, retry};

#[derive(Debug, FromQueryResult)]
struct ColumnRow {
    column_name: String,
}

/// Connect with a small pool; the job reads tables one at a time
pub async fn connect(database_url: &str, policy: &RetryPolicy) -> EtlResult<DatabaseConnection> {
    let db = retry("postgres connect", policy, || {
        let mut opt = ConnectOptions::new(database_url);
        opt.max_connections(2)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .sqlx_logging(false);
        Database::connect(opt)
    })
    .await?;

    info!("Connected to PostgreSQL");
    Ok(db)
}

/// Reads whole tables, every column cast to text
pub struct PgTableSource {
    db: DatabaseConnection,
    schema: String,
}

impl PgTableSource {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub async fn connect(args: &JobArguments, policy: &RetryPolicy) -> EtlResult<Self> {
        let db = connect(&args.connection_url(), policy).await?;
        Ok(Self::new(db))
    }

    async fn columns(&self, table: &str) -> EtlResult<Vec<String>> {
        let sql = r#"
            SELECT column_name::text AS column_name
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
        "#;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [self.schema.clone().into(), table.into()],
        );
        let rows = ColumnRow::find_by_statement(stmt).all(&self.db).await?;
        Ok(rows.into_iter().map(|r| r.column_name).collect())
    }
}

/// `SELECT "a"::text AS "a", ... FROM "schema"."table"`
pub fn select_as_text(schema: &str, table: &str, columns: &[String]) -> String {
    let projection = columns
        .iter()
        .map(|c| {
            let quoted = quote_identifier(c);
            format!("{quoted}::text AS {quoted}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM {}.{}",
        projection,
        quote_identifier(schema),
        quote_identifier(table)
    )
}

#[async_trait]
impl TableSource for PgTableSource {
    #[instrument(skip(self), fields(schema = %self.schema))]
    async fn fetch_table(&self, table: &str) -> EtlResult<TableData> {
        validate_identifier(table)?;

        let columns = self.columns(table).await?;
        if columns.is_empty() {
            return Err(EtlError::TableNotFound(table.to_string()));
        }

        let sql = select_as_text(&self.schema, table, &columns);
        debug!(%sql, "Reading table");
        let rows = self
            .db
            .query_all_raw(Statement::from_string(DbBackend::Postgres, sql))
            .await?;

        let mut data = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                values.push(row.try_get::<Option<String>>("", column)?);
            }
            data.push(values);
        }

        Ok(TableData {
            name: table.to_string(),
            columns,
            rows: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_quotes_every_identifier() {
        let sql = select_as_text(
            "public",
            "InvoiceLine",
            &["InvoiceLineId".to_string(), "UnitPrice".to_string()],
        );
        assert_eq!(
            sql,
            r#"SELECT "InvoiceLineId"::text AS "InvoiceLineId", "UnitPrice"::text AS "UnitPrice" FROM "public"."InvoiceLine""#
        );
    }
}
