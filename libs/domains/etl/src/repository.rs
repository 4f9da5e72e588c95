use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{EtlError, EtlResult};
use crate::models::TableData;

/// Source of relational tables
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Read every row of `table`, columns in declaration order
    async fn fetch_table(&self, table: &str) -> EtlResult<TableData>;
}

/// Destination for extracted objects
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectSink: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> EtlResult<()>;
}

/// Tables held in memory, for local runs and tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryTableSource {
    tables: BTreeMap<String, TableData>,
}

impl InMemoryTableSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableData) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }
}

#[async_trait]
impl TableSource for InMemoryTableSource {
    async fn fetch_table(&self, table: &str) -> EtlResult<TableData> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| EtlError::TableNotFound(table.to_string()))
    }
}

/// Objects keyed by `(bucket, key)`
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectSink {
    objects: Arc<RwLock<BTreeMap<(String, String), Vec<u8>>>>,
}

impl InMemoryObjectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectSink for InMemoryObjectSink {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> EtlResult<()> {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }
}
