use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

use crate::error::{EtlError, EtlResult};
use crate::repository::ObjectSink;

pub const CSV_CONTENT_TYPE: &str = "text/csv";

/// Writes CSV objects to S3
#[derive(Clone)]
pub struct S3ObjectSink {
    client: Client,
}

impl S3ObjectSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Default credential chain; `AWS_REGION` picks the region when set
    pub async fn from_env() -> Self {
        let mut loader = aws_config::from_env();
        if let Ok(region) = std::env::var("AWS_REGION") {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl ObjectSink for S3ObjectSink {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> EtlResult<()> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(CSV_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| EtlError::Storage(format!("s3://{}/{}: {}", bucket, key, e)))?;
        debug!(bucket, key, size, "Wrote object");
        Ok(())
    }
}
