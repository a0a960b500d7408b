//! Raw batch archival to object storage
//!
//! After a committed load the extracted batch can be written as CSV under
//! `raw/{job_name}/{yyyy}/{mm}/{dd}/{run_id}.csv`.

use async_trait::async_trait;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use batchflow_common::TabularBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{EtlError, EtlResult};

/// Minimal object storage surface
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> EtlResult<()>;

    async fn get(&self, key: &str) -> EtlResult<Vec<u8>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket: env::var("S3_BUCKET").unwrap_or_else(|_| "batchflow-archive".to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }
}

/// S3 (or MinIO) bucket
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(config: StorageConfig) -> Self {
        let credentials = aws_credential_types::Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "batchflow-archive",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(bucket = %config.bucket, "Archive storage client initialized");
        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>) -> EtlResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("text/csv")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| EtlError::Storage(format!("upload of {} failed: {}", key, e)))?;
        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> EtlResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| EtlError::Storage(format!("download of {} failed: {}", key, e)))?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| EtlError::Storage(format!("reading {} failed: {}", key, e)))?
            .into_bytes()
            .to_vec();
        Ok(data)
    }
}

/// Objects kept in memory, for tests
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> EtlResult<()> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> EtlResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| EtlError::Storage(format!("no object at {}", key)))
    }
}

/// Where an archived batch was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReceipt {
    pub key: String,
    pub sha256: String,
    pub size: usize,
}

pub fn archive_key(job_name: &str, run_id: Uuid, at: DateTime<Utc>) -> String {
    format!("raw/{}/{}/{}.csv", job_name, at.format("%Y/%m/%d"), run_id)
}

/// Header line plus one CSV record per row; nulls are empty cells
pub fn batch_to_csv(batch: &TabularBatch) -> EtlResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let write_err = |e: csv::Error| EtlError::Storage(format!("CSV encoding failed: {}", e));

    writer.write_record(batch.schema().names()).map_err(write_err)?;
    for row in batch.rows() {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .map_err(write_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| EtlError::Storage(format!("CSV encoding failed: {}", e)))
}

fn calculate_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Write `batch` as CSV under the archive key for this run
pub async fn archive_batch(
    store: &dyn ObjectStore,
    job_name: &str,
    run_id: Uuid,
    batch: &TabularBatch,
) -> EtlResult<ArchiveReceipt> {
    let bytes = batch_to_csv(batch)?;
    let key = archive_key(job_name, run_id, Utc::now());
    let receipt = ArchiveReceipt {
        sha256: calculate_sha256(&bytes),
        size: bytes.len(),
        key: key.clone(),
    };
    store.put(&key, bytes).await?;
    info!(job = job_name, key = %receipt.key, size = receipt.size, "Archived raw batch");
    Ok(receipt)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use batchflow_common::{Column, ColumnType, Schema, Value};
    use chrono::TimeZone;

    #[test]
    fn test_archive_key_layout() {
        let run_id = Uuid::nil();
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(
            archive_key("orders", run_id, at),
            format!("raw/orders/2024/03/07/{}.csv", run_id)
        );
    }

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "archive");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.path_style);
    }

    #[tokio::test]
    async fn test_archive_round_trip_through_memory_store() {
        let schema = Schema::new(vec![
            Column::new("id", ColumnType::Int),
            Column::new("note", ColumnType::String),
        ])
        .unwrap();
        let batch = TabularBatch::from_rows(
            schema,
            vec![
                vec![Value::Int(1), Value::from("a,b")],
                vec![Value::Int(2), Value::Null],
            ],
        )
        .unwrap();

        let store = MemoryObjectStore::new();
        let receipt = archive_batch(&store, "orders", Uuid::new_v4(), &batch)
            .await
            .unwrap();

        let stored = store.get(&receipt.key).await.unwrap();
        assert_eq!(String::from_utf8(stored).unwrap(), "id,note\n1,\"a,b\"\n2,\n");
        assert_eq!(receipt.sha256.len(), 64);
        assert_eq!(store.keys(), vec![receipt.key]);
    }
}
