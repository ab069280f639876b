//! S3-compatible artifact store.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::SdkConfig;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;
use tracing::{debug, info};

use crate::body::ArtifactBody;
use crate::error::{StorageError, StorageResult};
use crate::store::{ArtifactInfo, ArtifactStore};

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Bucket (container) holding uploaded artifacts
    pub bucket_name: String,
    /// Custom S3 API endpoint (R2, MinIO, ...). `None` uses AWS endpoints.
    pub endpoint_url: Option<String>,
    /// Static access key ID. `None` uses the default credential chain.
    pub access_key_id: Option<String>,
    /// Static secret access key
    pub secret_access_key: Option<String>,
    /// Region ("auto" for R2)
    pub region: String,
}

impl S3Config {
    /// Create config from environment variables.
    ///
    /// `STORAGE_BUCKET` is required. Static credentials are used only when
    /// both key variables are set.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            bucket_name: std::env::var("STORAGE_BUCKET")
                .map_err(|_| StorageError::config_error("STORAGE_BUCKET not set"))?,
            endpoint_url: std::env::var("STORAGE_ENDPOINT_URL").ok(),
            access_key_id: std::env::var("STORAGE_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("STORAGE_SECRET_ACCESS_KEY").ok(),
            region: std::env::var("STORAGE_REGION").unwrap_or_else(|_| "auto".to_string()),
        })
    }

    fn static_credentials(&self) -> Option<Credentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Some(Credentials::new(id, secret, None, None, "intake-static")),
            _ => None,
        }
    }
}

/// Artifact store backed by an S3-compatible bucket.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Create a new client from configuration.
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket_name.trim().is_empty() {
            return Err(StorageError::config_error("bucket name is empty"));
        }

        let region = Region::new(config.region.clone());
        let mut builder = match config.static_credentials() {
            Some(credentials) => Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(credentials),
            None => {
                let shared: SdkConfig = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                Builder::from(&shared)
            }
        };

        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        info!(bucket = %config.bucket_name, endpoint = ?config.endpoint_url, "Configured S3 artifact store");

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket_name,
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> StorageResult<Self> {
        let config = S3Config::from_env()?;
        Self::new(config).await
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get_object(&self, key: &str) -> StorageResult<aws_sdk_s3::operation::get_object::GetObjectOutput> {
        self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::not_found(key)
                } else {
                    StorageError::download_failed(DisplayErrorContext(&e).to_string())
                }
            })
    }
}

fn to_chrono(ts: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| t.to_millis().ok())
        .and_then(DateTime::from_timestamp_millis)
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn head(&self, key: &str) -> StorageResult<Option<ArtifactInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(ArtifactInfo {
                key: key.to_string(),
                size: out.content_length().unwrap_or(0).max(0) as u64,
                content_type: out.content_type().map(str::to_string),
                last_modified: to_chrono(out.last_modified()),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                debug!("Artifact {} not found", key);
                Ok(None)
            }
            Err(e) => Err(StorageError::AwsSdk(DisplayErrorContext(&e).to_string())),
        }
    }

    async fn open(&self, key: &str) -> StorageResult<ArtifactBody> {
        debug!("Opening {}", key);

        let response = self.get_object(key).await?;
        let size_hint = response.content_length().map(|len| len.max(0) as u64);
        let chunks = stream::unfold(response.body, |mut body| async move {
            body.next().await.map(|chunk| {
                let chunk = chunk.map_err(|e| StorageError::download_failed(e.to_string()));
                (chunk, body)
            })
        });

        Ok(ArtifactBody::from_stream(key, size_hint, chunks))
    }

    async fn download(&self, key: &str) -> StorageResult<Bytes> {
        debug!("Downloading {}", key);

        let response = self.get_object(key).await?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
            .into_bytes();

        Ok(bytes)
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        debug!("Uploading {} bytes to {}", data.len(), key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::AwsSdk(format!(
                    "S3 connectivity check failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials_need_both_keys() {
        let mut config = S3Config {
            bucket_name: "uploads".to_string(),
            endpoint_url: None,
            access_key_id: Some("id".to_string()),
            secret_access_key: None,
            region: "auto".to_string(),
        };
        assert!(config.static_credentials().is_none());

        config.secret_access_key = Some("secret".to_string());
        assert!(config.static_credentials().is_some());
    }

    #[tokio::test]
    async fn test_rejects_empty_bucket() {
        let config = S3Config {
            bucket_name: " ".to_string(),
            endpoint_url: Some("http://localhost:9000".to_string()),
            access_key_id: Some("id".to_string()),
            secret_access_key: Some("secret".to_string()),
            region: "auto".to_string(),
        };
        assert!(matches!(S3Store::new(config).await, Err(StorageError::ConfigError(_))));
    }
}
