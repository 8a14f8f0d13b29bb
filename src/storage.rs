use crate::config::ArtifactStoreConfig;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ClientOptions, ObjectStore, PutOptions, RetryConfig};
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid artifact config: {0}")]
    Config(String),
}

/// Stable artifact keys for one job, derivable from the job id alone so a
/// redelivered job overwrites the same objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKeys {
    pub mesh: String,
    pub measurements: String,
    pub quality_report: String,
    pub appearance: String,
    pub mask_front: String,
    pub mask_side: String,
    pub silhouette_targets: String,
}

impl ArtifactKeys {
    pub fn for_job(job_id: &str) -> Self {
        let prefix = format!("avatars/{job_id}");
        Self {
            mesh: format!("{prefix}/avatar.glb"),
            measurements: format!("{prefix}/measurements.json"),
            quality_report: format!("{prefix}/quality_report.json"),
            appearance: format!("{prefix}/appearance.json"),
            mask_front: format!("{prefix}/mask_front.png"),
            mask_side: format!("{prefix}/mask_side.png"),
            silhouette_targets: format!("{prefix}/silhouette_targets.json"),
        }
    }
}

/// S3-compatible artifact store (MinIO in deployment). Uploads go under a
/// per-job prefix; input photos are fetched from the `uploads/` namespace.
#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
    endpoint: String,
    bucket: String,
    secure: bool,
    max_attempts: usize,
}

impl ArtifactStore {
    pub fn from_config(cfg: &ArtifactStoreConfig, max_attempts: usize) -> Result<Self, StorageError> {
        if cfg.endpoint.trim().is_empty() {
            return Err(StorageError::Config("MINIO_ENDPOINT is empty".into()));
        }
        let scheme = if cfg.secure { "https" } else { "http" };
        let client_options = ClientOptions::new()
            .with_connect_timeout(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(60))
            .with_allow_http(!cfg.secure);
        let store = AmazonS3Builder::new()
            .with_bucket_name(&cfg.bucket)
            .with_endpoint(format!("{scheme}://{}", cfg.endpoint))
            .with_region("us-east-1")
            .with_access_key_id(&cfg.access_key)
            .with_secret_access_key(&cfg.secret_key)
            .with_virtual_hosted_style_request(false)
            .with_client_options(client_options)
            .with_retry(RetryConfig::default())
            .build()?;
        info!(
            target = "avatar.storage",
            endpoint = %cfg.endpoint,
            bucket = %cfg.bucket,
            "artifact store client ready"
        );
        Ok(Self {
            store: Arc::new(store),
            endpoint: cfg.endpoint.clone(),
            bucket: cfg.bucket.clone(),
            secure: cfg.secure,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Test constructor over an arbitrary backend (e.g. `InMemory`).
    pub fn with_store(store: Arc<dyn ObjectStore>, endpoint: &str, bucket: &str) -> Self {
        Self {
            store,
            endpoint: endpoint.to_string(),
            bucket: bucket.to_string(),
            secure: false,
            max_attempts: 3,
        }
    }

    /// Extract the object key from an upload URL issued by the API.
    /// Upload URLs always address the `uploads/` namespace; anything else
    /// is not fetchable by the worker.
    pub fn object_key_from_upload_url(url: &str) -> Option<String> {
        url.split_once("uploads/")
            .map(|(_, rest)| format!("uploads/{rest}"))
            .filter(|key| key.len() > "uploads/".len())
    }

    pub async fn download_to(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let bytes = self.store.get(&ObjectPath::from(key)).await?.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    pub async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let bytes = Bytes::from(tokio::fs::read(path).await?);
        let content_type = content_type
            .map(|ct| ct.to_string())
            .unwrap_or_else(|| guess_content_type(key).to_string());
        self.upload_bytes(key, bytes, &content_type).await
    }

    /// Upload with bounded retry and exponential backoff. Re-running a job
    /// puts the same keys, so a repeat upload is a harmless overwrite.
    pub async fn upload_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let location = ObjectPath::from(key);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
            match self
                .store
                .put_opts(&location, bytes.clone().into(), PutOptions::from(attributes))
                .await
            {
                Ok(_) => {
                    info!(target = "avatar.storage", key = %key, bytes = bytes.len(), "uploaded");
                    return Ok(());
                }
                Err(err) if attempt < self.max_attempts => {
                    let backoff = upload_backoff(attempt);
                    warn!(
                        target = "avatar.storage",
                        key = %key,
                        attempt = attempt,
                        error = %err,
                        "upload failed, retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        let protocol = if self.secure { "https" } else { "http" };
        format!("{protocol}://{}/{}/{key}", self.endpoint, self.bucket)
    }
}

fn upload_backoff(attempt: usize) -> Duration {
    let base = 100u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(0..base / 2 + 1);
    Duration::from_millis(base + jitter)
}

pub fn guess_content_type(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext) {
        Some("glb") => "model/gltf-binary",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Object store backend that fails the first N puts, for exercising the
/// upload retry path without a real flaky network.
#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use object_store::path::Path as ObjectPath;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
        PutMultipartOpts, PutOptions, PutPayload, PutResult,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    pub(crate) struct FlakyStore {
        inner: Arc<dyn ObjectStore>,
        failures_left: AtomicUsize,
        puts: AtomicUsize,
    }

    impl FlakyStore {
        pub(crate) fn wrapping(inner: Arc<dyn ObjectStore>, failures: usize) -> Self {
            Self {
                inner,
                failures_left: AtomicUsize::new(failures),
                puts: AtomicUsize::new(0),
            }
        }

        pub(crate) fn put_attempts(&self) -> usize {
            self.puts.load(Ordering::SeqCst)
        }

        fn take_failure(&self) -> bool {
            self.failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl std::fmt::Display for FlakyStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FlakyStore({})", self.inner)
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put_opts(
            &self,
            location: &ObjectPath,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.take_failure() {
                return Err(object_store::Error::Generic {
                    store: "flaky",
                    source: "injected put failure".into(),
                });
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &ObjectPath,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &ObjectPath,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(
            &self,
            prefix: Option<&ObjectPath>,
        ) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&ObjectPath>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(
            &self,
            from: &ObjectPath,
            to: &ObjectPath,
        ) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }
}
