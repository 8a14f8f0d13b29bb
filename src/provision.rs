use crate::config::{AssetConfig, ProvisionConfig};
use eyre::{Result, WrapErr, bail};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Startup asset sync: mirrors model weights from a bucket into the local
/// asset tree before the worker accepts any job. Files are skipped when a
/// local copy of the same size already exists, so restarts are cheap.
pub struct Provisioner {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: usize,
    pub kept: usize,
    pub relocated: usize,
}

impl Provisioner {
    pub fn from_config(cfg: &ProvisionConfig) -> Result<Self> {
        if cfg.endpoint.trim().is_empty() {
            bail!("MODEL_SYNC_ENDPOINT is empty");
        }
        let scheme = if cfg.secure { "https" } else { "http" };
        let client_options = ClientOptions::new()
            .with_connect_timeout(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(300))
            .with_allow_http(!cfg.secure);
        let store = AmazonS3Builder::new()
            .with_endpoint(format!("{scheme}://{}", cfg.endpoint))
            .with_bucket_name(&cfg.bucket)
            .with_access_key_id(&cfg.access_key)
            .with_secret_access_key(&cfg.secret_key)
            .with_region("us-east-1")
            .with_virtual_hosted_style_request(false)
            .with_client_options(client_options)
            .with_retry(RetryConfig::default())
            .build()
            .wrap_err("building model sync store")?;
        Ok(Self {
            store: Arc::new(store),
            prefix: cfg.prefix.trim_matches('/').to_string(),
        })
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Sync every configured source category, then apply relocations. Any
    /// failure aborts the whole sync; the caller decides whether that is
    /// fatal for startup.
    pub async fn sync(&self, cfg: &ProvisionConfig, assets: &AssetConfig) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for source in &cfg.sources {
            let Some(dest) = category_dir(assets, source) else {
                bail!("unknown model sync source `{source}` (expected body, smplx, seg or tools)");
            };
            let (downloaded, kept) = self
                .sync_category(source, &dest)
                .await
                .wrap_err_with(|| format!("syncing model source `{source}`"))?;
            info!(
                target = "avatar.provision",
                source = %source,
                downloaded = downloaded,
                kept = kept,
                "model source synced"
            );
            report.downloaded += downloaded;
            report.kept += kept;
        }
        report.relocated = apply_relocations(&assets.root, &cfg.relocations).await?;
        Ok(report)
    }

    async fn sync_category(&self, source: &str, dest: &Path) -> Result<(usize, usize)> {
        let remote_prefix = if self.prefix.is_empty() {
            source.to_string()
        } else {
            format!("{}/{source}", self.prefix)
        };
        let list_prefix = ObjectPath::from(remote_prefix.clone());
        let mut downloaded = 0usize;
        let mut kept = 0usize;

        let mut listing = self.store.list(Some(&list_prefix));
        while let Some(entry) = listing.next().await {
            let meta = entry.wrap_err_with(|| format!("listing {remote_prefix}"))?;
            let location = meta.location.as_ref();
            let relative = location
                .strip_prefix(&remote_prefix)
                .unwrap_or("")
                .trim_start_matches('/');
            if relative.is_empty() {
                continue;
            }

            let local = dest.join(relative);
            let remote_size = meta.size as u64;
            let fresh = match tokio::fs::metadata(&local).await {
                Ok(local_meta) => local_meta.len() == remote_size,
                Err(_) => false,
            };
            if fresh {
                kept += 1;
                continue;
            }

            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .wrap_err_with(|| format!("creating {}", parent.display()))?;
            }
            let bytes = self
                .store
                .get(&meta.location)
                .await
                .wrap_err_with(|| format!("fetching {location}"))?
                .bytes()
                .await
                .wrap_err_with(|| format!("reading {location}"))?;
            tokio::fs::write(&local, &bytes)
                .await
                .wrap_err_with(|| format!("writing {}", local.display()))?;
            info!(
                target = "avatar.provision",
                object = %location,
                bytes = bytes.len(),
                "model file downloaded"
            );
            downloaded += 1;
        }

        if downloaded == 0 && kept == 0 {
            warn!(
                target = "avatar.provision",
                source = %source,
                prefix = %remote_prefix,
                "model source is empty in the bucket"
            );
        }
        Ok((downloaded, kept))
    }
}

fn category_dir(assets: &AssetConfig, source: &str) -> Option<PathBuf> {
    match source {
        "body" => Some(assets.body_model_dir.clone()),
        "smplx" => Some(assets.smplx_model_dir.clone()),
        "seg" => Some(assets.segmentor_weights_dir.clone()),
        "tools" => Some(assets.root.join("tools")),
        _ => None,
    }
}

/// Copy files within the asset tree after sync. Some model runtimes expect
/// weights at hardcoded relative paths; relocations express those aliases
/// without duplicating objects in the bucket.
async fn apply_relocations(root: &Path, relocations: &[(String, String)]) -> Result<usize> {
    let mut relocated = 0usize;
    for (from, to) in relocations {
        let src = root.join(from);
        let dst = root.join(to);
        if !src.is_file() {
            warn!(
                target = "avatar.provision",
                from = %src.display(),
                "relocation source missing, skipping"
            );
            continue;
        }
        let fresh = match (tokio::fs::metadata(&src).await, tokio::fs::metadata(&dst).await) {
            (Ok(a), Ok(b)) => a.len() == b.len(),
            _ => false,
        };
        if fresh {
            continue;
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .wrap_err_with(|| format!("relocating {} to {}", src.display(), dst.display()))?;
        relocated += 1;
    }
    Ok(relocated)
}
