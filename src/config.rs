use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration, read from the environment exactly once at
/// startup and handed to each component at construction time.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub queue_name: String,
    pub api_base_url: Option<String>,
    pub concurrency: usize,
    pub admin_port: u16,
    pub artifacts: ArtifactStoreConfig,
    pub assets: AssetConfig,
    pub provision: ProvisionConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub secure: bool,
}

/// Local asset root layout. The provisioner writes it at startup; job
/// processing only reads from it.
#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub root: PathBuf,
    pub body_model_dir: PathBuf,
    pub smplx_model_dir: PathBuf,
    pub segmentor_weights_dir: PathBuf,
    pub segmentor_path: Option<PathBuf>,
    pub gltfpack_path: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub secure: bool,
    pub prefix: String,
    pub sources: Vec<String>,
    /// Post-fetch relocations inside the asset root, `(from, to)` relative
    /// paths. Some vendored model code expects weights at fixed locations.
    pub relocations: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Strict toggle for body-shape estimation: when set, missing model
    /// assets fail the job instead of producing a placeholder avatar.
    pub require_real_body_model: bool,
    /// Strict toggle for mesh optimization, same shape as the one above.
    pub require_optimized_mesh: bool,
    pub silhouette_refine_enabled: bool,
    pub torso_erode_px: u32,
    pub job_timeout: Duration,
    pub upload_max_attempts: usize,
    pub terminal_callback_max_attempts: usize,
    /// Degradation counts at which confidence drops.
    pub medium_after_degradations: usize,
    pub low_after_degradations: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            require_real_body_model: false,
            require_optimized_mesh: false,
            silhouette_refine_enabled: true,
            torso_erode_px: 8,
            job_timeout: Duration::from_secs(300),
            upload_max_attempts: 3,
            terminal_callback_max_attempts: 10,
            medium_after_degradations: 1,
            low_after_degradations: 2,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let root = PathBuf::from(env_str("MODEL_ROOT", "/app/models"));
        let assets = AssetConfig {
            body_model_dir: PathBuf::from(
                env_str_opt("BODY_MODEL_DIR")
                    .unwrap_or_else(|| root.join("body").to_string_lossy().into_owned()),
            ),
            smplx_model_dir: PathBuf::from(
                env_str_opt("SMPLX_MODEL_DIR")
                    .unwrap_or_else(|| root.join("smplx").to_string_lossy().into_owned()),
            ),
            segmentor_weights_dir: PathBuf::from(
                env_str_opt("SEGMENTOR_WEIGHTS_DIR")
                    .unwrap_or_else(|| root.join("seg").to_string_lossy().into_owned()),
            ),
            segmentor_path: env_str_opt("SEGMENTOR_PATH").map(PathBuf::from),
            gltfpack_path: env_str("GLTFPACK_PATH", "gltfpack"),
            root,
        };

        Self {
            redis_url: env_str("REDIS_URL", "redis://localhost:6379"),
            queue_name: env_str("QUEUE_NAME", "avatar_build"),
            api_base_url: env_str_opt("API_BASE_URL"),
            concurrency: env_usize("WORKER_CONCURRENCY", 1).max(1),
            admin_port: env_usize("ADMIN_PORT", 8090) as u16,
            artifacts: ArtifactStoreConfig {
                endpoint: env_str("MINIO_ENDPOINT", "localhost:9000"),
                access_key: env_str("MINIO_ACCESS_KEY", "minioadmin"),
                secret_key: env_str("MINIO_SECRET_KEY", "minioadmin"),
                bucket: env_str("MINIO_BUCKET", "tryfitted"),
                secure: env_bool("MINIO_SECURE"),
            },
            provision: ProvisionConfig {
                enabled: env_bool("MODEL_SYNC_ENABLED"),
                endpoint: env_str("MODEL_SYNC_MINIO_ENDPOINT", ""),
                access_key: env_str("MODEL_SYNC_MINIO_ACCESS_KEY", ""),
                secret_key: env_str("MODEL_SYNC_MINIO_SECRET_KEY", ""),
                bucket: env_str("MODEL_SYNC_MINIO_BUCKET", "tryfitted-models"),
                secure: std::env::var("MODEL_SYNC_MINIO_SECURE")
                    .map(|v| is_truthy(&v))
                    .unwrap_or(true),
                prefix: env_str("MODEL_SYNC_PREFIX", "")
                    .trim_matches('/')
                    .to_string(),
                sources: env_str("MODEL_SYNC_SOURCES", "body,smplx,seg")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                relocations: parse_relocations(&env_str("MODEL_SYNC_RELOCATIONS", "")),
            },
            pipeline: PipelineConfig {
                require_real_body_model: env_bool("REQUIRE_REAL_AVATAR"),
                require_optimized_mesh: env_bool("REQUIRE_GLTFPACK"),
                silhouette_refine_enabled: std::env::var("SILHOUETTE_REFINE_ENABLED")
                    .map(|v| is_truthy(&v))
                    .unwrap_or(true),
                torso_erode_px: env_usize("SILHOUETTE_TORSO_ERODE_PX", 8) as u32,
                job_timeout: Duration::from_secs(env_usize("PROCESSING_TIMEOUT", 300) as u64),
                upload_max_attempts: env_usize("UPLOAD_MAX_ATTEMPTS", 3),
                terminal_callback_max_attempts: env_usize("TERMINAL_CALLBACK_MAX_ATTEMPTS", 10),
                medium_after_degradations: env_usize("CONFIDENCE_MEDIUM_AFTER", 1),
                low_after_degradations: env_usize("CONFIDENCE_LOW_AFTER", 2),
            },
            assets,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_str_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    std::env::var(key).map(|v| is_truthy(&v)).unwrap_or(false)
}

/// Comma-separated `from>to` pairs, paths relative to the asset root.
fn parse_relocations(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (from, to) = pair.split_once('>')?;
            let from = from.trim();
            let to = to.trim();
            (!from.is_empty() && !to.is_empty())
                .then(|| (from.to_string(), to.to_string()))
        })
        .collect()
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "YES", " on "] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["0", "false", "off", ""] {
            assert!(!is_truthy(v), "{v} should be falsy");
        }
    }

    #[test]
    fn relocations_parse_pairs_and_skip_garbage() {
        let parsed = parse_relocations(
            "smplx/SMPLX_NEUTRAL.npz > body/data/SMPLX_NEUTRAL.npz, broken, >x, a>b",
        );
        assert_eq!(
            parsed,
            vec![
                (
                    "smplx/SMPLX_NEUTRAL.npz".to_string(),
                    "body/data/SMPLX_NEUTRAL.npz".to_string()
                ),
                ("a".to_string(), "b".to_string()),
            ]
        );
        assert!(parse_relocations("").is_empty());
    }

    #[test]
    fn pipeline_defaults_are_permissive() {
        let cfg = PipelineConfig::default();
        assert!(!cfg.require_real_body_model);
        assert!(!cfg.require_optimized_mesh);
        assert!(cfg.silhouette_refine_enabled);
        assert_eq!(cfg.medium_after_degradations, 1);
        assert_eq!(cfg.low_after_degradations, 2);
    }
}
