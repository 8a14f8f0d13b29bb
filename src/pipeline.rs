use crate::api_client::{ApiError, JobStoreClient};
use crate::avatar::appearance::AppearanceEstimator;
use crate::avatar::body_model::{BodyModelRunner, BodyParams};
use crate::avatar::measurements::{MeasurementExtractor, measurement_warnings};
use crate::avatar::mesh::{MeshExporter, MeshOptimizer};
use crate::avatar::silhouette::SilhouetteRefiner;
use crate::models::{
    Confidence, JobMessage, JobResult, JobStatus, Measurements, QualityReport, StageReport,
};
use crate::config::{AssetConfig, PipelineConfig};
use crate::storage::{ArtifactKeys, ArtifactStore};
use bytes::Bytes;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    DependencyMissing,
    InvalidInput,
    ComputeFailure,
    Timeout,
    StoreFailure,
}

impl PipelineErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineErrorKind::DependencyMissing => "dependency_missing",
            PipelineErrorKind::InvalidInput => "invalid_input",
            PipelineErrorKind::ComputeFailure => "compute_failure",
            PipelineErrorKind::Timeout => "timeout",
            PipelineErrorKind::StoreFailure => "store_failure",
        }
    }
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn dependency_missing(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::DependencyMissing,
        }
    }

    pub fn compute(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::ComputeFailure,
        }
    }

    pub fn timeout(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Timeout,
        }
    }

    pub fn store(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::StoreFailure,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// Fallback class of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePolicy {
    /// Must produce a real result; `placeholder_ok` allows a degraded
    /// substitute (with a warning) instead of failing the job.
    Strict { placeholder_ok: bool },
    /// Skipped entirely when disabled or its dependencies are missing.
    Optional { enabled: bool },
    /// Failure never fails the job unless explicitly required.
    BestEffort { required: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct StageRule {
    pub name: &'static str,
    pub policy: StagePolicy,
}

/// The fixed stage order and each stage's fallback class. Adding a stage
/// means adding one row here.
pub fn stage_rules(cfg: &PipelineConfig) -> Vec<StageRule> {
    vec![
        StageRule { name: "fetch_photos", policy: StagePolicy::BestEffort { required: false } },
        StageRule { name: "estimate_body", policy: StagePolicy::Strict { placeholder_ok: !cfg.require_real_body_model } },
        StageRule { name: "refine_silhouette", policy: StagePolicy::Optional { enabled: cfg.silhouette_refine_enabled } },
        StageRule { name: "extract_measurements", policy: StagePolicy::BestEffort { required: false } },
        StageRule { name: "export_mesh", policy: StagePolicy::Strict { placeholder_ok: false } },
        StageRule { name: "optimize_mesh", policy: StagePolicy::BestEffort { required: cfg.require_optimized_mesh } },
        StageRule { name: "estimate_appearance", policy: StagePolicy::BestEffort { required: false } },
        StageRule { name: "upload_artifacts", policy: StagePolicy::Strict { placeholder_ok: false } },
    ]
}

/// Ephemeral per-run state: warnings and degradations feed the quality
/// report; stage reports are a timing transcript for the logs.
#[derive(Debug, Default)]
struct RunState {
    reports: Vec<StageReport>,
    warnings: Vec<String>,
    degradations: usize,
    measurement_fallback: bool,
}

impl RunState {
    fn record(&mut self, name: &'static str, started: Instant, output: Value) {
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        self.reports.push(StageReport::new(name, elapsed_ms, output));
    }

    fn degrade(&mut self, warning: impl Into<String>) {
        self.degradations += 1;
        self.warnings.push(warning.into());
    }
}

struct RunOutput {
    glb_url: String,
    measurements: Measurements,
    quality_report: QualityReport,
}

/// Drives one job through the fixed stage sequence and resolves it to a
/// terminal status, reported through the job store client exactly once.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    storage: ArtifactStore,
    api: JobStoreClient,
    body: BodyModelRunner,
    refiner: SilhouetteRefiner,
    measurer: MeasurementExtractor,
    exporter: MeshExporter,
    optimizer: MeshOptimizer,
    appearance: AppearanceEstimator,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        assets: &AssetConfig,
        storage: ArtifactStore,
        api: JobStoreClient,
    ) -> Self {
        let body = BodyModelRunner::new(
            assets.body_model_dir.clone(),
            assets.smplx_model_dir.clone(),
        );
        let refiner = SilhouetteRefiner::new(
            assets.segmentor_path.clone(),
            assets.segmentor_weights_dir.clone(),
            config.torso_erode_px,
        );
        let measurer = MeasurementExtractor::new(assets.smplx_model_dir.clone());
        let optimizer = MeshOptimizer::new(assets.gltfpack_path.clone());
        Self {
            config: Arc::new(config),
            storage,
            api,
            body,
            refiner,
            measurer,
            exporter: MeshExporter::new(),
            optimizer,
            appearance: AppearanceEstimator::new(),
        }
    }

    fn policy(&self, stage: &str) -> StagePolicy {
        stage_rules(&self.config)
            .into_iter()
            .find(|rule| rule.name == stage)
            .map(|rule| rule.policy)
            .unwrap_or(StagePolicy::BestEffort { required: false })
    }

    /// Whether a best-effort stage may degrade instead of failing the
    /// job, per its table row.
    fn may_degrade(&self, stage: &str) -> bool {
        !matches!(self.policy(stage), StagePolicy::BestEffort { required: true })
    }

    /// Process one job end to end. Returns the terminal status once it has
    /// been durably reported; an error here means the terminal callback
    /// could not be delivered at all.
    pub async fn process(&self, job: &JobMessage) -> Result<JobStatus, ApiError> {
        info!(target = "avatar.pipeline", job_id = %job.job_id, "processing job");

        // The processing transition goes out before any stage runs, so a
        // crash mid-job is observable as `processing` rather than a job
        // silently stuck in `queued`.
        self.api.report_progress(&job.job_id, 10).await;

        let verdict = if let Err(err) = validate(job) {
            Err(err)
        } else {
            match tokio::time::timeout(self.config.job_timeout, self.run(job)).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::timeout(
                    "pipeline",
                    format!("job did not finish within {:?}", self.config.job_timeout),
                )),
            }
        };

        match verdict {
            Ok(output) => {
                let result = JobResult {
                    user_id: job.user_id().to_string(),
                    glb_url: output.glb_url,
                    measurements: output.measurements,
                    quality_report: output.quality_report,
                };
                self.api
                    .report_terminal(&job.job_id, JobStatus::Completed, None, Some(result))
                    .await?;
                crate::metrics::job_finished("completed");
                info!(target = "avatar.pipeline", job_id = %job.job_id, "job completed");
                Ok(JobStatus::Completed)
            }
            Err(err) => {
                warn!(
                    target = "avatar.pipeline",
                    job_id = %job.job_id,
                    stage = err.stage(),
                    kind = err.kind().as_str(),
                    "job failed: {}",
                    err.detail()
                );
                let error = format!("{}: {}: {}", err.stage(), err.kind().as_str(), err.detail());
                self.api
                    .report_terminal(&job.job_id, JobStatus::Failed, Some(error), None)
                    .await?;
                crate::metrics::job_finished("failed");
                Ok(JobStatus::Failed)
            }
        }
    }

    async fn run(&self, job: &JobMessage) -> Result<RunOutput, PipelineError> {
        let scratch = tempfile::tempdir()
            .map_err(|err| PipelineError::compute("pipeline", err.to_string()))?;
        let keys = ArtifactKeys::for_job(&job.job_id);
        let mut state = RunState::default();

        // Stage 1: fetch photos.
        let started = Instant::now();
        let front_path = scratch.path().join("photo_front.jpg");
        let side_path = scratch.path().join("photo_side.jpg");
        let front_ok = self
            .fetch_photo(job.front_photo_url.as_deref(), &front_path)
            .await?;
        let side_ok = self
            .fetch_photo(job.side_photo_url.as_deref(), &side_path)
            .await?;
        state.record(
            "fetch_photos",
            started,
            json!({"front": front_ok, "side": side_ok}),
        );
        self.api.report_progress(&job.job_id, 20).await;

        // Stage 2: body-shape estimation.
        let started = Instant::now();
        let mut params = self
            .body
            .estimate(&front_path, side_ok.then_some(side_path.as_path()), job.height_cm)
            .await;
        if params.placeholder {
            match self.policy("estimate_body") {
                StagePolicy::Strict { placeholder_ok: false } => {
                    return Err(PipelineError::dependency_missing(
                        "estimate_body",
                        "body estimation ran in placeholder mode (model assets not loaded); \
                         provision the body-model weights or unset REQUIRE_REAL_AVATAR",
                    ));
                }
                _ => state.degrade(
                    "placeholder body model used (estimation assets or input photo unavailable)",
                ),
            }
        }
        state.record(
            "estimate_body",
            started,
            json!({"placeholder": params.placeholder, "confidence": params.confidence}),
        );

        // Stage 3: optional silhouette refinement.
        if let StagePolicy::Optional { enabled: true } = self.policy("refine_silhouette") {
            let started = Instant::now();
            self.refine(job, &mut params, &front_path, &side_path, front_ok && side_ok, scratch.path(), &keys, &mut state)
                .await;
            state.record(
                "refine_silhouette",
                started,
                json!({"refined": params.sources.get("silhouetteRefine").is_some()}),
            );
        }
        self.api.report_progress(&job.job_id, 40).await;

        // Stage 4: measurements.
        let started = Instant::now();
        let (measurements, used_placeholder) = self.measurer.extract(&params);
        if used_placeholder {
            if !self.may_degrade("extract_measurements") {
                return Err(PipelineError::dependency_missing(
                    "extract_measurements",
                    "measurement extraction fell back to static table values",
                ));
            }
            state.measurement_fallback = true;
            state
                .warnings
                .push("placeholder measurements used (measurement assets unavailable)".to_string());
        }
        state.record(
            "extract_measurements",
            started,
            json!({"placeholder": used_placeholder}),
        );
        self.api.report_progress(&job.job_id, 60).await;

        // Stage 5: mesh export. No mesh means no avatar; always fatal.
        let started = Instant::now();
        let glb_path = scratch.path().join("avatar.glb");
        self.exporter
            .export(&measurements, job.height_cm, &glb_path)
            .await?;
        state.record("export_mesh", started, json!({"path": "avatar.glb"}));
        self.api.report_progress(&job.job_id, 70).await;

        // Stage 6: mesh optimization. Availability is checked up front so
        // a missing gltfpack resolves through the policy table instead of
        // a failed spawn.
        let started = Instant::now();
        let optimized_path = scratch.path().join("avatar_optimized.glb");
        let outcome = if self.optimizer.is_available() {
            self.optimizer.optimize(&glb_path, &optimized_path).await
        } else {
            Err(PipelineError::dependency_missing(
                "optimize_mesh",
                "gltfpack binary unavailable",
            ))
        };
        let final_glb = match outcome {
            Ok(()) => optimized_path,
            Err(err) if self.may_degrade("optimize_mesh") => {
                state
                    .warnings
                    .push(format!("mesh optimization skipped: {}", err.detail()));
                glb_path.clone()
            }
            Err(err) => return Err(err),
        };
        state.record(
            "optimize_mesh",
            started,
            json!({"optimized": final_glb != glb_path}),
        );

        // Stage 7: appearance tint.
        let started = Instant::now();
        let skin = if front_ok {
            self.appearance.estimate_skin_color(&front_path).await
        } else {
            None
        };
        if let Some(color) = skin {
            if let Err(err) = self.appearance.apply_skin_tone(&final_glb, color).await {
                if !self.may_degrade("estimate_appearance") {
                    return Err(PipelineError::compute("estimate_appearance", err));
                }
                state
                    .warnings
                    .push(format!("skin tone not applied to mesh: {err}"));
            }
        }
        state.record(
            "estimate_appearance",
            started,
            json!({"skin": skin.map(|c| c.hex())}),
        );
        self.api.report_progress(&job.job_id, 85).await;

        // Stage 8: artifact upload, then the quality report is final.
        let started = Instant::now();
        let mut warnings = state.warnings.clone();
        warnings.extend(measurement_warnings(&measurements));
        let quality_report = QualityReport {
            confidence: derive_confidence(
                &self.config,
                state.degradations,
                state.measurement_fallback,
            ),
            warnings,
        };

        self.storage
            .upload_file(&final_glb, &keys.mesh, Some("model/gltf-binary"))
            .await
            .map_err(|err| PipelineError::store("upload_artifacts", err.to_string()))?;
        self.upload_json(&keys.measurements, json!(measurements))
            .await?;
        self.upload_json(&keys.quality_report, json!(quality_report))
            .await?;
        let mut appearance_doc = json!({"sources": Value::Object(params.sources.clone())});
        if let Some(color) = skin {
            appearance_doc["skinColor"] = color.to_json();
        }
        self.upload_json(&keys.appearance, appearance_doc).await?;
        state.record("upload_artifacts", started, json!({"mesh": keys.mesh}));
        self.api.report_progress(&job.job_id, 95).await;

        if let Ok(transcript) = serde_json::to_string(&state.reports) {
            tracing::debug!(target = "avatar.pipeline", job_id = %job.job_id, stages = %transcript, "stage transcript");
        }

        Ok(RunOutput {
            glb_url: self.storage.public_url(&keys.mesh),
            measurements,
            quality_report,
        })
    }

    /// Silhouette refinement never fails the job: every exit that is not a
    /// successful refinement downgrades to a warning.
    #[allow(clippy::too_many_arguments)]
    async fn refine(
        &self,
        job: &JobMessage,
        params: &mut BodyParams,
        front_path: &Path,
        side_path: &Path,
        both_photos: bool,
        scratch: &Path,
        keys: &ArtifactKeys,
        state: &mut RunState,
    ) {
        if params.placeholder {
            state
                .warnings
                .push("silhouette refinement skipped: placeholder body model".to_string());
            return;
        }
        if !both_photos {
            state
                .warnings
                .push("silhouette refinement skipped: requires both front and side photos".to_string());
            return;
        }
        if !self.refiner.is_available() {
            state.degrade("silhouette refinement skipped: segmentation assets unavailable");
            return;
        }

        let debug_dir = scratch.join("fit_debug");
        let refined = async {
            let front_mask = self
                .refiner
                .generate_mask(front_path, &debug_dir, "front")
                .await?;
            let side_mask = self
                .refiner
                .generate_mask(side_path, &debug_dir, "side")
                .await?;
            let targets =
                self.refiner
                    .estimate_targets(&front_mask.stats, &side_mask.stats, job.height_cm)?;

            // Debug artifacts are best-effort; refinement proceeds even if
            // none of them land.
            let uploads: [(&Path, &str); 2] = [
                (&front_mask.mask_path, keys.mask_front.as_str()),
                (&side_mask.mask_path, keys.mask_side.as_str()),
            ];
            for (path, key) in uploads {
                if let Err(err) = self.storage.upload_file(path, key, None).await {
                    warn!(target = "avatar.pipeline", key = %key, error = %err, "debug artifact upload failed");
                }
            }
            if let Err(err) = self
                .upload_json(&keys.silhouette_targets, targets.to_json())
                .await
            {
                warn!(target = "avatar.pipeline", error = %err, "silhouette targets upload failed");
            }

            let betas =
                self.refiner
                    .refine_betas(&self.measurer, &params.betas, job.height_cm, &targets);
            Ok::<Vec<f64>, PipelineError>(betas)
        }
        .await;

        match refined {
            Ok(betas) => params.mark_refined(betas),
            Err(err) => {
                if err.kind() == PipelineErrorKind::DependencyMissing {
                    state.degrade(format!("silhouette refinement skipped: {}", err.detail()));
                } else {
                    state
                        .warnings
                        .push(format!("silhouette refinement failed: {}", err.detail()));
                }
            }
        }
    }

    /// Fetch a photo from the artifact store into the scratch dir. An
    /// absent URL leaves an empty placeholder file and returns false; a
    /// failed download does the same when the `fetch_photos` table row
    /// permits degrading (the body-model stage then runs in placeholder
    /// mode). A URL outside the uploads namespace is bad input, not a
    /// degraded one, and bad input never falls back.
    async fn fetch_photo(
        &self,
        url: Option<&str>,
        dest: &PathBuf,
    ) -> Result<bool, PipelineError> {
        let Some(url) = url else {
            let _ = tokio::fs::write(dest, b"").await;
            return Ok(false);
        };
        let Some(key) = ArtifactStore::object_key_from_upload_url(url) else {
            return Err(PipelineError::invalid_input(
                "fetch_photos",
                format!("photo URL does not address the uploads namespace: {url}"),
            ));
        };
        match self.storage.download_to(&key, dest).await {
            Ok(()) => Ok(true),
            Err(err) if self.may_degrade("fetch_photos") => {
                warn!(target = "avatar.pipeline", key = %key, error = %err, "photo download failed, using placeholder");
                let _ = tokio::fs::write(dest, b"").await;
                Ok(false)
            }
            Err(err) => Err(PipelineError::store("fetch_photos", err.to_string())),
        }
    }

    async fn upload_json(&self, key: &str, doc: Value) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|err| PipelineError::compute("upload_artifacts", err.to_string()))?;
        self.storage
            .upload_bytes(key, Bytes::from(bytes), "application/json")
            .await
            .map_err(|err| PipelineError::store("upload_artifacts", err.to_string()))
    }
}

fn validate(job: &JobMessage) -> Result<(), PipelineError> {
    if job.job_id.trim().is_empty() {
        return Err(PipelineError::invalid_input("validate_input", "empty job id"));
    }
    if !job.height_cm.is_finite() || !(50.0..=250.0).contains(&job.height_cm) {
        return Err(PipelineError::invalid_input(
            "validate_input",
            format!("height_cm out of range: {}", job.height_cm),
        ));
    }
    Ok(())
}

fn derive_confidence(
    cfg: &PipelineConfig,
    degradations: usize,
    measurement_fallback: bool,
) -> Confidence {
    if measurement_fallback || degradations >= cfg.low_after_degradations {
        Confidence::Low
    } else if degradations >= cfg.medium_after_degradations {
        Confidence::Medium
    } else {
        Confidence::High
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StatusUpdate;
    use bytes::Bytes;
    use image::{Rgb, RgbImage};
    use object_store::memory::InMemory;
    use std::time::Duration;

    struct Harness {
        pipeline: Pipeline,
        storage: ArtifactStore,
        api: JobStoreClient,
        _dir: tempfile::TempDir,
    }

    async fn harness_over(
        with_assets: bool,
        cfg: PipelineConfig,
        storage: ArtifactStore,
    ) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets = AssetConfig {
            root: dir.path().to_path_buf(),
            body_model_dir: dir.path().join("body"),
            smplx_model_dir: dir.path().join("smplx"),
            segmentor_weights_dir: dir.path().join("seg"),
            segmentor_path: None,
            gltfpack_path: "definitely-not-a-real-binary-xyz".to_string(),
        };
        if with_assets {
            for sub in ["body", "smplx"] {
                let d = dir.path().join(sub);
                std::fs::create_dir_all(&d).unwrap();
                std::fs::write(d.join("weights.bin"), b"w").unwrap();
            }
        }
        let api = JobStoreClient::recording(3);
        let pipeline = Pipeline::new(cfg, &assets, storage.clone(), api.clone());
        Harness {
            pipeline,
            storage,
            api,
            _dir: dir,
        }
    }

    async fn harness(with_assets: bool, cfg: PipelineConfig) -> Harness {
        let storage =
            ArtifactStore::with_store(Arc::new(InMemory::new()), "localhost:9000", "tryfitted");
        harness_over(with_assets, cfg, storage).await
    }

    async fn seed_photo(storage: &ArtifactStore, key: &str) {
        let mut img = RgbImage::from_pixel(64, 96, Rgb([40, 40, 40]));
        for y in 8..48 {
            for x in 20..44 {
                img.put_pixel(x, y, Rgb([198, 148, 118]));
            }
        }
        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        storage
            .upload_bytes(key, Bytes::from(bytes), "image/png")
            .await
            .unwrap();
    }

    fn job() -> JobMessage {
        JobMessage {
            job_id: "j1".to_string(),
            front_photo_url: Some("http://localhost:9000/tryfitted/uploads/u1/front.png".into()),
            side_photo_url: None,
            height_cm: 175.0,
            user_id: Some("u1".into()),
        }
    }

    fn statuses(recorded: &[(String, StatusUpdate)]) -> Vec<JobStatus> {
        recorded.iter().map(|(_, u)| u.status).collect()
    }

    async fn exists(storage: &ArtifactStore, key: &str) -> bool {
        let dir = tempfile::tempdir().unwrap();
        storage
            .download_to(key, &dir.path().join("probe"))
            .await
            .is_ok()
    }

    fn no_refine_cfg() -> PipelineConfig {
        PipelineConfig {
            silhouette_refine_enabled: false,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn happy_path_completes_with_high_confidence() {
        let h = harness(true, no_refine_cfg()).await;
        seed_photo(&h.storage, "uploads/u1/front.png").await;

        let status = h.pipeline.process(&job()).await.expect("process");
        assert_eq!(status, JobStatus::Completed);

        let recorded = h.api.recorded().await;
        let seq = statuses(&recorded);
        assert_eq!(seq.first(), Some(&JobStatus::Processing));
        assert_eq!(seq.last(), Some(&JobStatus::Completed));
        assert!(seq.iter().all(|s| *s != JobStatus::Failed));
        // Once terminal, no further transitions.
        let terminal_at = seq.iter().position(|s| s.is_terminal()).unwrap();
        assert_eq!(terminal_at, seq.len() - 1);

        let result = recorded.last().unwrap().1.result.as_ref().expect("result");
        assert_eq!(result.quality_report.confidence, Confidence::High);
        assert_eq!(result.user_id, "u1");
        assert!(result.glb_url.ends_with("avatars/j1/avatar.glb"));

        let keys = ArtifactKeys::for_job("j1");
        for key in [&keys.mesh, &keys.measurements, &keys.quality_report, &keys.appearance] {
            assert!(exists(&h.storage, key).await, "missing {key}");
        }
        // Refinement disabled: no mask artifacts.
        assert!(!exists(&h.storage, &keys.mask_front).await);
        assert!(!exists(&h.storage, &keys.mask_side).await);
        assert!(!exists(&h.storage, &keys.silhouette_targets).await);
    }

    #[tokio::test]
    async fn missing_weights_permissive_completes_degraded() {
        let h = harness(false, no_refine_cfg()).await;
        seed_photo(&h.storage, "uploads/u1/front.png").await;

        let status = h.pipeline.process(&job()).await.expect("process");
        assert_eq!(status, JobStatus::Completed);

        let recorded = h.api.recorded().await;
        let result = recorded.last().unwrap().1.result.as_ref().expect("result");
        // Placeholder body and placeholder measurements: at most medium,
        // and the measurement fallback forces low.
        assert!(result.quality_report.confidence >= Confidence::Medium);
        assert!(
            result
                .quality_report
                .warnings
                .iter()
                .any(|w| w.contains("placeholder")),
            "warnings: {:?}",
            result.quality_report.warnings
        );
        assert!(exists(&h.storage, &ArtifactKeys::for_job("j1").mesh).await);
    }

    #[tokio::test]
    async fn missing_weights_strict_fails_with_dependency_missing() {
        let cfg = PipelineConfig {
            require_real_body_model: true,
            ..no_refine_cfg()
        };
        let h = harness(false, cfg).await;
        seed_photo(&h.storage, "uploads/u1/front.png").await;

        let status = h.pipeline.process(&job()).await.expect("process");
        assert_eq!(status, JobStatus::Failed);

        let recorded = h.api.recorded().await;
        let last = &recorded.last().unwrap().1;
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.result.is_none());
        let error = last.error.as_deref().expect("error message");
        assert!(error.contains("dependency_missing"), "error: {error}");
        assert!(error.contains("estimate_body"));
        // Failed before export: no mesh artifact.
        assert!(!exists(&h.storage, &ArtifactKeys::for_job("j1").mesh).await);
    }

    #[tokio::test]
    async fn invalid_height_is_fatal_and_never_falls_back() {
        let h = harness(true, no_refine_cfg()).await;
        let mut bad = job();
        bad.height_cm = 400.0;

        let status = h.pipeline.process(&bad).await.expect("process");
        assert_eq!(status, JobStatus::Failed);
        let recorded = h.api.recorded().await;
        let error = recorded.last().unwrap().1.error.as_deref().unwrap();
        assert!(error.contains("invalid_input"), "error: {error}");
    }

    #[tokio::test]
    async fn malformed_photo_url_is_fatal() {
        let h = harness(true, no_refine_cfg()).await;
        let mut bad = job();
        bad.front_photo_url = Some("http://somewhere.example/private/front.png".into());

        let status = h.pipeline.process(&bad).await.expect("process");
        assert_eq!(status, JobStatus::Failed);
        let recorded = h.api.recorded().await;
        let error = recorded.last().unwrap().1.error.as_deref().unwrap();
        assert!(error.contains("invalid_input"), "error: {error}");
        assert!(error.contains("fetch_photos"));
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let h = harness(true, no_refine_cfg()).await;
        seed_photo(&h.storage, "uploads/u1/front.png").await;

        let first = h.pipeline.process(&job()).await.expect("first run");
        let second = h.pipeline.process(&job()).await.expect("second run");
        assert_eq!(first, second);

        let recorded = h.api.recorded().await;
        let results: Vec<_> = recorded
            .iter()
            .filter_map(|(_, u)| u.result.as_ref())
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].glb_url, results[1].glb_url);
        assert_eq!(results[0].measurements, results[1].measurements);
    }

    #[tokio::test]
    async fn refinement_requested_but_unavailable_degrades() {
        // Refinement enabled, segmentor absent, side photo present.
        let h = harness(true, PipelineConfig::default()).await;
        seed_photo(&h.storage, "uploads/u1/front.png").await;
        seed_photo(&h.storage, "uploads/u1/side.png").await;
        let mut job = job();
        job.side_photo_url = Some("http://localhost:9000/tryfitted/uploads/u1/side.png".into());

        let status = h.pipeline.process(&job).await.expect("process");
        assert_eq!(status, JobStatus::Completed);

        let recorded = h.api.recorded().await;
        let result = recorded.last().unwrap().1.result.as_ref().unwrap();
        assert_eq!(result.quality_report.confidence, Confidence::Medium);
        assert!(
            result
                .quality_report
                .warnings
                .iter()
                .any(|w| w.contains("silhouette refinement skipped"))
        );
        let keys = ArtifactKeys::for_job("j1");
        assert!(!exists(&h.storage, &keys.mask_front).await);
    }

    #[tokio::test]
    async fn failing_upload_resolves_to_store_failure() {
        use crate::storage::test_support::FlakyStore;
        use object_store::ObjectStore;

        let inner: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let seeder = ArtifactStore::with_store(inner.clone(), "localhost:9000", "tryfitted");
        seed_photo(&seeder, "uploads/u1/front.png").await;

        // Downloads pass through; every put is rejected, so the upload
        // stage exhausts its bounded retries.
        let flaky = Arc::new(FlakyStore::wrapping(inner, usize::MAX));
        let storage = ArtifactStore::with_store(flaky, "localhost:9000", "tryfitted");
        let h = harness_over(true, no_refine_cfg(), storage).await;

        let status = h.pipeline.process(&job()).await.expect("process");
        assert_eq!(status, JobStatus::Failed);

        let recorded = h.api.recorded().await;
        let last = &recorded.last().unwrap().1;
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.result.is_none());
        let error = last.error.as_deref().expect("error message");
        assert!(error.contains("store_failure"), "error: {error}");
        assert!(error.contains("upload_artifacts"));
    }

    #[tokio::test]
    async fn photo_download_failure_degrades_per_policy() {
        // URL is well formed but the object was never uploaded, so the
        // download fails and the body stage runs on the placeholder file.
        let h = harness(true, no_refine_cfg()).await;

        let status = h.pipeline.process(&job()).await.expect("process");
        assert_eq!(status, JobStatus::Completed);

        let recorded = h.api.recorded().await;
        let result = recorded.last().unwrap().1.result.as_ref().expect("result");
        assert_eq!(result.quality_report.confidence, Confidence::Medium);
        assert!(
            result
                .quality_report
                .warnings
                .iter()
                .any(|w| w.contains("placeholder body model")),
            "warnings: {:?}",
            result.quality_report.warnings
        );
    }

    #[tokio::test]
    async fn required_optimizer_missing_fails_with_dependency_missing() {
        let cfg = PipelineConfig {
            require_optimized_mesh: true,
            ..no_refine_cfg()
        };
        let h = harness(true, cfg).await;
        seed_photo(&h.storage, "uploads/u1/front.png").await;

        let status = h.pipeline.process(&job()).await.expect("process");
        assert_eq!(status, JobStatus::Failed);
        let recorded = h.api.recorded().await;
        let last = &recorded.last().unwrap().1;
        assert!(last.result.is_none());
        let error = last.error.as_deref().expect("error message");
        assert!(error.contains("optimize_mesh"), "error: {error}");
        assert!(error.contains("dependency_missing"));
    }

    #[tokio::test]
    async fn timeout_resolves_to_failed() {
        let cfg = PipelineConfig {
            job_timeout: Duration::ZERO,
            ..no_refine_cfg()
        };
        let h = harness(true, cfg).await;
        seed_photo(&h.storage, "uploads/u1/front.png").await;

        let status = h.pipeline.process(&job()).await.expect("process");
        assert_eq!(status, JobStatus::Failed);
        let recorded = h.api.recorded().await;
        let error = recorded.last().unwrap().1.error.as_deref().unwrap();
        assert!(error.contains("timeout"), "error: {error}");
    }

    #[test]
    fn policy_table_covers_every_stage_once() {
        let rules = stage_rules(&PipelineConfig::default());
        let names: Vec<_> = rules.iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec![
                "fetch_photos",
                "estimate_body",
                "refine_silhouette",
                "extract_measurements",
                "export_mesh",
                "optimize_mesh",
                "estimate_appearance",
                "upload_artifacts",
            ]
        );
    }

    #[test]
    fn strict_toggles_flow_into_the_table() {
        let strict = PipelineConfig {
            require_real_body_model: true,
            require_optimized_mesh: true,
            silhouette_refine_enabled: false,
            ..PipelineConfig::default()
        };
        let find = |name: &str| {
            stage_rules(&strict)
                .into_iter()
                .find(|r| r.name == name)
                .unwrap()
                .policy
        };
        assert_eq!(find("estimate_body"), StagePolicy::Strict { placeholder_ok: false });
        assert_eq!(find("optimize_mesh"), StagePolicy::BestEffort { required: true });
        assert_eq!(find("refine_silhouette"), StagePolicy::Optional { enabled: false });
    }

    #[test]
    fn confidence_thresholds_are_configurable() {
        let cfg = PipelineConfig::default();
        assert_eq!(derive_confidence(&cfg, 0, false), Confidence::High);
        assert_eq!(derive_confidence(&cfg, 1, false), Confidence::Medium);
        assert_eq!(derive_confidence(&cfg, 2, false), Confidence::Low);
        assert_eq!(derive_confidence(&cfg, 0, true), Confidence::Low);

        let lenient = PipelineConfig {
            medium_after_degradations: 2,
            low_after_degradations: 4,
            ..PipelineConfig::default()
        };
        assert_eq!(derive_confidence(&lenient, 1, false), Confidence::High);
        assert_eq!(derive_confidence(&lenient, 3, false), Confidence::Medium);
    }
}
