use crate::avatar::dir_has_files;
use crate::avatar::measurements::MeasurementExtractor;
use crate::pipeline::PipelineError;
use serde::Deserialize;
use serde_json::{Value, json};
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Per-view output of the external segmentor: a binary person mask plus a
/// stats document with the silhouette extents in pixels.
#[derive(Debug, Clone)]
pub struct MaskOutput {
    pub mask_path: PathBuf,
    pub stats: MaskStats,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskStats {
    pub height_px: f64,
    pub chest_width_px: f64,
    pub waist_width_px: f64,
    pub hip_width_px: f64,
}

/// Cross-section circumference targets derived from front+side masks.
#[derive(Debug, Clone, PartialEq)]
pub struct SilhouetteTargets {
    pub height_px: f64,
    pub px_to_cm: f64,
    pub chest_cm: f64,
    pub waist_cm: f64,
    pub hip_cm: f64,
}

impl SilhouetteTargets {
    pub fn to_json(&self) -> Value {
        json!({
            "heightPx": self.height_px,
            "pxToCm": self.px_to_cm,
            "chestCm": self.chest_cm,
            "waistCm": self.waist_cm,
            "hipCm": self.hip_cm,
        })
    }
}

/// Optional silhouette-refinement executor. Delegates segmentation to an
/// external tool, turns the two silhouettes into circumference targets,
/// and nudges the shape coefficients until predicted measurements match.
#[derive(Debug, Clone)]
pub struct SilhouetteRefiner {
    segmentor_path: Option<PathBuf>,
    weights_dir: PathBuf,
    torso_erode_px: u32,
}

impl SilhouetteRefiner {
    pub fn new(segmentor_path: Option<PathBuf>, weights_dir: PathBuf, torso_erode_px: u32) -> Self {
        Self {
            segmentor_path,
            weights_dir,
            torso_erode_px,
        }
    }

    /// Refinement needs both the segmentor binary and its weights.
    pub fn is_available(&self) -> bool {
        self.segmentor_path
            .as_deref()
            .map(Path::is_file)
            .unwrap_or(false)
            && dir_has_files(&self.weights_dir)
    }

    pub async fn generate_mask(
        &self,
        photo: &Path,
        debug_dir: &Path,
        view: &str,
    ) -> Result<MaskOutput, PipelineError> {
        let segmentor = self.segmentor_path.as_deref().ok_or_else(|| {
            PipelineError::dependency_missing("refine_silhouette", "segmentor not configured")
        })?;
        tokio::fs::create_dir_all(debug_dir)
            .await
            .map_err(|err| PipelineError::compute("refine_silhouette", err.to_string()))?;
        let mask_path = debug_dir.join(format!("mask_{view}.png"));
        let stats_path = debug_dir.join(format!("{view}_silhouette.json"));

        let status = Command::new(segmentor)
            .arg("--input")
            .arg(photo)
            .arg("--mask")
            .arg(&mask_path)
            .arg("--stats")
            .arg(&stats_path)
            .arg("--erode")
            .arg(self.torso_erode_px.to_string())
            .arg("--view")
            .arg(view)
            .status()
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    PipelineError::dependency_missing(
                        "refine_silhouette",
                        format!("segmentor not found at `{}`", segmentor.display()),
                    )
                } else {
                    PipelineError::compute("refine_silhouette", err.to_string())
                }
            })?;
        if !status.success() {
            return Err(PipelineError::compute(
                "refine_silhouette",
                format!("segmentor exited with {status} for {view} view"),
            ));
        }

        let raw = tokio::fs::read(&stats_path)
            .await
            .map_err(|err| PipelineError::compute("refine_silhouette", err.to_string()))?;
        let stats: MaskStats = serde_json::from_slice(&raw).map_err(|err| {
            PipelineError::compute(
                "refine_silhouette",
                format!("invalid segmentor stats for {view} view: {err}"),
            )
        })?;
        debug!(
            target = "avatar.silhouette",
            view = view,
            height_px = stats.height_px,
            "mask generated"
        );
        Ok(MaskOutput { mask_path, stats })
    }

    /// Front widths and side depths give elliptical cross sections; the
    /// stated height calibrates pixels to centimeters.
    pub fn estimate_targets(
        &self,
        front: &MaskStats,
        side: &MaskStats,
        height_cm: f64,
    ) -> Result<SilhouetteTargets, PipelineError> {
        if front.height_px <= 0.0 || side.height_px <= 0.0 {
            return Err(PipelineError::compute(
                "refine_silhouette",
                "mask reports non-positive silhouette height",
            ));
        }
        let px_to_cm = height_cm / front.height_px;
        let side_px_to_cm = height_cm / side.height_px;

        let girth = |width_px: f64, depth_px: f64| {
            ellipse_circumference(width_px * px_to_cm / 2.0, depth_px * side_px_to_cm / 2.0)
        };

        Ok(SilhouetteTargets {
            height_px: front.height_px,
            px_to_cm,
            chest_cm: girth(front.chest_width_px, side.chest_width_px),
            waist_cm: girth(front.waist_width_px, side.waist_width_px),
            hip_cm: girth(front.hip_width_px, side.hip_width_px),
        })
    }

    /// Nudge the girth coefficients until predicted chest/waist/hip match
    /// the silhouette targets: damped per-target Newton steps with a weak
    /// pull back toward the initial estimate.
    pub fn refine_betas(
        &self,
        extractor: &MeasurementExtractor,
        initial: &[f64],
        height_cm: f64,
        targets: &SilhouetteTargets,
    ) -> Vec<f64> {
        const MAX_SWEEPS: usize = 40;
        const STEP: f64 = 0.8;
        const REG: f64 = 0.08;
        const TOLERANCE_CM: f64 = 0.1;
        const PROBE: f64 = 0.05;

        let initial = pad_betas(initial);
        let mut betas = initial.clone();

        // (beta index, target, weight); waist errors cost fit accuracy most.
        let goals: [(usize, f64, f64); 3] = [
            (1, targets.chest_cm, 1.0),
            (2, targets.waist_cm, 1.2),
            (3, targets.hip_cm, 1.0),
        ];
        let measured = |betas: &[f64], idx: usize| -> f64 {
            let m = extractor.from_betas(betas, height_cm);
            match idx {
                1 => m.chest_cm.unwrap_or(0.0),
                2 => m.waist_cm.unwrap_or(0.0),
                _ => m.hip_cm.unwrap_or(0.0),
            }
        };

        for _ in 0..MAX_SWEEPS {
            let mut worst = 0.0f64;
            for (idx, target, weight) in goals {
                let current = measured(&betas, idx);
                let residual = current - target;
                worst = worst.max(residual.abs());
                if residual.abs() < TOLERANCE_CM {
                    continue;
                }
                let mut probe = betas.clone();
                probe[idx] += PROBE;
                let gradient = (measured(&probe, idx) - current) / PROBE;
                if gradient.abs() < 1e-6 {
                    continue;
                }
                betas[idx] -= (STEP * weight).min(1.0) * residual / gradient;
                betas[idx] = betas[idx].clamp(-5.0, 5.0);
            }
            if worst < TOLERANCE_CM {
                break;
            }
            for i in 0..betas.len() {
                betas[i] -= REG * (betas[i] - initial[i]);
            }
        }

        info!(
            target = "avatar.silhouette",
            chest = targets.chest_cm,
            waist = targets.waist_cm,
            hip = targets.hip_cm,
            "betas refined to silhouette targets"
        );
        betas
    }
}

fn pad_betas(betas: &[f64]) -> Vec<f64> {
    let mut out = betas.to_vec();
    out.resize(10, 0.0);
    out.truncate(10);
    out
}

/// Ramanujan's approximation for the perimeter of an ellipse with
/// semi-axes `a` and `b` (cm).
fn ellipse_circumference(a: f64, b: f64) -> f64 {
    let (a, b) = (a.abs(), b.abs());
    PI * (3.0 * (a + b) - ((3.0 * a + b) * (a + 3.0 * b)).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refiner() -> SilhouetteRefiner {
        SilhouetteRefiner::new(None, PathBuf::from("/nonexistent"), 8)
    }

    fn stats(height_px: f64, chest: f64, waist: f64, hip: f64) -> MaskStats {
        MaskStats {
            height_px,
            chest_width_px: chest,
            waist_width_px: waist,
            hip_width_px: hip,
        }
    }

    #[test]
    fn unavailable_without_segmentor() {
        assert!(!refiner().is_available());
    }

    #[test]
    fn circle_circumference_matches_closed_form() {
        let c = ellipse_circumference(10.0, 10.0);
        assert!((c - 2.0 * PI * 10.0).abs() < 1e-6);
    }

    #[test]
    fn targets_scale_with_stated_height() {
        let r = refiner();
        let front = stats(800.0, 160.0, 130.0, 155.0);
        let side = stats(800.0, 110.0, 95.0, 115.0);
        let t175 = r.estimate_targets(&front, &side, 175.0).expect("targets");
        let t190 = r.estimate_targets(&front, &side, 190.0).expect("targets");
        assert!((t175.px_to_cm - 175.0 / 800.0).abs() < 1e-9);
        assert!(t190.chest_cm > t175.chest_cm);
        assert!(t175.waist_cm < t175.chest_cm);
    }

    #[test]
    fn degenerate_mask_height_is_rejected() {
        let r = refiner();
        let err = r
            .estimate_targets(&stats(0.0, 1.0, 1.0, 1.0), &stats(10.0, 1.0, 1.0, 1.0), 175.0)
            .expect_err("should reject");
        assert_eq!(err.kind(), crate::pipeline::PipelineErrorKind::ComputeFailure);
    }

    #[test]
    fn stats_decode_camel_case() {
        let stats: MaskStats = serde_json::from_str(
            r#"{"heightPx":812,"chestWidthPx":161.5,"waistWidthPx":130.0,"hipWidthPx":150.2}"#,
        )
        .expect("decode");
        assert_eq!(stats.height_px, 812.0);
        assert_eq!(stats.chest_width_px, 161.5);
    }

    #[test]
    fn refinement_converges_toward_targets() {
        let dir = tempfile::tempdir().unwrap();
        let smplx = dir.path().join("smplx");
        std::fs::create_dir_all(&smplx).unwrap();
        std::fs::write(smplx.join("SMPLX_NEUTRAL.npz"), b"m").unwrap();
        let extractor = MeasurementExtractor::new(smplx);

        let r = refiner();
        let initial = vec![0.0; 10];
        let baseline = extractor.from_betas(&initial, 175.0);
        let targets = SilhouetteTargets {
            height_px: 800.0,
            px_to_cm: 175.0 / 800.0,
            chest_cm: baseline.chest_cm.unwrap() + 6.0,
            waist_cm: baseline.waist_cm.unwrap() - 4.0,
            hip_cm: baseline.hip_cm.unwrap() + 2.0,
        };

        let refined = r.refine_betas(&extractor, &initial, 175.0, &targets);
        let result = extractor.from_betas(&refined, 175.0);
        assert!((result.chest_cm.unwrap() - targets.chest_cm).abs() < 1.0);
        assert!((result.waist_cm.unwrap() - targets.waist_cm).abs() < 1.0);
        assert!((result.hip_cm.unwrap() - targets.hip_cm).abs() < 1.0);
    }
}
