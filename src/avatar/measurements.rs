use crate::avatar::body_model::BodyParams;
use crate::avatar::dir_has_files;
use crate::models::Measurements;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use tracing::warn;

/// Named anthropometric dimensions and their neutral-body values at a
/// reference height of 175 cm, paired with the shape-coefficient weights
/// that deform them. Girths respond mostly to the second and third
/// coefficients; vertical spans scale with height alone.
struct Dimension {
    base_cm: f64,
    scales_with_height: bool,
    beta_weights: [(usize, f64); 2],
}

const REFERENCE_HEIGHT_CM: f64 = 175.0;

static DIMENSIONS: Lazy<Vec<(&'static str, Dimension)>> = Lazy::new(|| {
    vec![
        ("chest", Dimension { base_cm: 98.5, scales_with_height: false, beta_weights: [(1, 4.2), (2, 1.1)] }),
        ("waist", Dimension { base_cm: 82.3, scales_with_height: false, beta_weights: [(2, 5.0), (1, 1.4)] }),
        ("hip", Dimension { base_cm: 95.7, scales_with_height: false, beta_weights: [(3, 4.6), (2, 1.2)] }),
        ("shoulder", Dimension { base_cm: 44.2, scales_with_height: true, beta_weights: [(1, 0.9), (0, 0.3)] }),
        ("sleeve", Dimension { base_cm: 61.8, scales_with_height: true, beta_weights: [(0, 0.5), (4, 0.2)] }),
        ("length", Dimension { base_cm: 68.4, scales_with_height: true, beta_weights: [(0, 0.6), (4, 0.3)] }),
        ("neck", Dimension { base_cm: 38.1, scales_with_height: false, beta_weights: [(1, 1.1), (2, 0.4)] }),
        ("bicep", Dimension { base_cm: 32.5, scales_with_height: false, beta_weights: [(1, 1.6), (3, 0.3)] }),
        ("forearm", Dimension { base_cm: 27.3, scales_with_height: false, beta_weights: [(1, 1.0), (3, 0.2)] }),
        ("wrist", Dimension { base_cm: 17.2, scales_with_height: false, beta_weights: [(1, 0.4), (0, 0.1)] }),
        ("thigh", Dimension { base_cm: 56.8, scales_with_height: false, beta_weights: [(3, 2.6), (2, 0.8)] }),
        ("calf", Dimension { base_cm: 37.4, scales_with_height: false, beta_weights: [(3, 1.3), (2, 0.3)] }),
        ("ankle", Dimension { base_cm: 23.6, scales_with_height: false, beta_weights: [(3, 0.4), (0, 0.1)] }),
        ("inside_leg", Dimension { base_cm: 78.9, scales_with_height: true, beta_weights: [(0, 0.8), (4, 0.2)] }),
    ]
});

/// Measurement extraction executor over the anthropometric body model.
/// Falls back to a fixed placeholder table when the body-model assets it
/// measures against are not provisioned.
#[derive(Debug, Clone)]
pub struct MeasurementExtractor {
    smplx_dir: PathBuf,
}

impl MeasurementExtractor {
    pub fn new(smplx_dir: PathBuf) -> Self {
        Self { smplx_dir }
    }

    pub fn is_available(&self) -> bool {
        dir_has_files(&self.smplx_dir)
    }

    /// Extract measurements; the bool is true when the placeholder table
    /// was used instead of the body model.
    pub fn extract(&self, params: &BodyParams) -> (Measurements, bool) {
        if !self.is_available() {
            warn!(
                target = "avatar.measure",
                "measurement assets not provisioned, using placeholder measurements"
            );
            return (placeholder_measurements(), true);
        }
        (self.from_betas(&params.betas, params.height_cm), false)
    }

    /// Pure betas→measurements mapping at a given height. Also used by the
    /// silhouette refinement loop to predict measurements for candidate
    /// coefficients.
    pub fn from_betas(&self, betas: &[f64], height_cm: f64) -> Measurements {
        let height_ratio = height_cm / REFERENCE_HEIGHT_CM;
        // Girths grow sublinearly with stature.
        let girth_ratio = height_ratio.sqrt();

        let mut computed = std::collections::HashMap::new();
        for (name, dim) in DIMENSIONS.iter() {
            let ratio = if dim.scales_with_height {
                height_ratio
            } else {
                girth_ratio
            };
            let mut v = dim.base_cm * ratio;
            for (idx, weight) in dim.beta_weights {
                v += betas.get(idx).copied().unwrap_or(0.0) * weight;
            }
            computed.insert(*name, v.max(0.0));
        }
        let value = |name: &str| -> f64 { computed.get(name).copied().unwrap_or(0.0) };

        let shoulder = value("shoulder");
        Measurements {
            chest_cm: Some(value("chest")),
            waist_cm: Some(value("waist")),
            hip_cm: Some(value("hip")),
            shoulder_cm: Some(shoulder),
            sleeve_cm: Some(value("sleeve")),
            length_cm: Some(value("length")),
            neck_cm: Some(value("neck")),
            bicep_cm: Some(value("bicep")),
            forearm_cm: Some(value("forearm")),
            wrist_cm: Some(value("wrist")),
            thigh_cm: Some(value("thigh")),
            calf_cm: Some(value("calf")),
            ankle_cm: Some(value("ankle")),
            inside_leg_cm: Some(value("inside_leg")),
            shoulder_breadth_cm: Some(shoulder),
            height_cm: Some(height_cm),
        }
    }
}

pub fn placeholder_measurements() -> Measurements {
    Measurements {
        chest_cm: Some(98.5),
        waist_cm: Some(82.3),
        hip_cm: Some(95.7),
        shoulder_cm: Some(44.2),
        sleeve_cm: Some(61.8),
        length_cm: Some(68.4),
        neck_cm: Some(38.1),
        bicep_cm: Some(32.5),
        forearm_cm: Some(27.3),
        wrist_cm: Some(17.2),
        thigh_cm: Some(56.8),
        calf_cm: Some(37.4),
        ankle_cm: Some(23.6),
        inside_leg_cm: Some(78.9),
        shoulder_breadth_cm: Some(42.1),
        height_cm: Some(175.0),
    }
}

/// Sanity warnings over an extracted measurement set. These go into the
/// quality report so a caller can tell "succeeded with caveats" apart from
/// a clean run.
pub fn measurement_warnings(measurements: &Measurements) -> Vec<String> {
    let mut warnings = Vec::new();

    let expected: [(&str, Option<f64>); 6] = [
        ("chestCm", measurements.chest_cm),
        ("waistCm", measurements.waist_cm),
        ("hipCm", measurements.hip_cm),
        ("shoulderCm", measurements.shoulder_cm),
        ("sleeveCm", measurements.sleeve_cm),
        ("lengthCm", measurements.length_cm),
    ];
    let missing: Vec<&str> = expected
        .iter()
        .filter(|(_, v)| v.map(|v| v == 0.0).unwrap_or(true))
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        warnings.push(format!("Missing or zero measurements: {}", missing.join(", ")));
    }

    let height = measurements.height_cm.unwrap_or(0.0);
    if !(140.0..=220.0).contains(&height) {
        warnings.push("Height measurement seems unrealistic".to_string());
    }
    let chest = measurements.chest_cm.unwrap_or(0.0);
    if !(70.0..=150.0).contains(&chest) {
        warnings.push("Chest measurement seems unrealistic".to_string());
    }

    warnings
}
