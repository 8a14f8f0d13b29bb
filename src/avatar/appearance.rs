use crate::avatar::mesh::{decode_glb, encode_glb};
use serde_json::{Value, json};
use std::path::Path;
use tracing::{info, warn};

/// Skin tone estimation from the front photo plus a tint pass over the
/// exported mesh material. Heuristic and intentionally cheap; a likeness
/// model would replace this wholesale.
#[derive(Debug, Clone, Default)]
pub struct AppearanceEstimator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkinColor {
    pub rgb: (u8, u8, u8),
}

impl SkinColor {
    pub fn hex(&self) -> String {
        let (r, g, b) = self.rgb;
        format!("#{r:02x}{g:02x}{b:02x}")
    }

    pub fn to_json(&self) -> Value {
        let (r, g, b) = self.rgb;
        json!({"rgb": [r, g, b], "hex": self.hex()})
    }
}

impl AppearanceEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Estimate a representative skin tone from the photo: sample a
    /// central upper region (reduces background and clothing influence),
    /// keep pixels passing a conservative YCbCr skin test, take the
    /// channel-wise median. None when the photo is unreadable or the mask
    /// is too sparse to trust.
    pub async fn estimate_skin_color(&self, photo: &Path) -> Option<SkinColor> {
        let photo = photo.to_path_buf();
        let result = tokio::task::spawn_blocking(move || estimate_from_file(&photo))
            .await
            .ok()
            .flatten();
        match &result {
            Some(color) => info!(
                target = "avatar.appearance",
                hex = %color.hex(),
                "skin tone estimated"
            ),
            None => warn!(
                target = "avatar.appearance",
                "skin tone estimation produced no usable sample"
            ),
        }
        result
    }

    /// Rewrite the GLB material base color to the estimated tone. Errors
    /// are returned for the caller to decide on; the pipeline treats them
    /// as best-effort.
    pub async fn apply_skin_tone(&self, glb_path: &Path, color: SkinColor) -> Result<(), String> {
        let bytes = tokio::fs::read(glb_path)
            .await
            .map_err(|err| err.to_string())?;
        let (mut gltf, bin) = decode_glb(&bytes)?;

        let (r, g, b) = color.rgb;
        // Base color factors are linear; photo samples are sRGB.
        let factor = json!([srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b), 1.0]);
        let materials = gltf
            .get_mut("materials")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| "GLB has no materials".to_string())?;
        for material in materials.iter_mut() {
            material["pbrMetallicRoughness"]["baseColorFactor"] = factor.clone();
        }

        let out = encode_glb(&gltf, &bin)?;
        tokio::fs::write(glb_path, out)
            .await
            .map_err(|err| err.to_string())
    }
}

fn estimate_from_file(photo: &Path) -> Option<SkinColor> {
    let img = image::open(photo).ok()?.to_rgb8();
    let (width, height) = img.dimensions();
    if width < 16 || height < 16 {
        return None;
    }

    // Central upper ROI: top 65% of rows, middle 60% of columns.
    let y1 = (height as f64 * 0.65) as u32;
    let x0 = (width as f64 * 0.2) as u32;
    let x1 = (width as f64 * 0.8) as u32;

    let mut reds = Vec::new();
    let mut greens = Vec::new();
    let mut blues = Vec::new();
    for y in 0..y1 {
        for x in x0..x1 {
            let [r, g, b] = img.get_pixel(x, y).0;
            if is_skin_ycbcr(r, g, b) {
                reds.push(r);
                greens.push(g);
                blues.push(b);
            }
        }
    }

    let sampled = (y1 as usize) * ((x1 - x0) as usize);
    if sampled == 0 || reds.len() * 100 < sampled {
        // Under 1% of the ROI looked like skin; don't guess.
        return None;
    }

    Some(SkinColor {
        rgb: (median(&mut reds), median(&mut greens), median(&mut blues)),
    })
}

/// Classic conservative CbCr box test.
fn is_skin_ycbcr(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

fn median(values: &mut [u8]) -> u8 {
    values.sort_unstable();
    values[values.len() / 2]
}

fn srgb_to_linear(channel: u8) -> f64 {
    let c = channel as f64 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::measurements::placeholder_measurements;
    use crate::avatar::mesh::MeshExporter;
    use image::{Rgb, RgbImage};

    #[test]
    fn skin_color_hex_formatting() {
        let color = SkinColor { rgb: (0xc8, 0x96, 0x78) };
        assert_eq!(color.hex(), "#c89678");
        assert_eq!(color.to_json()["rgb"], json!([200, 150, 120]));
    }

    #[test]
    fn skin_test_accepts_typical_tones_and_rejects_sky() {
        assert!(is_skin_ycbcr(200, 150, 120));
        assert!(is_skin_ycbcr(140, 100, 80));
        assert!(!is_skin_ycbcr(80, 140, 220));
        assert!(!is_skin_ycbcr(30, 30, 30));
    }

    #[tokio::test]
    async fn estimates_tone_from_synthetic_portrait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("front.png");
        let mut img = RgbImage::from_pixel(64, 96, Rgb([40, 40, 40]));
        for y in 8..48 {
            for x in 20..44 {
                img.put_pixel(x, y, Rgb([198, 148, 118]));
            }
        }
        img.save(&path).unwrap();

        let estimator = AppearanceEstimator::new();
        let color = estimator
            .estimate_skin_color(&path)
            .await
            .expect("skin tone");
        let (r, g, b) = color.rgb;
        assert!(r > g && g > b, "expected warm tone, got {:?}", color.rgb);
    }

    #[tokio::test]
    async fn no_tone_from_skinless_photo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("front.png");
        RgbImage::from_pixel(64, 96, Rgb([20, 60, 160]))
            .save(&path)
            .unwrap();
        let estimator = AppearanceEstimator::new();
        assert!(estimator.estimate_skin_color(&path).await.is_none());
    }

    #[tokio::test]
    async fn tint_rewrites_material_base_color() {
        let dir = tempfile::tempdir().unwrap();
        let glb_path = dir.path().join("avatar.glb");
        MeshExporter::new()
            .export(&placeholder_measurements(), 175.0, &glb_path)
            .await
            .expect("export");

        let estimator = AppearanceEstimator::new();
        estimator
            .apply_skin_tone(&glb_path, SkinColor { rgb: (200, 150, 120) })
            .await
            .expect("tint");

        let bytes = std::fs::read(&glb_path).unwrap();
        let (gltf, _) = decode_glb(&bytes).expect("decode");
        let factor = &gltf["materials"][0]["pbrMetallicRoughness"]["baseColorFactor"];
        let r = factor[0].as_f64().unwrap();
        let b = factor[2].as_f64().unwrap();
        assert!(r > b, "red channel should dominate after tint");
        assert_eq!(factor[3], json!(1.0));
    }
}
