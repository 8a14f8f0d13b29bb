use crate::models::Measurements;
use crate::pipeline::PipelineError;
use serde_json::{Value, json};
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF"
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const RING_SEGMENTS: usize = 24;

/// Exports the parametric body as a GLB container: a low-poly surface of
/// revolution lofted through the measured cross-sections, scaled to the
/// requested height and grounded at y=0.
#[derive(Debug, Clone, Default)]
pub struct MeshExporter;

impl MeshExporter {
    pub fn new() -> Self {
        Self
    }

    pub async fn export(
        &self,
        measurements: &Measurements,
        height_cm: f64,
        out_path: &Path,
    ) -> Result<(), PipelineError> {
        let glb = build_glb(measurements, height_cm)
            .map_err(|err| PipelineError::compute("export_mesh", err))?;
        tokio::fs::write(out_path, &glb)
            .await
            .map_err(|err| PipelineError::compute("export_mesh", err.to_string()))?;
        info!(
            target = "avatar.mesh",
            path = %out_path.display(),
            bytes = glb.len(),
            "mesh exported"
        );
        Ok(())
    }
}

/// Profile rings from ankle to crown. Heights are fractions of stature;
/// radii come from the measured circumferences where one exists.
fn body_profile(m: &Measurements, height_m: f64) -> Vec<(f64, f64)> {
    let girth_radius = |circumference_cm: Option<f64>, default_cm: f64| -> f64 {
        circumference_cm.filter(|c| *c > 0.0).unwrap_or(default_cm) / 100.0 / (2.0 * PI)
    };

    let ankle = girth_radius(m.ankle_cm, 23.6);
    let calf = girth_radius(m.calf_cm, 37.4);
    let thigh = girth_radius(m.thigh_cm, 56.8);
    let hip = girth_radius(m.hip_cm, 95.7);
    let waist = girth_radius(m.waist_cm, 82.3);
    let chest = girth_radius(m.chest_cm, 98.5);
    let neck = girth_radius(m.neck_cm, 38.1);
    let head = neck * 1.6;

    vec![
        (0.00, ankle * 0.8),
        (0.04, ankle),
        (0.18, calf),
        (0.32, thigh * 0.8),
        (0.45, thigh),
        (0.53, hip),
        (0.62, waist),
        (0.72, chest),
        (0.80, neck * 1.2),
        (0.84, neck),
        (0.87, head),
        (0.93, head * 0.95),
        (1.00, head * 0.2),
    ]
    .into_iter()
    .map(|(frac, radius)| (frac * height_m, radius))
    .collect()
}

fn build_glb(measurements: &Measurements, height_cm: f64) -> Result<Vec<u8>, String> {
    if !(height_cm.is_finite() && height_cm > 0.0) {
        return Err(format!("invalid height: {height_cm}"));
    }
    let rings = body_profile(measurements, height_cm / 100.0);

    let mut positions: Vec<[f32; 3]> = Vec::with_capacity(rings.len() * RING_SEGMENTS);
    for (y, radius) in &rings {
        for seg in 0..RING_SEGMENTS {
            let angle = 2.0 * PI * seg as f64 / RING_SEGMENTS as f64;
            positions.push([
                (radius * angle.cos()) as f32,
                *y as f32,
                (radius * angle.sin()) as f32,
            ]);
        }
    }

    let mut indices: Vec<u16> = Vec::new();
    for ring in 0..rings.len() - 1 {
        let base = ring * RING_SEGMENTS;
        let next = base + RING_SEGMENTS;
        for seg in 0..RING_SEGMENTS {
            let seg1 = (seg + 1) % RING_SEGMENTS;
            let (a, b, c, d) = (
                (base + seg) as u16,
                (base + seg1) as u16,
                (next + seg) as u16,
                (next + seg1) as u16,
            );
            indices.extend_from_slice(&[a, c, b, b, c, d]);
        }
    }

    let mut min = [f32::MAX; 3];
    let mut max = [f32::MIN; 3];
    for p in &positions {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }

    let mut bin: Vec<u8> = Vec::new();
    for p in &positions {
        for v in p {
            bin.extend_from_slice(&v.to_le_bytes());
        }
    }
    let positions_len = bin.len();
    for i in &indices {
        bin.extend_from_slice(&i.to_le_bytes());
    }
    while bin.len() % 4 != 0 {
        bin.push(0);
    }

    let gltf = json!({
        "asset": {"version": "2.0", "generator": "avatar-worker-rs"},
        "scene": 0,
        "scenes": [{"nodes": [0]}],
        "nodes": [{"mesh": 0, "name": "body"}],
        "meshes": [{
            "primitives": [{
                "attributes": {"POSITION": 0},
                "indices": 1,
                "material": 0,
                "mode": 4,
            }]
        }],
        "materials": [{
            "name": "skin",
            "pbrMetallicRoughness": {
                "baseColorFactor": [0.8, 0.65, 0.55, 1.0],
                "metallicFactor": 0.0,
                "roughnessFactor": 0.9,
            }
        }],
        "buffers": [{"byteLength": bin.len()}],
        "bufferViews": [
            {"buffer": 0, "byteOffset": 0, "byteLength": positions_len, "target": 34962},
            {"buffer": 0, "byteOffset": positions_len, "byteLength": indices.len() * 2, "target": 34963},
        ],
        "accessors": [
            {
                "bufferView": 0,
                "componentType": 5126,
                "count": positions.len(),
                "type": "VEC3",
                "min": min,
                "max": max,
            },
            {
                "bufferView": 1,
                "componentType": 5123,
                "count": indices.len(),
                "type": "SCALAR",
            },
        ],
    });

    encode_glb(&gltf, &bin)
}

pub fn encode_glb(gltf: &Value, bin: &[u8]) -> Result<Vec<u8>, String> {
    let mut json_bytes = serde_json::to_vec(gltf).map_err(|err| err.to_string())?;
    while json_bytes.len() % 4 != 0 {
        json_bytes.push(b' ');
    }
    let total = 12 + 8 + json_bytes.len() + 8 + bin.len();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_bytes);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(bin);
    Ok(out)
}

/// Split a GLB container into its JSON document and binary chunk.
pub fn decode_glb(bytes: &[u8]) -> Result<(Value, Vec<u8>), String> {
    let u32_at = |offset: usize| -> Result<u32, String> {
        bytes
            .get(offset..offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| "truncated GLB".to_string())
    };

    if u32_at(0)? != GLB_MAGIC {
        return Err("not a GLB container".to_string());
    }
    if u32_at(4)? != 2 {
        return Err("unsupported GLB version".to_string());
    }

    let json_len = u32_at(12)? as usize;
    if u32_at(16)? != CHUNK_JSON {
        return Err("first chunk is not JSON".to_string());
    }
    let json_slice = bytes
        .get(20..20 + json_len)
        .ok_or_else(|| "truncated JSON chunk".to_string())?;
    let gltf: Value = serde_json::from_slice(json_slice).map_err(|err| err.to_string())?;

    let bin_header = 20 + json_len;
    let bin = if bytes.len() > bin_header {
        let bin_len = u32_at(bin_header)? as usize;
        if u32_at(bin_header + 4)? != CHUNK_BIN {
            return Err("second chunk is not BIN".to_string());
        }
        bytes
            .get(bin_header + 8..bin_header + 8 + bin_len)
            .ok_or_else(|| "truncated BIN chunk".to_string())?
            .to_vec()
    } else {
        Vec::new()
    };

    Ok((gltf, bin))
}

/// Mesh optimization executor wrapping the external `gltfpack` tool.
/// Missing binary surfaces as `DependencyMissing` so the orchestrator's
/// best-effort/strict policy can decide what to do with it.
#[derive(Debug, Clone)]
pub struct MeshOptimizer {
    gltfpack_path: String,
    simplify_ratio: f64,
}

impl MeshOptimizer {
    pub fn new(gltfpack_path: String) -> Self {
        Self {
            gltfpack_path,
            simplify_ratio: 0.6,
        }
    }

    pub fn is_available(&self) -> bool {
        resolve_binary(&self.gltfpack_path).is_some()
    }

    pub async fn optimize(&self, input: &Path, output: &Path) -> Result<(), PipelineError> {
        let ratio = self.simplify_ratio.to_string();
        let status = Command::new(&self.gltfpack_path)
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output)
            .arg("-si")
            .arg(&ratio)
            .status()
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    PipelineError::dependency_missing(
                        "optimize_mesh",
                        format!("gltfpack not found at `{}`", self.gltfpack_path),
                    )
                } else {
                    PipelineError::compute("optimize_mesh", err.to_string())
                }
            })?;
        if !status.success() {
            return Err(PipelineError::compute(
                "optimize_mesh",
                format!("gltfpack exited with {status}"),
            ));
        }
        if !output.exists() {
            return Err(PipelineError::compute(
                "optimize_mesh",
                "gltfpack reported success but produced no output",
            ));
        }
        info!(target = "avatar.mesh", output = %output.display(), "mesh optimized");
        Ok(())
    }
}

fn resolve_binary(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(candidate);
        if full.is_file() {
            return Some(full);
        }
    }
    warn!(
        target = "avatar.mesh",
        gltfpack = path,
        "gltfpack binary not found on PATH"
    );
    None
}
