use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One avatar build request, as published on the queue by the API when a
/// generation request is accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: String,
    pub front_photo_url: Option<String>,
    #[serde(default)]
    pub side_photo_url: Option<String>,
    pub height_cm: f64,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl JobMessage {
    pub fn user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or("default-user")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Body measurements in centimeters. Every field is optional on the wire;
/// absent fields mean the extractor could not produce them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chest_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waist_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hip_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shoulder_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleeve_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neck_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bicep_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forearm_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrist_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thigh_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calf_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ankle_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inside_leg_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shoulder_breadth_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Attached to the `completed` status callback; the callback handler
/// creates the Avatar record from it atomically with the status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub user_id: String,
    pub glb_url: String,
    pub measurements: Measurements,
    pub quality_report: QualityReport,
}

/// PATCH body for the job status callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

#[derive(Debug, Serialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_message_decodes_camel_case() {
        let msg: JobMessage = serde_json::from_str(
            r#"{"jobId":"j1","frontPhotoUrl":"http://x/uploads/a.jpg","heightCm":175}"#,
        )
        .expect("decode");
        assert_eq!(msg.job_id, "j1");
        assert_eq!(msg.height_cm, 175.0);
        assert!(msg.side_photo_url.is_none());
        assert_eq!(msg.user_id(), "default-user");
    }

    #[test]
    fn status_update_omits_empty_fields() {
        let update = StatusUpdate {
            status: JobStatus::Processing,
            error: None,
            progress: Some(20),
            result: None,
        };
        let json = serde_json::to_value(&update).expect("encode");
        assert_eq!(json["status"], "processing");
        assert_eq!(json["progress"], 20);
        assert!(json.get("error").is_none());
        assert!(json.get("result").is_none());
    }

    #[test]
    fn confidence_orders_high_to_low() {
        assert!(Confidence::High < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::Low);
    }

    #[test]
    fn measurements_serialize_to_wire_names() {
        let m = Measurements {
            chest_cm: Some(98.5),
            inside_leg_cm: Some(78.9),
            ..Default::default()
        };
        let json = serde_json::to_value(&m).expect("encode");
        assert_eq!(json["chestCm"], 98.5);
        assert_eq!(json["insideLegCm"], 78.9);
        assert!(json.get("waistCm").is_none());
    }
}
