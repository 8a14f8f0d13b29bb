use crate::models::{JobResult, JobStatus, StatusUpdate};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("callback rejected: HTTP {0}")]
    Status(u16),
}

/// Client for the system of record. Job status callbacks are PATCH
/// semantics on the job id; the `completed` callback carries the result
/// the API uses to create the Avatar record.
///
/// With no base URL configured the client records updates in memory
/// instead of calling out, which is how offline runs and tests observe
/// the status sequence.
#[derive(Clone)]
pub struct JobStoreClient {
    inner: ClientMode,
    terminal_max_attempts: usize,
}

#[derive(Clone)]
enum ClientMode {
    Http { http: Client, base_url: String },
    Recording(Arc<Mutex<Vec<(String, StatusUpdate)>>>),
}

impl JobStoreClient {
    pub fn new(base_url: Option<String>, terminal_max_attempts: usize) -> Self {
        let inner = match base_url {
            Some(url) => ClientMode::Http {
                http: build_client(),
                base_url: url.trim_end_matches('/').to_string(),
            },
            None => {
                warn!(
                    target = "avatar.api",
                    "API_BASE_URL not set; job status callbacks are recorded locally only"
                );
                ClientMode::Recording(Arc::new(Mutex::new(Vec::new())))
            }
        };
        Self {
            inner,
            terminal_max_attempts: terminal_max_attempts.max(1),
        }
    }

    pub fn recording(terminal_max_attempts: usize) -> Self {
        Self {
            inner: ClientMode::Recording(Arc::new(Mutex::new(Vec::new()))),
            terminal_max_attempts: terminal_max_attempts.max(1),
        }
    }

    /// Non-terminal progress callback. Single attempt; a miss only costs
    /// observability, so failures are logged and swallowed.
    pub async fn report_progress(&self, job_id: &str, progress: u8) {
        let update = StatusUpdate {
            status: JobStatus::Processing,
            error: None,
            progress: Some(progress),
            result: None,
        };
        if let Err(err) = self.send(job_id, &update).await {
            warn!(
                target = "avatar.api",
                job_id = %job_id,
                progress = progress,
                error = %err,
                "progress callback failed"
            );
        }
    }

    /// Terminal callback, retried aggressively: an unreported terminal
    /// state leaves the job stuck in `processing` from the caller's view.
    pub async fn report_terminal(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
        result: Option<JobResult>,
    ) -> Result<(), ApiError> {
        debug_assert!(status.is_terminal());
        let update = StatusUpdate {
            status,
            error,
            progress: (status == JobStatus::Completed).then_some(100),
            result,
        };
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.send(job_id, &update).await {
                Ok(()) => {
                    info!(
                        target = "avatar.api",
                        job_id = %job_id,
                        status = status.as_str(),
                        "terminal status reported"
                    );
                    return Ok(());
                }
                Err(err) if attempt < self.terminal_max_attempts => {
                    let backoff = Duration::from_millis(250 * (1 << attempt.min(6)) as u64);
                    warn!(
                        target = "avatar.api",
                        job_id = %job_id,
                        attempt = attempt,
                        error = %err,
                        "terminal callback failed, retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    error!(
                        target = "avatar.api",
                        job_id = %job_id,
                        error = %err,
                        "terminal callback exhausted retries"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn send(&self, job_id: &str, update: &StatusUpdate) -> Result<(), ApiError> {
        match &self.inner {
            ClientMode::Http { http, base_url } => {
                let url = format!("{base_url}/v1/avatar/jobs/{job_id}/status");
                let response = http
                    .patch(url)
                    .json(update)
                    .send()
                    .await
                    .map_err(|err| ApiError::Request(err.to_string()))?;
                if !response.status().is_success() {
                    return Err(ApiError::Status(response.status().as_u16()));
                }
                Ok(())
            }
            ClientMode::Recording(log) => {
                log.lock().await.push((job_id.to_string(), update.clone()));
                Ok(())
            }
        }
    }

    /// Recorded `(job_id, update)` pairs, in order. Empty in HTTP mode.
    pub async fn recorded(&self) -> Vec<(String, StatusUpdate)> {
        match &self.inner {
            ClientMode::Http { .. } => Vec::new(),
            ClientMode::Recording(log) => log.lock().await.clone(),
        }
    }
}

fn build_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| Client::new())
}
