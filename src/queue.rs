use crate::models::{JobMessage, JobStatus};
use crate::pipeline::Pipeline;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

const POP_TIMEOUT_SECS: f64 = 5.0;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Consumes avatar jobs from the producer's Redis-list queue. Each message
/// is a job id; the payload lives in a per-job hash under the `data` field.
///
/// Delivery is at-least-once: a job moves from the wait list to the active
/// list on pop, and is only moved to a terminal list after the pipeline has
/// resolved it and reported the terminal status. A worker that dies mid-job
/// leaves the id parked in the active list for operators to requeue.
pub struct JobConsumer {
    client: redis::Client,
    queue: String,
    pipeline: Pipeline,
    concurrency: usize,
}

impl JobConsumer {
    pub fn new(
        redis_url: &str,
        queue: &str,
        pipeline: Pipeline,
        concurrency: usize,
    ) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            queue: queue.to_string(),
            pipeline,
            concurrency: concurrency.max(1),
        })
    }

    fn wait_key(&self) -> String {
        format!("bull:{}:wait", self.queue)
    }

    fn active_key(&self) -> String {
        format!("bull:{}:active", self.queue)
    }

    fn terminal_key(&self, status: JobStatus) -> String {
        format!("bull:{}:{}", self.queue, status.as_str())
    }

    fn job_key(&self, id: &str) -> String {
        format!("bull:{}:{}", self.queue, id)
    }

    /// Blocking consume loop. Pops job ids with BRPOPLPUSH and fans them out
    /// to the pipeline, bounded by the configured concurrency. Reconnects
    /// with a fixed delay on connection loss.
    pub async fn run(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        info!(
            target = "avatar.queue",
            queue = %self.queue,
            concurrency = self.concurrency,
            "consuming jobs"
        );

        loop {
            let conn = match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => conn,
                Err(err) => {
                    error!(target = "avatar.queue", error = %err, "redis connect failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            loop {
                let mut pop_conn = conn.clone();
                let popped: Result<Option<String>, redis::RedisError> = pop_conn
                    .brpoplpush(self.wait_key(), self.active_key(), POP_TIMEOUT_SECS)
                    .await;
                match popped {
                    Ok(None) => continue,
                    Ok(Some(id)) => {
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        let this = self.clone();
                        let task_conn = conn.clone();
                        tokio::spawn(async move {
                            this.handle(task_conn, &id).await;
                            drop(permit);
                        });
                    }
                    Err(err) => {
                        warn!(target = "avatar.queue", error = %err, "redis pop failed, reconnecting");
                        break;
                    }
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn handle(&self, mut conn: MultiplexedConnection, id: &str) {
        let raw: Option<String> = match conn.hget(self.job_key(id), "data").await {
            Ok(raw) => raw,
            Err(err) => {
                // Leave the id in the active list; without the payload there
                // is nothing safe to do with it.
                error!(target = "avatar.queue", job_id = %id, error = %err, "job hash unreadable");
                return;
            }
        };
        let Some(raw) = raw else {
            warn!(target = "avatar.queue", job_id = %id, "job hash missing data field, dead-lettering");
            self.settle(&mut conn, id, JobStatus::Failed, "missing job data")
                .await;
            return;
        };

        let job = match decode_job(&raw) {
            Ok(job) => job,
            Err(err) => {
                // Malformed payloads would fail identically on every
                // redelivery, so they go straight to the failed list.
                warn!(target = "avatar.queue", job_id = %id, error = %err, "malformed job data, dead-lettering");
                self.settle(&mut conn, id, JobStatus::Failed, &format!("malformed job data: {err}"))
                    .await;
                return;
            }
        };

        match self.pipeline.process(&job).await {
            Ok(status) => {
                self.settle(&mut conn, id, status, status.as_str()).await;
            }
            Err(err) => {
                // Terminal callback could not be delivered at all. The queue
                // still settles so it cannot wedge on one job, but the job
                // store record may be stale.
                error!(
                    target = "avatar.queue",
                    job_id = %id,
                    error = %err,
                    "terminal status report undeliverable"
                );
                self.settle(
                    &mut conn,
                    id,
                    JobStatus::Failed,
                    &format!("terminal status report undeliverable: {err}"),
                )
                .await;
            }
        }
    }

    /// Move the job id from the active list to its terminal list and stamp
    /// the job hash, atomically.
    async fn settle(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
        status: JobStatus,
        detail: &str,
    ) {
        let job_key = self.job_key(id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.active_key(), 1, id)
            .ignore()
            .lpush(self.terminal_key(status), id)
            .ignore()
            .hset(&job_key, "finishedOn", Utc::now().timestamp_millis())
            .ignore();
        match status {
            JobStatus::Completed => {
                pipe.hset(&job_key, "returnvalue", detail).ignore();
            }
            _ => {
                pipe.hset(&job_key, "failedReason", detail).ignore();
            }
        }
        if let Err(err) = pipe.query_async::<()>(conn).await {
            error!(target = "avatar.queue", job_id = %id, error = %err, "failed to settle job in redis");
        }
    }
}

fn decode_job(raw: &str) -> Result<JobMessage, serde_json::Error> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::JobStoreClient;
    use crate::config::{AssetConfig, PipelineConfig};
    use crate::storage::ArtifactStore;
    use object_store::memory::InMemory;

    fn consumer() -> JobConsumer {
        let dir = std::env::temp_dir();
        let assets = AssetConfig {
            root: dir.clone(),
            body_model_dir: dir.join("none-body"),
            smplx_model_dir: dir.join("none-smplx"),
            segmentor_weights_dir: dir.join("none-seg"),
            segmentor_path: None,
            gltfpack_path: "gltfpack".to_string(),
        };
        let storage = ArtifactStore::with_store(Arc::new(InMemory::new()), "localhost:9000", "b");
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            &assets,
            storage,
            JobStoreClient::recording(1),
        );
        JobConsumer::new("redis://localhost:6379", "avatar-jobs", pipeline, 2).expect("consumer")
    }

    #[test]
    fn queue_keys_follow_the_bull_layout() {
        let consumer = consumer();
        assert_eq!(consumer.wait_key(), "bull:avatar-jobs:wait");
        assert_eq!(consumer.active_key(), "bull:avatar-jobs:active");
        assert_eq!(
            consumer.terminal_key(JobStatus::Completed),
            "bull:avatar-jobs:completed"
        );
        assert_eq!(
            consumer.terminal_key(JobStatus::Failed),
            "bull:avatar-jobs:failed"
        );
        assert_eq!(consumer.job_key("42"), "bull:avatar-jobs:42");
    }

    #[test]
    fn decode_accepts_the_producer_payload() {
        let raw = r#"{
            "jobId": "a1b2",
            "frontPhotoUrl": "http://minio:9000/tryfitted/uploads/u/front.jpg",
            "sidePhotoUrl": "http://minio:9000/tryfitted/uploads/u/side.jpg",
            "heightCm": 181.5,
            "userId": "user-7"
        }"#;
        let job = decode_job(raw).expect("decode");
        assert_eq!(job.job_id, "a1b2");
        assert_eq!(job.height_cm, 181.5);
        assert_eq!(job.user_id(), "user-7");
    }

    #[test]
    fn decode_tolerates_missing_optional_fields() {
        let job = decode_job(r#"{"jobId": "x", "heightCm": 170}"#).expect("decode");
        assert!(job.front_photo_url.is_none());
        assert!(job.side_photo_url.is_none());
        assert_eq!(job.user_id(), "default-user");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_job("not json").is_err());
        assert!(decode_job(r#"{"jobId": "x"}"#).is_err());
    }
}
