use crate::{config::env_parse, models::PhaseResponse, pipeline::Pipeline};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
#[error("analysis worker is not available")]
pub struct QueueClosed;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    jobs: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
}

struct Job {
    id: Uuid,
    listing_id: String,
    seller_id: String,
}

struct JobRecord {
    owner: String,
    listing_id: String,
    state: JobState,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: PhaseResponse },
    Failed { error: String, stage: Option<String> },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub listing_id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    /// Starts the single analysis worker. Jobs run one at a time in
    /// submission order.
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        let capacity = env_parse::<usize>("QUEUE_CAPACITY")
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_CAPACITY);
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);
        let jobs: Arc<Mutex<HashMap<Uuid, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let jobs_bg = jobs.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                set_state(&jobs_bg, job.id, JobState::Running).await;
                let state = match pipeline.analyze(&job.listing_id, &job.seller_id).await {
                    Ok(result) => JobState::Completed { result },
                    Err(err) => {
                        warn!(
                            target = "auction.jobs",
                            job_id = %job.id,
                            stage = err.stage(),
                            error = %err,
                            "job failed"
                        );
                        JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        }
                    }
                };
                set_state(&jobs_bg, job.id, state).await;
            }
        });

        (Self { tx, jobs }, handle)
    }

    pub async fn enqueue_analysis(
        &self,
        listing_id: &str,
        seller_id: &str,
    ) -> Result<Uuid, QueueClosed> {
        let id = Uuid::new_v4();
        self.jobs.lock().await.insert(
            id,
            JobRecord {
                owner: seller_id.to_string(),
                listing_id: listing_id.to_string(),
                state: JobState::Queued,
            },
        );
        let job = Job {
            id,
            listing_id: listing_id.to_string(),
            seller_id: seller_id.to_string(),
        };
        if self.tx.send(job).await.is_err() {
            self.jobs.lock().await.remove(&id);
            return Err(QueueClosed);
        }
        info!(target = "auction.jobs", job_id = %id, listing_id, "analysis queued");
        Ok(id)
    }

    /// Jobs are visible to the user who submitted them only.
    pub async fn get(&self, id: Uuid, user_id: &str) -> Option<JobInfo> {
        let guard = self.jobs.lock().await;
        guard
            .get(&id)
            .filter(|record| record.owner == user_id)
            .map(|record| JobInfo {
                id: id.to_string(),
                listing_id: record.listing_id.clone(),
                state: record.state.clone(),
            })
    }
}

async fn set_state(jobs: &Mutex<HashMap<Uuid, JobRecord>>, id: Uuid, state: JobState) {
    if let Some(record) = jobs.lock().await.get_mut(&id) {
        record.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::offline_pipeline;
    use crate::store::{MemoryStore, SharedStore};
    use std::time::Duration;

    #[tokio::test]
    async fn failed_job_reports_stage() {
        let store: SharedStore = Arc::new(MemoryStore::default());
        let (queue, _worker) = JobQueue::spawn(offline_pipeline(store));

        let id = queue.enqueue_analysis("missing", "seller-1").await.expect("enqueue");
        assert!(queue.get(id, "someone-else").await.is_none());

        let mut info = None;
        for _ in 0..50 {
            let current = queue.get(id, "seller-1").await.expect("job");
            if matches!(current.state, JobState::Failed { .. }) {
                info = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let info = info.expect("job finished");
        let value = serde_json::to_value(&info).expect("serialize");
        assert_eq!(value["state"], "failed");
        assert_eq!(value["stage"], "analyze");
        assert_eq!(value["listing_id"], "missing");
    }
}
