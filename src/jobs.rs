use crate::{
    models::{ApiError, ListingResponse},
    pipeline::Pipeline,
    security::AuthContext,
};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_RETAINED_JOBS: usize = 256;

/// Background listing runs, one worker draining a bounded channel.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    table: Arc<Mutex<JobTable>>,
}

struct Job {
    id: Uuid,
    url: String,
    context: AuthContext,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: Box<ListingResponse> },
    Failed { error: String, stage: Option<String> },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

/// Job states plus the order jobs finished in. Only the newest
/// `retain_finished` finished jobs are kept; pending jobs are never evicted.
struct JobTable {
    states: HashMap<Uuid, JobState>,
    finished: VecDeque<Uuid>,
    retain_finished: usize,
}

impl JobTable {
    fn new(retain_finished: usize) -> Self {
        Self {
            states: HashMap::new(),
            finished: VecDeque::new(),
            retain_finished: retain_finished.max(1),
        }
    }

    fn finish(&mut self, id: Uuid, state: JobState) {
        self.states.insert(id, state);
        self.finished.push_back(id);
        while self.finished.len() > self.retain_finished {
            if let Some(evicted) = self.finished.pop_front() {
                self.states.remove(&evicted);
            }
        }
    }
}

impl JobQueue {
    pub fn spawn(
        pipeline: Pipeline,
        capacity: usize,
        retain_finished: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let table = Arc::new(Mutex::new(JobTable::new(retain_finished)));
        let table_bg = table.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                table_bg.lock().await.states.insert(job.id, JobState::Running);
                info!(
                    target = "listing.api",
                    job_id = %job.id,
                    org_id = %job.context.org_id,
                    "job_started"
                );

                let state = match pipeline.run(&job.url).await {
                    Ok(resp) => JobState::Completed {
                        result: Box::new(resp),
                    },
                    Err(err) => {
                        warn!(
                            target = "listing.api",
                            job_id = %job.id,
                            stage = err.stage(),
                            error = %err,
                            "job_failed"
                        );
                        JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        }
                    }
                };
                table_bg.lock().await.finish(job.id, state);
            }
        });

        (Self { tx, table }, handle)
    }

    pub async fn enqueue_listing(
        &self,
        url: String,
        context: AuthContext,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        self.table.lock().await.states.insert(id, JobState::Queued);
        let job = Job { id, url, context };
        if self.tx.send(job).await.is_err() {
            self.table.lock().await.states.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.table.lock().await;
        guard.states.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

pub fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_QUEUE_CAPACITY)
}

pub fn retained_jobs_from_env() -> usize {
    std::env::var("JOB_RETENTION")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_RETAINED_JOBS)
}
