//! Background execution of pod workflows.
//!
//! HTTP handlers enqueue a job and answer with its id straight away; a single
//! dispatcher task drains the channel and runs every job on its own task, so
//! unrelated pods make progress concurrently. Records stay in memory until
//! they have been finished for longer than the retention window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::errors::{KaminoError, KaminoResult};
use crate::pods::{PodManager, PodReport};
use crate::users::Identity;

const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    CreatePod { template: String, owner: String },
    BulkCreate { template: String, owners: Vec<String> },
    DeletePod { pod_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub requested_by: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

struct Job {
    id: Uuid,
    kind: JobKind,
    caller: Identity,
}

type Records = Arc<RwLock<HashMap<Uuid, JobRecord>>>;

#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
    records: Records,
    retention: Duration,
    closing: Arc<Notify>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl JobQueue {
    /// Spawns the dispatcher, keeping finished records for
    /// `jobs.retention_secs`.
    pub fn start(manager: Arc<PodManager>) -> Self {
        let retention = manager.settings().jobs.retention();
        Self::start_with_retention(manager, retention)
    }

    pub fn start_with_retention(manager: Arc<PodManager>, retention: Duration) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let records: Records = Arc::new(RwLock::new(HashMap::new()));
        let closing = Arc::new(Notify::new());

        let dispatcher = tokio::spawn(dispatch(manager, records.clone(), receiver, closing.clone()));

        Self {
            sender,
            records,
            retention,
            closing,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
        }
    }

    pub async fn enqueue(&self, kind: JobKind, caller: &Identity) -> KaminoResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = JobRecord {
            id,
            kind: kind.clone(),
            requested_by: caller.username.clone(),
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        };
        {
            let mut records = self.records.write().await;
            let pruned = prune_finished(&mut records, now, self.retention);
            if pruned > 0 {
                debug!(pruned, "Dropped expired job records");
            }
            records.insert(id, record);
        }

        let job = Job {
            id,
            kind,
            caller: caller.clone(),
        };
        if self.sender.send(job).await.is_err() {
            self.records.write().await.remove(&id);
            return Err(KaminoError::Transient("job worker is not running".to_string()));
        }
        info!(job = %id, by = %caller.username, "Job queued");
        Ok(id)
    }

    /// Stops accepting jobs and waits for every queued or running one to
    /// finish. Later calls return immediately.
    pub async fn shutdown(&self) {
        self.closing.notify_one();
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Job dispatcher panicked");
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Jobs are visible to whoever submitted them and to admins.
    pub async fn get_for(&self, id: Uuid, caller: &Identity) -> KaminoResult<JobRecord> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| KaminoError::NotFound(format!("job {}", id)))?;
        if !caller.is_admin && record.requested_by != caller.username {
            return Err(KaminoError::Authorization(format!("job {} belongs to another user", id)));
        }
        Ok(record)
    }
}

async fn dispatch(
    manager: Arc<PodManager>,
    records: Records,
    mut receiver: mpsc::Receiver<Job>,
    closing: Arc<Notify>,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            job = receiver.recv() => match job {
                Some(job) => {
                    running.spawn(execute(manager.clone(), records.clone(), job));
                }
                None => break,
            },
            Some(done) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = done {
                    error!(error = %e, "Job task panicked");
                }
            }
            _ = closing.notified() => {
                // Buffered jobs are still delivered, then recv yields None.
                receiver.close();
            }
        }
    }

    if !running.is_empty() {
        info!(in_flight = running.len(), "Waiting for running jobs");
    }
    while let Some(done) = running.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "Job task panicked");
        }
    }
    debug!("job queue closed");
}

/// Removes records finished more than `retention` before `now`; queued and
/// running jobs are never dropped.
fn prune_finished(records: &mut HashMap<Uuid, JobRecord>, now: DateTime<Utc>, retention: Duration) -> usize {
    let retention_secs = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
    let before = records.len();
    records.retain(|_, record| match record.finished_at {
        Some(finished) => now.signed_duration_since(finished).num_seconds() < retention_secs,
        None => true,
    });
    before - records.len()
}

async fn execute(manager: Arc<PodManager>, records: Records, job: Job) {
    update(&records, job.id, |r| {
        r.status = JobStatus::Running;
        r.started_at = Some(Utc::now());
    })
    .await;

    let (status, result, error) = match run(&manager, &job).await {
        Ok((result, None)) => (JobStatus::Succeeded, Some(result), None),
        Ok((result, Some(problem))) => (JobStatus::Failed, Some(result), Some(problem)),
        Err(e) => {
            error!(job = %job.id, error = %e, "Job failed");
            (JobStatus::Failed, None, Some(e.to_string()))
        }
    };
    info!(job = %job.id, status = ?status, "Job finished");

    update(&records, job.id, |r| {
        r.status = status;
        r.finished_at = Some(Utc::now());
        r.result = result;
        r.error = error;
    })
    .await;
}

/// A pod that was rolled back or failed still carries its report, alongside
/// the error that marks the job failed.
async fn run(manager: &PodManager, job: &Job) -> KaminoResult<(Value, Option<String>)> {
    match &job.kind {
        JobKind::CreatePod { template, owner } => {
            report_outcome(manager.provision_pod(template, owner).await?)
        }
        JobKind::DeletePod { pod_name } => {
            report_outcome(manager.deprovision_pod(pod_name, &job.caller).await?)
        }
        JobKind::BulkCreate { template, owners } => {
            let report = manager.provision_bulk(template, owners).await?;
            Ok((serde_json::to_value(report)?, None))
        }
    }
}

fn report_outcome(report: PodReport) -> KaminoResult<(Value, Option<String>)> {
    let value = serde_json::to_value(&report)?;
    match report.into_result() {
        Ok(_) => Ok((value, None)),
        Err(e) => Ok((value, Some(e.to_string()))),
    }
}

async fn update(records: &Records, id: Uuid, apply: impl FnOnce(&mut JobRecord)) {
    if let Some(record) = records.write().await.get_mut(&id) {
        apply(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::core::proxmox::{ApiResponse, ClusterApi, HttpMethod};
    use crate::lock::{DistributedLock, MemoryLockStore};
    use crate::templates::InMemoryTemplateRegistry;
    use async_trait::async_trait;
    use std::time::Duration;

    /// A cluster that is down, and slow to say so.
    struct Unreachable {
        delay: Duration,
    }

    #[async_trait]
    impl ClusterApi for Unreachable {
        async fn request(&self, _: HttpMethod, path: &str, _: Option<&Value>) -> KaminoResult<ApiResponse> {
            tokio::time::sleep(self.delay).await;
            Err(KaminoError::Transient(format!("{} unreachable", path)))
        }
    }

    fn queue_with_delay(delay: Duration) -> JobQueue {
        let settings = Settings::default();
        let lock = DistributedLock::new(Arc::new(MemoryLockStore::new()), settings.lock.policy());
        let manager = PodManager::new(
            Arc::new(Unreachable { delay }),
            Arc::new(lock),
            Arc::new(InMemoryTemplateRegistry::new()),
            Arc::new(settings),
        );
        JobQueue::start(Arc::new(manager))
    }

    fn queue() -> JobQueue {
        queue_with_delay(Duration::ZERO)
    }

    fn create(owner: &str) -> JobKind {
        JobKind::CreatePod {
            template: "web".to_string(),
            owner: owner.to_string(),
        }
    }

    fn finished_record(finished_at: Option<DateTime<Utc>>) -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            kind: create("alice"),
            requested_by: "alice".to_string(),
            status: if finished_at.is_some() { JobStatus::Succeeded } else { JobStatus::Running },
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at,
            result: None,
            error: None,
        }
    }

    async fn settled(queue: &JobQueue, id: Uuid) -> JobRecord {
        for _ in 0..200 {
            if let Some(record) = queue.get(id).await {
                if matches!(record.status, JobStatus::Succeeded | JobStatus::Failed) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn hard_errors_fail_the_job() {
        let queue = queue();
        let alice = Identity::new("alice", false);
        let id = queue
            .enqueue(
                JobKind::CreatePod {
                    template: "web".to_string(),
                    owner: "alice".to_string(),
                },
                &alice,
            )
            .await
            .unwrap();

        let record = settled(&queue, id).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.result.is_none());
        assert!(record.error.unwrap().contains("unreachable"));
        assert!(record.started_at.is_some() && record.finished_at.is_some());
    }

    #[tokio::test]
    async fn records_are_private_to_their_submitter() {
        let queue = queue();
        let alice = Identity::new("alice", false);
        let id = queue
            .enqueue(
                JobKind::DeletePod {
                    pod_name: "1001_web_alice".to_string(),
                },
                &alice,
            )
            .await
            .unwrap();

        assert_eq!(queue.get_for(id, &alice).await.unwrap().requested_by, "alice");
        assert!(matches!(
            queue.get_for(id, &Identity::new("bob", false)).await,
            Err(KaminoError::Authorization(_))
        ));
        assert!(queue.get_for(id, &Identity::admin("root")).await.is_ok());
        assert!(matches!(
            queue.get_for(Uuid::new_v4(), &alice).await,
            Err(KaminoError::NotFound(_))
        ));
    }

    #[test]
    fn only_expired_finished_records_are_pruned() {
        let now = Utc::now();
        let old = finished_record(Some(now - chrono::Duration::seconds(120)));
        let recent = finished_record(Some(now - chrono::Duration::seconds(10)));
        let running = finished_record(None);
        let mut records: HashMap<Uuid, JobRecord> = [&old, &recent, &running]
            .into_iter()
            .map(|r| (r.id, r.clone()))
            .collect();

        assert_eq!(prune_finished(&mut records, now, Duration::from_secs(60)), 1);
        assert!(!records.contains_key(&old.id));
        assert!(records.contains_key(&recent.id));
        assert!(records.contains_key(&running.id));
    }

    #[tokio::test]
    async fn enqueue_drops_expired_records() {
        let queue = queue();
        let alice = Identity::new("alice", false);
        let first = queue.enqueue(create("alice"), &alice).await.unwrap();
        settled(&queue, first).await;

        // Age the finished record past the retention window.
        if let Some(record) = queue.records.write().await.get_mut(&first) {
            record.finished_at = Some(Utc::now() - chrono::Duration::days(2));
        }
        let second = queue.enqueue(create("alice"), &alice).await.unwrap();

        assert!(queue.get(first).await.is_none());
        assert!(queue.get(second).await.is_some());
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_jobs() {
        let queue = queue_with_delay(Duration::from_millis(50));
        let alice = Identity::new("alice", false);
        let mut ids = Vec::new();
        for owner in ["alice", "bob", "carol"] {
            ids.push(queue.enqueue(create(owner), &alice).await.unwrap());
        }

        queue.shutdown().await;
        for id in ids {
            let record = queue.get(id).await.unwrap();
            assert_eq!(record.status, JobStatus::Failed);
            assert!(record.finished_at.is_some());
        }

        assert!(matches!(
            queue.enqueue(create("dave"), &alice).await,
            Err(KaminoError::Transient(_))
        ));
        // A second shutdown has nothing left to wait for.
        queue.shutdown().await;
    }
}
