//! Named FIFO queues of pending job ids and the lifecycle transitions of their jobs.
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    job::{ErrorType, Job, JobError, JobId, JobStatus, Ttl},
    registry::{Registry, RegistryKind},
    store::{Placement, Slot, Store, Transition},
    FabrqError,
};

type Result<T> = std::result::Result<T, FabrqError>;

/// How long a started job may overrun its timeout before its started entry expires.
pub const DEFAULT_STARTED_GRACE: Duration = Duration::from_secs(60);

/// The failure reason recorded when a started job is forcibly requeued.
pub const REQUEUE_REASON: &str = "started job moved for requeuing";

pub(crate) fn validate_queue_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FabrqError::Configuration(
            "a non-empty queue name is required".to_owned(),
        ));
    }
    Ok(())
}

/// Whether a transition took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The job record was gone, or no longer in the expected status, so nothing was written.
    Vanished,
    /// The job was already where the transition would have put it.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Queue<S: Store> {
    name: String,
    store: S,
    started_grace: Duration,
}

impl<S: Store> Queue<S> {
    pub fn new(store: S, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_queue_name(&name)?;
        Ok(Self {
            name,
            store,
            started_grace: DEFAULT_STARTED_GRACE,
        })
    }

    pub fn with_started_grace(self, started_grace: Duration) -> Self {
        Self {
            started_grace,
            ..self
        }
    }

    /// Every queue that currently has a name in the store.
    pub async fn all(store: S) -> Result<Vec<Self>> {
        store
            .queues()
            .await?
            .into_iter()
            .map(|name| Self::new(store.clone(), name))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self, kind: RegistryKind) -> Registry<S> {
        Registry::new(self.store.clone(), self.name.clone(), kind)
    }

    /// Create a queued job and append it to the pending list.
    pub async fn enqueue(
        &self,
        payload: impl Into<String>,
        timeout: Option<Duration>,
        ttl: Ttl,
        result_ttl: Ttl,
        failure_ttl: Ttl,
    ) -> Result<JobId> {
        let mut job = Job::new(self.name.clone(), payload);
        job.timeout = timeout;
        job.ttl = ttl;
        job.result_ttl = result_ttl;
        job.failure_ttl = failure_ttl;

        self.store.register_queue(&self.name).await?;
        self.store
            .commit(Transition {
                job: &job,
                expires_at: None,
                leave: None,
                enter: Some(Placement::Pending { at_front: false }),
            })
            .await?;

        tracing::debug!(job_id = %job.id, queue = %self.name, "Enqueued job {}", job.id);
        Ok(job.id)
    }

    /// Claim the oldest pending job and mark it started.
    ///
    /// Ids whose record has vanished, jobs that waited longer than their `ttl`, and ids whose
    /// record is no longer queued are discarded and the next id is tried.
    pub async fn dequeue(&self) -> Result<Option<Job>> {
        loop {
            let now = Utc::now();
            let claim_expires_at = Ttl::from(self.started_grace).expires_at(now);
            let Some(job_id) = self
                .store
                .claim_pending(&self.name, claim_expires_at)
                .await?
            else {
                return Ok(None);
            };

            let Some(mut job) = self.store.fetch_job(&job_id).await? else {
                tracing::debug!(%job_id, queue = %self.name, "Skipping vanished job {job_id}");
                self.release_claim(&job_id).await?;
                continue;
            };

            if job.is_stale(now) {
                tracing::info!(
                    %job_id,
                    queue = %self.name,
                    "Dropping job {job_id} that outlived its ttl"
                );
                self.store.delete_job(&job_id).await?;
                self.release_claim(&job_id).await?;
                continue;
            }

            if !job.is_queued() {
                tracing::warn!(
                    %job_id,
                    status = %job.status,
                    queue = %self.name,
                    "Skipping job {job_id} found pending while {}",
                    job.status
                );
                if !job.is_started() {
                    self.release_claim(&job_id).await?;
                }
                continue;
            }

            job.mark_started(now);
            self.store
                .commit(Transition {
                    job: &job,
                    expires_at: None,
                    leave: Some(Slot::Registry(RegistryKind::Started)),
                    enter: Some(Placement::Registry {
                        kind: RegistryKind::Started,
                        expires_at: self.started_expires_at(&job, now),
                    }),
                })
                .await?;

            tracing::debug!(%job_id, queue = %self.name, "Dequeued job {job_id}");
            return Ok(Some(job));
        }
    }

    async fn release_claim(&self, job_id: &JobId) -> Result<()> {
        self.store
            .registry_remove(&self.name, RegistryKind::Started, job_id)
            .await?;
        Ok(())
    }

    fn started_expires_at(&self, job: &Job, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        job.timeout
            .and_then(|timeout| Ttl::from(timeout + self.started_grace).expires_at(now))
    }

    pub async fn fetch_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self.store.fetch_job(job_id).await?)
    }

    /// The pending job ids, oldest first.
    pub async fn job_ids(&self) -> Result<Vec<JobId>> {
        Ok(self.store.pending_ids(&self.name).await?)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.job_ids().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.count().await? == 0)
    }

    /// Remove the queue, its pending list and the records of its pending jobs.
    ///
    /// The started, finished and failed registries are left untouched; drain them first with
    /// [`crate::admin::Admin::delete_queue`]. Returns the ids of the deleted pending jobs.
    pub async fn delete(&self) -> Result<Vec<JobId>> {
        let job_ids = self.job_ids().await?;
        for job_id in &job_ids {
            self.store.delete_job(job_id).await?;
        }
        self.store.delete_pending(&self.name).await?;
        self.store.unregister_queue(&self.name).await?;

        tracing::debug!(queue = %self.name, deleted = job_ids.len(), "Deleted queue {}", self.name);
        Ok(job_ids)
    }

    /// Move a job back to the end of the pending list.
    ///
    /// A job that is already queued is left where it is and [`Outcome::Unchanged`] is returned.
    pub async fn requeue(&self, job_id: &JobId) -> Result<Outcome> {
        match self.store.fetch_job(job_id).await? {
            Some(job) => self.requeue_job(job).await,
            None => Ok(Outcome::Vanished),
        }
    }

    /// A started job first gets a failed entry recording why it left the started registry, so a
    /// forced requeue is visible in its failure history.
    pub(crate) async fn requeue_job(&self, mut job: Job) -> Result<Outcome> {
        let now = Utc::now();
        let leave = match job.status {
            JobStatus::Queued => return Ok(Outcome::Unchanged),
            JobStatus::Started => {
                job.mark_failed(now, JobError::new(ErrorType::Requeued, REQUEUE_REASON));
                let expires_at = job.record_expires_at(now);
                self.store
                    .commit(Transition {
                        job: &job,
                        expires_at,
                        leave: Some(Slot::Registry(RegistryKind::Started)),
                        enter: Some(Placement::Registry {
                            kind: RegistryKind::Failed,
                            expires_at,
                        }),
                    })
                    .await?;
                RegistryKind::Failed
            }
            JobStatus::Finished => RegistryKind::Finished,
            JobStatus::Failed => RegistryKind::Failed,
        };

        job.mark_requeued();
        self.store
            .commit(Transition {
                job: &job,
                expires_at: None,
                leave: Some(Slot::Registry(leave)),
                enter: Some(Placement::Pending { at_front: false }),
            })
            .await?;

        tracing::debug!(
            job_id = %job.id,
            queue = %self.name,
            from = %leave,
            "Requeued job {}",
            job.id
        );
        Ok(Outcome::Applied)
    }

    /// Record a successful execution.
    ///
    /// Returns [`Outcome::Vanished`] if the job was deleted or moved while it was executing.
    pub async fn finish_job(&self, job_id: &JobId, result: String) -> Result<Outcome> {
        let Some(mut job) = self.fetch_started(job_id).await? else {
            return Ok(Outcome::Vanished);
        };
        let now = Utc::now();
        job.mark_finished(now, result);
        self.complete(&job, RegistryKind::Finished, now).await?;
        Ok(Outcome::Applied)
    }

    /// Record a failed execution.
    ///
    /// Returns [`Outcome::Vanished`] if the job was deleted or moved while it was executing.
    pub async fn fail_job(&self, job_id: &JobId, error: JobError) -> Result<Outcome> {
        let Some(mut job) = self.fetch_started(job_id).await? else {
            return Ok(Outcome::Vanished);
        };
        let now = Utc::now();
        job.mark_failed(now, error);
        self.complete(&job, RegistryKind::Failed, now).await?;
        Ok(Outcome::Applied)
    }

    async fn fetch_started(&self, job_id: &JobId) -> Result<Option<Job>> {
        let job = self
            .store
            .fetch_job(job_id)
            .await?
            .filter(Job::is_started);
        if job.is_none() {
            tracing::debug!(
                %job_id,
                queue = %self.name,
                "Dropping outcome of vanished job {job_id}"
            );
        }
        Ok(job)
    }

    async fn complete(&self, job: &Job, kind: RegistryKind, now: DateTime<Utc>) -> Result<()> {
        let expires_at = job.record_expires_at(now);
        // Zero retention: the record is discarded instead of entering the registry.
        let enter = match expires_at {
            Some(expires_at) if expires_at <= now => None,
            _ => Some(Placement::Registry { kind, expires_at }),
        };
        self.store
            .commit(Transition {
                job,
                expires_at,
                leave: Some(Slot::Registry(RegistryKind::Started)),
                enter,
            })
            .await?;
        if enter.is_none() {
            self.store.delete_job(&job.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;
    use crate::store::{memory::InMemoryStore, test::SequentialStore};

    fn queue(store: InMemoryStore) -> Queue<InMemoryStore> {
        Queue::new(store, "q1").unwrap()
    }

    async fn enqueue(queue: &Queue<impl Store>, payload: &str) -> JobId {
        queue
            .enqueue(
                payload,
                None,
                Ttl::Unbounded,
                Ttl::Unbounded,
                Ttl::Unbounded,
            )
            .await
            .unwrap()
    }

    async fn members(queue: &Queue<impl Store>, kind: RegistryKind) -> Vec<JobId> {
        queue.registry(kind).list_ids().await.unwrap()
    }

    #[test]
    fn queue_name_is_required() {
        assert_matches!(
            Queue::new(InMemoryStore::new(), ""),
            Err(FabrqError::Configuration(_))
        );
        assert_matches!(
            Queue::new(InMemoryStore::new(), "  "),
            Err(FabrqError::Configuration(_))
        );
    }

    #[tokio::test]
    async fn enqueue_dequeue_finish() {
        let queue = queue(InMemoryStore::new());
        let job_id = enqueue(&queue, "echo hi").await;
        assert_eq!(queue.job_ids().await.unwrap(), vec![job_id]);

        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(job.payload, "echo hi");
        assert!(job.is_started());
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(members(&queue, RegistryKind::Started).await, vec![job_id]);

        let outcome = queue.finish_job(&job_id, "hi\n".to_owned()).await.unwrap();

        assert_eq!(outcome, Outcome::Applied);
        assert!(members(&queue, RegistryKind::Started).await.is_empty());
        assert_eq!(members(&queue, RegistryKind::Finished).await, vec![job_id]);
        assert!(queue.is_empty().await.unwrap());
        let job = queue.fetch_job(&job_id).await.unwrap().unwrap();
        assert!(job.is_finished());
        assert_eq!(job.result.as_deref(), Some("hi\n"));
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let queue = queue(InMemoryStore::new());
        let first = enqueue(&queue, "echo 1").await;
        let second = enqueue(&queue, "echo 2").await;

        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, first);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, second);
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_dequeues_return_each_job_once() {
        let queue = queue(InMemoryStore::new());
        let mut expected = HashSet::new();
        for n in 0..16 {
            expected.insert(enqueue(&queue, &format!("echo {n}")).await);
        }

        let dequeued = futures::future::join_all((0..16).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await.unwrap() })
        }))
        .await
        .into_iter()
        .map(|job| job.unwrap().unwrap().id)
        .collect::<Vec<_>>();

        assert_eq!(dequeued.len(), 16);
        assert_eq!(dequeued.into_iter().collect::<HashSet<_>>(), expected);
    }

    #[tokio::test]
    async fn dequeue_sets_started_expiry_from_timeout() {
        let store = InMemoryStore::new();
        let queue = queue(store.clone()).with_started_grace(Duration::from_secs(5));
        let job_id = queue
            .enqueue(
                "sleep 1",
                Some(Duration::from_secs(10)),
                Ttl::Unbounded,
                Ttl::Unbounded,
                Ttl::Unbounded,
            )
            .await
            .unwrap();

        queue.dequeue().await.unwrap().unwrap();

        let now = Utc::now();
        assert_eq!(
            store
                .registry_ids("q1", RegistryKind::Started, now + TimeDelta::seconds(14))
                .await
                .unwrap(),
            vec![job_id]
        );
        assert_eq!(
            store
                .registry_expired_ids("q1", RegistryKind::Started, now + TimeDelta::seconds(16))
                .await
                .unwrap(),
            vec![job_id]
        );
    }

    #[tokio::test]
    async fn dequeue_drops_stale_jobs() {
        let store = InMemoryStore::new();
        let queue = queue(store.clone());
        let stale = queue
            .enqueue("echo late", None, Ttl::Seconds(0), Ttl::Unbounded, Ttl::Unbounded)
            .await
            .unwrap();
        let fresh = enqueue(&queue, "echo on time").await;

        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, fresh);
        assert_eq!(queue.fetch_job(&stale).await.unwrap(), None);
        assert_eq!(members(&queue, RegistryKind::Started).await, vec![fresh]);
    }

    #[tokio::test]
    async fn dequeue_skips_vanished_jobs() {
        let store = InMemoryStore::new();
        let queue = queue(store.clone());
        let vanished = enqueue(&queue, "echo gone").await;
        let job_id = enqueue(&queue, "echo here").await;
        store.delete_job(&vanished).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, job_id);
        assert_eq!(members(&queue, RegistryKind::Started).await, vec![job_id]);
    }

    #[tokio::test]
    async fn finish_after_delete_is_silent() {
        let store = InMemoryStore::new();
        let queue = queue(store.clone());
        let job_id = enqueue(&queue, "sleep 1").await;
        queue.dequeue().await.unwrap().unwrap();

        store.delete_job(&job_id).await.unwrap();
        store
            .registry_remove("q1", RegistryKind::Started, &job_id)
            .await
            .unwrap();

        assert_eq!(
            queue.finish_job(&job_id, String::new()).await.unwrap(),
            Outcome::Vanished
        );
        assert_eq!(queue.fetch_job(&job_id).await.unwrap(), None);
        assert!(members(&queue, RegistryKind::Finished).await.is_empty());
    }

    #[tokio::test]
    async fn fail_records_reason() {
        let queue = queue(InMemoryStore::new());
        let job_id = enqueue(&queue, "false").await;
        queue.dequeue().await.unwrap().unwrap();

        let outcome = queue
            .fail_job(&job_id, JobError::new(ErrorType::Exit(Some(1)), "exit status 1"))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Applied);
        assert!(members(&queue, RegistryKind::Started).await.is_empty());
        assert_eq!(members(&queue, RegistryKind::Failed).await, vec![job_id]);
        let job = queue.fetch_job(&job_id).await.unwrap().unwrap();
        assert!(job.is_failed());
        assert_eq!(job.exc_info.as_deref(), Some("exit status 1"));
    }

    #[tokio::test]
    async fn zero_result_ttl_discards_record() {
        let queue = queue(InMemoryStore::new());
        let job_id = queue
            .enqueue("true", None, Ttl::Unbounded, Ttl::Seconds(0), Ttl::Unbounded)
            .await
            .unwrap();
        queue.dequeue().await.unwrap().unwrap();

        queue.finish_job(&job_id, String::new()).await.unwrap();

        assert_eq!(queue.fetch_job(&job_id).await.unwrap(), None);
        assert!(members(&queue, RegistryKind::Started).await.is_empty());
        assert!(members(&queue, RegistryKind::Finished).await.is_empty());
    }

    #[tokio::test]
    async fn requeue_failed_job() {
        let queue = queue(InMemoryStore::new());
        let job_id = enqueue(&queue, "false").await;
        queue.dequeue().await.unwrap().unwrap();
        queue
            .fail_job(&job_id, JobError::new(ErrorType::Timeout, "timed out"))
            .await
            .unwrap();

        assert_eq!(queue.requeue(&job_id).await.unwrap(), Outcome::Applied);

        assert!(members(&queue, RegistryKind::Failed).await.is_empty());
        assert_eq!(queue.job_ids().await.unwrap(), vec![job_id]);
        let job = queue.fetch_job(&job_id).await.unwrap().unwrap();
        assert!(job.is_queued());
        assert_eq!(job.started_at, None);
        assert_eq!(job.errors.len(), 1);
    }

    #[tokio::test]
    async fn requeue_started_job_records_failure() {
        let queue = Queue::new(SequentialStore::default(), "q1").unwrap();
        let job_id = enqueue(&queue, "sleep 100").await;
        queue.dequeue().await.unwrap().unwrap();

        assert_eq!(queue.requeue(&job_id).await.unwrap(), Outcome::Applied);

        assert!(members(&queue, RegistryKind::Started).await.is_empty());
        assert!(members(&queue, RegistryKind::Failed).await.is_empty());
        assert_eq!(queue.job_ids().await.unwrap(), vec![job_id]);
        let job = queue.fetch_job(&job_id).await.unwrap().unwrap();
        assert!(job.is_queued());
        assert_eq!(job.exc_info.as_deref(), Some(REQUEUE_REASON));
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].error_type, ErrorType::Requeued);
    }

    #[tokio::test]
    async fn requeue_queued_job_is_unchanged() {
        let queue = queue(InMemoryStore::new());
        let first = enqueue(&queue, "echo 1").await;
        let second = enqueue(&queue, "echo 2").await;

        assert_eq!(queue.requeue(&first).await.unwrap(), Outcome::Unchanged);

        assert_eq!(queue.job_ids().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn unconfirmed_claim_is_dequeued_again_after_sweep() {
        let store = InMemoryStore::new();
        let queue = queue(store.clone());
        let job_id = enqueue(&queue, "echo hi").await;
        // The worker claimed the job and died before marking it started.
        let claimed_at = Utc::now();
        store.claim_pending("q1", Some(claimed_at)).await.unwrap().unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), None);

        queue
            .registry(RegistryKind::Started)
            .sweep(claimed_at + TimeDelta::seconds(1))
            .await
            .unwrap();

        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert!(job.is_started());
        assert_eq!(members(&queue, RegistryKind::Started).await, vec![job_id]);
    }

    #[tokio::test]
    async fn requeue_vanished_job() {
        let queue = queue(InMemoryStore::new());
        assert_eq!(
            queue.requeue(&JobId::new()).await.unwrap(),
            Outcome::Vanished
        );
    }

    #[tokio::test]
    async fn delete_removes_pending_jobs() {
        let store = InMemoryStore::new();
        let queue = queue(store.clone());
        let job_id = enqueue(&queue, "echo hi").await;
        assert_eq!(store.queues().await.unwrap(), vec!["q1".to_owned()]);

        assert_eq!(queue.delete().await.unwrap(), vec![job_id]);

        assert!(queue.is_empty().await.unwrap());
        assert_eq!(queue.fetch_job(&job_id).await.unwrap(), None);
        assert!(Queue::all(store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store() {
        let store = InMemoryStore::new();
        let queue = queue(store.clone());
        store.set_offline(true);

        assert_matches!(
            queue.enqueue("true", None, Ttl::Unbounded, Ttl::Unbounded, Ttl::Unbounded).await,
            Err(FabrqError::StoreUnavailable(_))
        );
        assert_matches!(queue.dequeue().await, Err(FabrqError::StoreUnavailable(_)));
    }
}
