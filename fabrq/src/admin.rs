//! Bulk deletion and requeuing of jobs by queue and state.
//!
//! Every operation is best effort over its batch. Registry membership can change between
//! listing and acting, so each job is re-fetched and its status re-checked against the registry
//! it was found in. Jobs that moved on are skipped; ids whose record has vanished have their
//! stale membership removed and are skipped too. Only store failures abort a batch.
use chrono::Utc;

use crate::{
    job::{Job, JobId, Ttl},
    queue::{validate_queue_name, Queue},
    registry::{Registry, RegistryKind},
    store::Store,
    FabrqError,
};

type Result<T> = std::result::Result<T, FabrqError>;

/// Which ids a batch operation acted upon and which it skipped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub acted_on: Vec<JobId>,
    pub skipped: Vec<JobId>,
}

impl BatchReport {
    fn merge(mut self, other: BatchReport) -> Self {
        for job_id in other.acted_on {
            self.act_on(job_id);
        }
        self.skipped.extend(other.skipped);
        self
    }

    fn act_on(&mut self, job_id: JobId) {
        if !self.acted_on.contains(&job_id) {
            self.acted_on.push(job_id);
        }
    }
}

/// The number of jobs of a queue in each state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub started: usize,
    pub finished: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Admin<S: Store> {
    store: S,
}

enum Recheck {
    Matches(Job),
    Moved,
    Vanished,
}

impl<S: Store> Admin<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn queue(&self, queue_name: &str) -> Result<Queue<S>> {
        Queue::new(self.store.clone(), queue_name)
    }

    async fn recheck(&self, registry: &Registry<S>, job_id: &JobId) -> Result<Recheck> {
        match self.store.fetch_job(job_id).await? {
            Some(job) if job.status == registry.kind().status() => Ok(Recheck::Matches(job)),
            Some(job) => {
                tracing::debug!(
                    %job_id,
                    status = %job.status,
                    registry = %registry.kind(),
                    "Skipping job {job_id} that is no longer {}",
                    registry.kind()
                );
                Ok(Recheck::Moved)
            }
            None => {
                tracing::debug!(
                    %job_id,
                    registry = %registry.kind(),
                    "Removing vanished job {job_id}"
                );
                registry.remove(job_id).await?;
                Ok(Recheck::Vanished)
            }
        }
    }

    /// Enqueue a command with no timeout and unbounded retention.
    pub async fn enqueue(&self, queue_name: &str, command: &str) -> Result<JobId> {
        self.queue(queue_name)?
            .enqueue(
                command,
                None,
                Ttl::Unbounded,
                Ttl::Unbounded,
                Ttl::Unbounded,
            )
            .await
    }

    /// Delete every job of the queue that is in the given registry.
    ///
    /// Expired members are swept first so nothing lingers physically.
    pub async fn delete_by_state(
        &self,
        queue_name: &str,
        kind: RegistryKind,
    ) -> Result<BatchReport> {
        validate_queue_name(queue_name)?;
        let registry = Registry::new(self.store.clone(), queue_name, kind);
        registry.sweep(Utc::now()).await?;

        let mut report = BatchReport::default();
        for job_id in registry.list_ids().await? {
            match self.recheck(&registry, &job_id).await? {
                Recheck::Matches(_) => {
                    self.store.delete_job(&job_id).await?;
                    registry.remove(&job_id).await?;
                    report.acted_on.push(job_id);
                }
                Recheck::Moved | Recheck::Vanished => report.skipped.push(job_id),
            }
        }

        tracing::info!(
            queue = queue_name,
            registry = %kind,
            deleted = ?report.acted_on,
            skipped = ?report.skipped,
            "Deleted {} {kind} jobs",
            report.acted_on.len()
        );
        Ok(report)
    }

    pub async fn delete_started(&self, queue_name: &str) -> Result<BatchReport> {
        self.delete_by_state(queue_name, RegistryKind::Started).await
    }

    pub async fn delete_finished(&self, queue_name: &str) -> Result<BatchReport> {
        self.delete_by_state(queue_name, RegistryKind::Finished).await
    }

    pub async fn delete_failed(&self, queue_name: &str) -> Result<BatchReport> {
        self.delete_by_state(queue_name, RegistryKind::Failed).await
    }

    /// Drain the started, finished and failed registries, then delete the queue itself.
    ///
    /// The registries go first so no worker can be left holding a valid job id of a queue whose
    /// name is already gone. Entries the state passes had to skip, such as the leftover of an
    /// interrupted transition or an unconfirmed claim, are purged together with their records,
    /// so every registry of the queue ends up empty.
    pub async fn delete_queue(&self, queue_name: &str) -> Result<BatchReport> {
        let queue = self.queue(queue_name)?;

        let mut report = BatchReport::default();
        for kind in RegistryKind::ALL {
            report = report.merge(self.delete_by_state(queue_name, kind).await?);
        }
        for kind in RegistryKind::ALL {
            for job_id in self.purge_registry(queue_name, kind).await? {
                report.act_on(job_id);
            }
        }
        for job_id in queue.delete().await? {
            report.act_on(job_id);
        }
        let BatchReport { acted_on, skipped } = &mut report;
        skipped.retain(|job_id| !acted_on.contains(job_id));

        tracing::info!(
            queue = queue_name,
            deleted = report.acted_on.len(),
            "Deleted queue {queue_name}"
        );
        Ok(report)
    }

    /// Remove every remaining member of a registry, live or expired, and its job record.
    async fn purge_registry(&self, queue_name: &str, kind: RegistryKind) -> Result<Vec<JobId>> {
        let now = Utc::now();
        let mut job_ids = self.store.registry_ids(queue_name, kind, now).await?;
        job_ids.extend(self.store.registry_expired_ids(queue_name, kind, now).await?);

        for job_id in &job_ids {
            tracing::debug!(%job_id, registry = %kind, "Purging leftover entry of job {job_id}");
            self.store.delete_job(job_id).await?;
            self.store.registry_remove(queue_name, kind, job_id).await?;
        }
        Ok(job_ids)
    }

    /// Move every job of the queue that is in the given registry back to pending.
    ///
    /// Jobs taken from the started registry are first recorded as failed with
    /// [`crate::queue::REQUEUE_REASON`].
    pub async fn requeue_by_state(
        &self,
        queue_name: &str,
        kind: RegistryKind,
    ) -> Result<BatchReport> {
        let queue = self.queue(queue_name)?;
        let registry = queue.registry(kind);
        registry.sweep(Utc::now()).await?;

        let mut report = BatchReport::default();
        for job_id in registry.list_ids().await? {
            match self.recheck(&registry, &job_id).await? {
                Recheck::Matches(job) => {
                    queue.requeue_job(job).await?;
                    report.act_on(job_id);
                }
                Recheck::Moved | Recheck::Vanished => report.skipped.push(job_id),
            }
        }

        tracing::info!(
            queue = queue_name,
            registry = %kind,
            requeued = ?report.acted_on,
            skipped = ?report.skipped,
            "Requeued {} {kind} jobs",
            report.acted_on.len()
        );
        Ok(report)
    }

    pub async fn requeue_started(&self, queue_name: &str) -> Result<BatchReport> {
        self.requeue_by_state(queue_name, RegistryKind::Started).await
    }

    pub async fn requeue_failed(&self, queue_name: &str) -> Result<BatchReport> {
        self.requeue_by_state(queue_name, RegistryKind::Failed).await
    }

    pub async fn queues(&self) -> Result<Vec<String>> {
        Ok(self.store.queues().await?)
    }

    pub async fn counts(&self, queue_name: &str) -> Result<QueueCounts> {
        let queue = self.queue(queue_name)?;
        Ok(QueueCounts {
            pending: queue.count().await?,
            started: queue.registry(RegistryKind::Started).count().await?,
            finished: queue.registry(RegistryKind::Finished).count().await?,
            failed: queue.registry(RegistryKind::Failed).count().await?,
        })
    }
}
