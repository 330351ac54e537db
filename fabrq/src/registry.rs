//! Registries track which jobs of a queue are currently started, finished, or failed.
//!
//! Each member carries an expiry. Expired members are logically absent from
//! [`Registry::list_ids`] straight away and are physically removed by [`Registry::sweep`].
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    job::{ErrorType, Job, JobError, JobId, JobStatus, Ttl},
    store::{Placement, Slot, Store, Transition},
    FabrqError,
};

type Result<T> = std::result::Result<T, FabrqError>;

/// The failure reason recorded for a started job whose registry entry expired.
pub const ABANDONED_REASON: &str = "job abandoned: exceeded started registry expiry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Started,
    Finished,
    Failed,
}

impl RegistryKind {
    pub const ALL: [RegistryKind; 3] = [
        RegistryKind::Started,
        RegistryKind::Finished,
        RegistryKind::Failed,
    ];

    /// The job status that membership of this registry stands for.
    pub fn status(self) -> JobStatus {
        match self {
            RegistryKind::Started => JobStatus::Started,
            RegistryKind::Finished => JobStatus::Finished,
            RegistryKind::Failed => JobStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegistryKind::Started => "started",
            RegistryKind::Finished => "finished",
            RegistryKind::Failed => "failed",
        }
    }
}

impl Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of job ids of one queue that are in one [`RegistryKind`].
#[derive(Debug, Clone)]
pub struct Registry<S: Store> {
    queue_name: String,
    kind: RegistryKind,
    store: S,
}

impl<S: Store> Registry<S> {
    pub fn new(store: S, queue_name: impl Into<String>, kind: RegistryKind) -> Self {
        Self {
            queue_name: queue_name.into(),
            kind,
            store,
        }
    }

    pub fn started(store: S, queue_name: impl Into<String>) -> Self {
        Self::new(store, queue_name, RegistryKind::Started)
    }

    pub fn finished(store: S, queue_name: impl Into<String>) -> Self {
        Self::new(store, queue_name, RegistryKind::Finished)
    }

    pub fn failed(store: S, queue_name: impl Into<String>) -> Self {
        Self::new(store, queue_name, RegistryKind::Failed)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    /// The current, non-expired members.
    ///
    /// This reflects the store at call time only; members can be moved or deleted by other
    /// processes before the caller acts on them.
    pub async fn list_ids(&self) -> Result<Vec<JobId>> {
        Ok(self
            .store
            .registry_ids(&self.queue_name, self.kind, Utc::now())
            .await?)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.list_ids().await?.len())
    }

    pub async fn contains(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.list_ids().await?.contains(job_id))
    }

    pub async fn add(&self, job_id: &JobId, ttl: Ttl) -> Result<()> {
        self.store
            .registry_add(
                &self.queue_name,
                self.kind,
                job_id,
                ttl.expires_at(Utc::now()),
            )
            .await?;
        Ok(())
    }

    /// Remove a member. Removing an id that is not a member is a no-op.
    pub async fn remove(&self, job_id: &JobId) -> Result<()> {
        self.store
            .registry_remove(&self.queue_name, self.kind, job_id)
            .await?;
        Ok(())
    }

    /// Physically remove the members that expired at or before `now`.
    ///
    /// A started entry expires when its job overran its timeout and the grace period without the
    /// worker reporting back. If the job record still says started, the job is moved to the
    /// failed registry with [`ABANDONED_REASON`] instead of silently disappearing. If it still
    /// says queued, the worker died between claiming the job and starting it, and the job goes
    /// back to the front of the pending list.
    ///
    /// Returns the ids that were swept.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let expired = self
            .store
            .registry_expired_ids(&self.queue_name, self.kind, now)
            .await?;

        for job_id in &expired {
            match self.store.fetch_job(job_id).await? {
                Some(mut job) if self.kind == RegistryKind::Started && job.is_started() => {
                    tracing::warn!(
                        %job_id,
                        queue = %self.queue_name,
                        "Moving abandoned job {job_id} to the failed registry"
                    );
                    job.mark_failed(now, JobError::new(ErrorType::Abandoned, ABANDONED_REASON));
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
                }
                Some(job) if self.kind == RegistryKind::Started && job.is_queued() => {
                    self.release_unconfirmed_claim(&job).await?;
                }
                _ => self.remove(job_id).await?,
            }
        }

        if !expired.is_empty() {
            tracing::debug!(
                queue = %self.queue_name,
                registry = %self.kind,
                count = expired.len(),
                "Swept expired registry entries"
            );
        }
        Ok(expired)
    }

    async fn release_unconfirmed_claim(&self, job: &Job) -> Result<()> {
        let job_id = job.id;
        if self.store.pending_ids(&self.queue_name).await?.contains(&job_id) {
            return self.remove(&job_id).await;
        }

        tracing::warn!(
            %job_id,
            queue = %self.queue_name,
            "Returning unconfirmed claim of job {job_id} to the pending list"
        );
        self.store
            .commit(Transition {
                job,
                expires_at: None,
                leave: Some(Slot::Registry(RegistryKind::Started)),
                enter: Some(Placement::Pending { at_front: true }),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use super::*;
    use crate::store::memory::InMemoryStore;

    #[test]
    fn kind_maps_to_status() {
        assert_eq!(RegistryKind::Started.status(), JobStatus::Started);
        assert_eq!(RegistryKind::Finished.status(), JobStatus::Finished);
        assert_eq!(RegistryKind::Failed.status(), JobStatus::Failed);
        assert_eq!(RegistryKind::Failed.to_string(), "failed");
    }

    #[tokio::test]
    async fn add_list_remove() {
        let store = InMemoryStore::new();
        let registry = Registry::finished(store, "q1");
        let id = JobId::new();

        registry.add(&id, Ttl::Unbounded).await.unwrap();
        assert_eq!(registry.list_ids().await.unwrap(), vec![id]);
        assert!(registry.contains(&id).await.unwrap());

        registry.remove(&id).await.unwrap();
        assert_eq!(registry.count().await.unwrap(), 0);

        // Removing twice is not an error.
        registry.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn expired_entries_are_absent_before_sweeping() {
        let store = InMemoryStore::new();
        let registry = Registry::failed(store.clone(), "q1");
        let id = JobId::new();

        registry.add(&id, Ttl::Seconds(0)).await.unwrap();

        assert!(registry.list_ids().await.unwrap().is_empty());
        assert_eq!(
            store
                .registry_expired_ids("q1", RegistryKind::Failed, Utc::now())
                .await
                .unwrap(),
            vec![id]
        );

        assert_eq!(registry.sweep(Utc::now()).await.unwrap(), vec![id]);
        assert!(store
            .registry_expired_ids("q1", RegistryKind::Failed, Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn sweep_moves_abandoned_started_jobs_to_failed() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut job = Job::new("q1", "sleep 100");
        job.mark_started(now);
        store.save_job(&job, None).await.unwrap();
        store
            .registry_add("q1", RegistryKind::Started, &job.id, Some(now))
            .await
            .unwrap();

        let swept = Registry::started(store.clone(), "q1")
            .sweep(now + TimeDelta::seconds(1))
            .await
            .unwrap();

        assert_eq!(swept, vec![job.id]);
        let failed = Registry::failed(store.clone(), "q1");
        assert_eq!(failed.list_ids().await.unwrap(), vec![job.id]);
        let job = store.fetch_job(&job.id).await.unwrap().unwrap();
        assert!(job.is_failed());
        assert_eq!(job.exc_info.as_deref(), Some(ABANDONED_REASON));
        assert_eq!(job.errors[0].error_type, ErrorType::Abandoned);
    }

    #[tokio::test]
    async fn sweep_returns_unconfirmed_claims_to_pending() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let waiting = JobId::new();
        store.push_pending("q1", &waiting, false).await.unwrap();
        let job = Job::new("q1", "echo hi");
        store.save_job(&job, None).await.unwrap();
        // Claimed, but the worker never marked it started.
        store.push_pending("q1", &job.id, true).await.unwrap();
        store.claim_pending("q1", Some(now)).await.unwrap().unwrap();

        let swept = Registry::started(store.clone(), "q1")
            .sweep(now + TimeDelta::seconds(1))
            .await
            .unwrap();

        assert_eq!(swept, vec![job.id]);
        assert_eq!(store.pending_ids("q1").await.unwrap(), vec![job.id, waiting]);
        assert!(store
            .registry_expired_ids("q1", RegistryKind::Started, now + TimeDelta::seconds(1))
            .await
            .unwrap()
            .is_empty());
        assert!(store.fetch_job(&job.id).await.unwrap().unwrap().is_queued());
    }

    #[tokio::test]
    async fn sweep_drops_unconfirmed_claims_already_pending() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let job = Job::new("q1", "echo hi");
        store.save_job(&job, None).await.unwrap();
        store.push_pending("q1", &job.id, false).await.unwrap();
        store
            .registry_add("q1", RegistryKind::Started, &job.id, Some(now))
            .await
            .unwrap();

        Registry::started(store.clone(), "q1")
            .sweep(now + TimeDelta::seconds(1))
            .await
            .unwrap();

        assert_eq!(store.pending_ids("q1").await.unwrap(), vec![job.id]);
    }

    #[tokio::test]
    async fn sweep_drops_started_entries_of_jobs_that_moved_on() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut job = Job::new("q1", "true");
        job.mark_started(now);
        job.mark_finished(now, String::new());
        store.save_job(&job, None).await.unwrap();
        store
            .registry_add("q1", RegistryKind::Started, &job.id, Some(now))
            .await
            .unwrap();

        Registry::started(store.clone(), "q1")
            .sweep(now + TimeDelta::seconds(1))
            .await
            .unwrap();

        assert!(Registry::failed(store.clone(), "q1")
            .list_ids()
            .await
            .unwrap()
            .is_empty());
        assert!(store.fetch_job(&job.id).await.unwrap().unwrap().is_finished());
    }
}
