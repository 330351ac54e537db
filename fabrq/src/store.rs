//! The storage seam.
//!
//! Everything the queue needs from the shared key-value store is expressed by [`Store`]: job
//! records, FIFO pending lists, expiring registries, and an index of queue names. Stores that
//! offer native atomicity should override [`Store::claim_pending`] and [`Store::commit`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    job::{Job, JobId},
    registry::RegistryKind,
};

pub mod memory;
pub mod testing;

#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Save the job record, replacing any previous version.
    ///
    /// A record with an `expires_at` in the past must be treated as absent.
    async fn save_job(&self, job: &Job, expires_at: Option<DateTime<Utc>>)
        -> Result<(), StoreError>;
    async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;
    /// Delete the job record. Deleting an absent record is not an error.
    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError>;

    async fn push_pending(&self, queue: &str, id: &JobId, at_front: bool)
        -> Result<(), StoreError>;
    /// Remove and return the head of the pending list.
    ///
    /// Must be a single atomic operation: two concurrent callers never receive the same id.
    async fn pop_pending(&self, queue: &str) -> Result<Option<JobId>, StoreError>;
    async fn remove_pending(&self, queue: &str, id: &JobId) -> Result<(), StoreError>;
    async fn pending_ids(&self, queue: &str) -> Result<Vec<JobId>, StoreError>;
    async fn delete_pending(&self, queue: &str) -> Result<(), StoreError>;

    async fn registry_add(
        &self,
        queue: &str,
        kind: RegistryKind,
        id: &JobId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn registry_remove(
        &self,
        queue: &str,
        kind: RegistryKind,
        id: &JobId,
    ) -> Result<(), StoreError>;
    /// Members whose expiry is strictly after `now`, or who never expire.
    async fn registry_ids(
        &self,
        queue: &str,
        kind: RegistryKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;
    /// Members whose expiry is at or before `now` but that have not been swept yet.
    async fn registry_expired_ids(
        &self,
        queue: &str,
        kind: RegistryKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;

    async fn register_queue(&self, queue: &str) -> Result<(), StoreError>;
    async fn unregister_queue(&self, queue: &str) -> Result<(), StoreError>;
    async fn queues(&self) -> Result<Vec<String>, StoreError>;

    /// Pop the head of the pending list and record it in the started registry.
    ///
    /// The started entry is provisional until the caller commits the started transition with the
    /// real expiry. If the caller dies first, the entry expires at `expires_at` and a sweep of the
    /// started registry puts the job back in line.
    async fn claim_pending(
        &self,
        queue: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<JobId>, StoreError> {
        let Some(id) = self.pop_pending(queue).await? else {
            return Ok(None);
        };
        self.registry_add(queue, RegistryKind::Started, &id, expires_at).await?;
        Ok(Some(id))
    }

    /// Apply a state transition.
    ///
    /// Without transactions the record is saved first, then the new placement is entered, and
    /// only then is the old placement left. A failure part way through leaves the job in two
    /// places rather than none; readers re-check the record status before acting.
    async fn commit(&self, transition: Transition<'_>) -> Result<(), StoreError> {
        let Transition {
            job,
            expires_at,
            leave,
            enter,
        } = transition;
        let queue = job.origin.as_str();

        self.save_job(job, expires_at).await?;
        match enter {
            Some(Placement::Pending { at_front }) => {
                self.push_pending(queue, &job.id, at_front).await?
            }
            Some(Placement::Registry { kind, expires_at }) => {
                self.registry_add(queue, kind, &job.id, expires_at).await?
            }
            None => {}
        }
        match leave {
            Some(slot) if Some(slot) == enter.map(Placement::slot) => {}
            Some(Slot::Pending) => self.remove_pending(queue, &job.id).await?,
            Some(Slot::Registry(kind)) => self.registry_remove(queue, kind, &job.id).await?,
            None => {}
        }
        Ok(())
    }
}

/// Where a job id lives within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Pending,
    Registry(RegistryKind),
}

/// A [`Slot`] together with how the id should be placed there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Pending {
        at_front: bool,
    },
    Registry {
        kind: RegistryKind,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl Placement {
    pub fn slot(self) -> Slot {
        match self {
            Placement::Pending { .. } => Slot::Pending,
            Placement::Registry { kind, .. } => Slot::Registry(kind),
        }
    }
}

/// A single lifecycle step of one job.
///
/// The job's queue is taken from [`Job::origin`].
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    /// The job record as it should be saved.
    pub job: &'a Job,
    /// When the saved record expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub leave: Option<Slot>,
    pub enter: Option<Placement>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Store in bad state")]
    BadState,
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::store::memory::InMemoryStore;

    /// A store that applies transitions with the sequential default implementation.
    ///
    /// Every registry insertion is recorded so tests can assert on entries that were only
    /// present for a moment.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct SequentialStore {
        pub(crate) inner: InMemoryStore,
        pub(crate) registry_adds: Arc<Mutex<Vec<(RegistryKind, JobId)>>>,
    }

    impl SequentialStore {
        pub(crate) fn registry_adds(&self, kind: RegistryKind) -> Vec<JobId> {
            self.registry_adds
                .lock()
                .unwrap()
                .iter()
                .filter(|(added_to, _)| *added_to == kind)
                .map(|(_, id)| *id)
                .collect()
        }
    }

    #[async_trait]
    impl Store for SequentialStore {
        async fn save_job(
            &self,
            job: &Job,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            self.inner.save_job(job, expires_at).await
        }
        async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
            self.inner.fetch_job(id).await
        }
        async fn delete_job(&self, id: &JobId) -> Result<(), StoreError> {
            self.inner.delete_job(id).await
        }
        async fn push_pending(
            &self,
            queue: &str,
            id: &JobId,
            at_front: bool,
        ) -> Result<(), StoreError> {
            self.inner.push_pending(queue, id, at_front).await
        }
        async fn pop_pending(&self, queue: &str) -> Result<Option<JobId>, StoreError> {
            self.inner.pop_pending(queue).await
        }
        async fn remove_pending(&self, queue: &str, id: &JobId) -> Result<(), StoreError> {
            self.inner.remove_pending(queue, id).await
        }
        async fn pending_ids(&self, queue: &str) -> Result<Vec<JobId>, StoreError> {
            self.inner.pending_ids(queue).await
        }
        async fn delete_pending(&self, queue: &str) -> Result<(), StoreError> {
            self.inner.delete_pending(queue).await
        }
        async fn registry_add(
            &self,
            queue: &str,
            kind: RegistryKind,
            id: &JobId,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            self.registry_adds.lock().unwrap().push((kind, *id));
            self.inner.registry_add(queue, kind, id, expires_at).await
        }
        async fn registry_remove(
            &self,
            queue: &str,
            kind: RegistryKind,
            id: &JobId,
        ) -> Result<(), StoreError> {
            self.inner.registry_remove(queue, kind, id).await
        }
        async fn registry_ids(
            &self,
            queue: &str,
            kind: RegistryKind,
            now: DateTime<Utc>,
        ) -> Result<Vec<JobId>, StoreError> {
            self.inner.registry_ids(queue, kind, now).await
        }
        async fn registry_expired_ids(
            &self,
            queue: &str,
            kind: RegistryKind,
            now: DateTime<Utc>,
        ) -> Result<Vec<JobId>, StoreError> {
            self.inner.registry_expired_ids(queue, kind, now).await
        }
        async fn register_queue(&self, queue: &str) -> Result<(), StoreError> {
            self.inner.register_queue(queue).await
        }
        async fn unregister_queue(&self, queue: &str) -> Result<(), StoreError> {
            self.inner.unregister_queue(queue).await
        }
        async fn queues(&self) -> Result<Vec<String>, StoreError> {
            self.inner.queues().await
        }
    }

    crate::store_test_suite!(for: SequentialStore::default());

    #[test]
    fn placement_slot() {
        assert_eq!(Placement::Pending { at_front: true }.slot(), Slot::Pending);
        assert_eq!(
            Placement::Registry {
                kind: RegistryKind::Failed,
                expires_at: None
            }
            .slot(),
            Slot::Registry(RegistryKind::Failed)
        );
    }
}
