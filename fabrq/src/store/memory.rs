//! Provides an in memory implementation of [`Store`].
//!
//! Currently this is provided for testing purposes and not designed for use in a production system.
//!
//! It is not optimized instead is designed to be a correct implementation for use in a test setup.
//! All state lives behind a single lock, so [`Store::claim_pending`] and [`Store::commit`] are
//! applied atomically.
use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, RwLockWriteGuard,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;

use super::{Placement, Slot, Store, StoreError, Transition};
use crate::{
    job::{Job, JobId},
    registry::RegistryKind,
};

/// An in memory implementation of [`Store`].
///
/// It is provided as a correct (but not optimized) implementation primarily for use in testing
/// circumstances.
///
/// **This is not designed for use in a production systems.**
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    offline: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct State {
    jobs: FxHashMap<JobId, StoredJob>,
    pending: FxHashMap<String, VecDeque<JobId>>,
    registries: FxHashMap<(String, RegistryKind), FxHashMap<JobId, Option<DateTime<Utc>>>>,
    queues: BTreeSet<String>,
}

#[derive(Debug)]
struct StoredJob {
    job: Job,
    expires_at: Option<DateTime<Utc>>,
}

fn is_live(expires_at: &Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |expires_at| expires_at > now)
}

impl State {
    fn save_job(&mut self, job: &Job, expires_at: Option<DateTime<Utc>>) {
        self.jobs.insert(
            job.id,
            StoredJob {
                job: job.clone(),
                expires_at,
            },
        );
    }

    fn push_pending(&mut self, queue: &str, id: &JobId, at_front: bool) {
        let pending = self.pending.entry(queue.to_owned()).or_default();
        if at_front {
            pending.push_front(*id);
        } else {
            pending.push_back(*id);
        }
    }

    fn remove_pending(&mut self, queue: &str, id: &JobId) {
        if let Some(pending) = self.pending.get_mut(queue) {
            pending.retain(|pending_id| pending_id != id);
        }
    }

    fn registry_add(
        &mut self,
        queue: &str,
        kind: RegistryKind,
        id: &JobId,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.registries
            .entry((queue.to_owned(), kind))
            .or_default()
            .insert(*id, expires_at);
    }

    fn registry_remove(&mut self, queue: &str, kind: RegistryKind, id: &JobId) {
        if let Some(registry) = self.registries.get_mut(&(queue.to_owned(), kind)) {
            registry.remove(id);
        }
    }

    fn registry_ids(
        &self,
        queue: &str,
        kind: RegistryKind,
        predicate: impl Fn(&Option<DateTime<Utc>>) -> bool,
    ) -> Vec<JobId> {
        self.registries
            .get(&(queue.to_owned(), kind))
            .map(|registry| {
                registry
                    .iter()
                    .filter(|(_, expires_at)| predicate(expires_at))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl InMemoryStore {
    /// Creates a new instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the connection to the store.
    ///
    /// While offline every operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("in-memory store is offline".to_owned()))
        } else {
            Ok(())
        }
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T, StoreError> {
        self.check_online()?;
        let state = self.state.read().map_err(|_| StoreError::BadState)?;
        Ok(f(&state))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.check_online()?;
        self.state.write().map_err(|_| StoreError::BadState)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_job(
        &self,
        job: &Job,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.write()?.save_job(job, expires_at);
        Ok(())
    }
    async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        self.read(|state| {
            state
                .jobs
                .get(id)
                .filter(|stored| is_live(&stored.expires_at, now))
                .map(|stored| stored.job.clone())
        })
    }
    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError> {
        self.write()?.jobs.remove(id);
        Ok(())
    }
    async fn push_pending(
        &self,
        queue: &str,
        id: &JobId,
        at_front: bool,
    ) -> Result<(), StoreError> {
        self.write()?.push_pending(queue, id, at_front);
        Ok(())
    }
    async fn pop_pending(&self, queue: &str) -> Result<Option<JobId>, StoreError> {
        Ok(self
            .write()?
            .pending
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }
    async fn remove_pending(&self, queue: &str, id: &JobId) -> Result<(), StoreError> {
        self.write()?.remove_pending(queue, id);
        Ok(())
    }
    async fn pending_ids(&self, queue: &str) -> Result<Vec<JobId>, StoreError> {
        self.read(|state| {
            state
                .pending
                .get(queue)
                .map(|pending| pending.iter().copied().collect())
                .unwrap_or_default()
        })
    }
    async fn delete_pending(&self, queue: &str) -> Result<(), StoreError> {
        self.write()?.pending.remove(queue);
        Ok(())
    }
    async fn registry_add(
        &self,
        queue: &str,
        kind: RegistryKind,
        id: &JobId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.write()?.registry_add(queue, kind, id, expires_at);
        Ok(())
    }
    async fn registry_remove(
        &self,
        queue: &str,
        kind: RegistryKind,
        id: &JobId,
    ) -> Result<(), StoreError> {
        self.write()?.registry_remove(queue, kind, id);
        Ok(())
    }
    async fn registry_ids(
        &self,
        queue: &str,
        kind: RegistryKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        self.read(|state| state.registry_ids(queue, kind, |expires_at| is_live(expires_at, now)))
    }
    async fn registry_expired_ids(
        &self,
        queue: &str,
        kind: RegistryKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        self.read(|state| {
            state.registry_ids(queue, kind, |expires_at| !is_live(expires_at, now))
        })
    }
    async fn register_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.write()?.queues.insert(queue.to_owned());
        Ok(())
    }
    async fn unregister_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.write()?.queues.remove(queue);
        Ok(())
    }
    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        self.read(|state| state.queues.iter().cloned().collect())
    }
    async fn claim_pending(
        &self,
        queue: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<JobId>, StoreError> {
        let mut state = self.write()?;
        let id = state.pending.get_mut(queue).and_then(VecDeque::pop_front);
        if let Some(id) = id {
            state.registry_add(queue, RegistryKind::Started, &id, expires_at);
        }
        Ok(id)
    }
    async fn commit(&self, transition: Transition<'_>) -> Result<(), StoreError> {
        let Transition {
            job,
            expires_at,
            leave,
            enter,
        } = transition;
        let queue = job.origin.as_str();
        let mut state = self.write()?;

        match leave {
            Some(Slot::Pending) => state.remove_pending(queue, &job.id),
            Some(Slot::Registry(kind)) => state.registry_remove(queue, kind, &job.id),
            None => {}
        }
        state.save_job(job, expires_at);
        match enter {
            Some(Placement::Pending { at_front }) => state.push_pending(queue, &job.id, at_front),
            Some(Placement::Registry { kind, expires_at }) => {
                state.registry_add(queue, kind, &job.id, expires_at)
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    crate::store_test_suite!(for: InMemoryStore::new());

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let store = InMemoryStore::new();
        store.set_offline(true);

        assert_matches!(
            store.pop_pending("q1").await,
            Err(StoreError::Unavailable(_))
        );
        assert_matches!(
            store.fetch_job(&JobId::new()).await,
            Err(StoreError::Unavailable(_))
        );

        store.set_offline(false);
        assert_matches!(store.pop_pending("q1").await, Ok(None));
    }

    #[tokio::test]
    async fn poisoned_lock_is_bad_state() {
        let store = InMemoryStore::new();
        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.state.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            store.push_pending("q1", &JobId::new(), false).await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.queues().await, Err(StoreError::BadState));
    }
}
