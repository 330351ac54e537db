//! Test suite for ensuring a correct implementation of a store.
use std::collections::HashSet;

use chrono::{TimeDelta, Utc};

use super::*;

const QUEUE: &str = "conformance";

impl Job {
    pub(crate) fn mock_job() -> Self {
        Job::new(QUEUE, "echo hi")
    }
}

/// Create test suite for fabrq stores.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use fabrq::store_test_suite;
/// use fabrq::store::memory::InMemoryStore;
/// store_test_suite!(for: InMemoryStore::new());
/// ```
///
/// To pass additional attributes to every test, for example to ignore tests that need an
/// external server by default:
///
/// ```ignore
/// use fabrq::store_test_suite;
/// store_test_suite!(
///     attrs: [tokio::test, ignore = "requires a running redis server"],
///     store: RedisStore::connect(&config).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attrs: [tokio::test], store: $store);
    };
    (attrs: $attrs:tt, store: $store:expr) => {
        $crate::store_test_suite!(@test $attrs, save_and_fetch_job, $store);
        $crate::store_test_suite!(@test $attrs, fetch_expired_job_is_absent, $store);
        $crate::store_test_suite!(@test $attrs, delete_job_is_idempotent, $store);
        $crate::store_test_suite!(@test $attrs, pending_is_fifo, $store);
        $crate::store_test_suite!(@test $attrs, push_pending_at_front, $store);
        $crate::store_test_suite!(@test $attrs, pop_pending_from_empty_queue, $store);
        $crate::store_test_suite!(@test $attrs, concurrent_pops_are_exclusive, $store);
        $crate::store_test_suite!(@test $attrs, remove_and_delete_pending, $store);
        $crate::store_test_suite!(@test $attrs, registry_membership, $store);
        $crate::store_test_suite!(@test $attrs, registry_expiry, $store);
        $crate::store_test_suite!(@test $attrs, registries_are_scoped, $store);
        $crate::store_test_suite!(@test $attrs, queue_index, $store);
        $crate::store_test_suite!(@test $attrs, claim_pending, $store);
        $crate::store_test_suite!(@test $attrs, concurrent_claims_are_exclusive, $store);
        $crate::store_test_suite!(@test $attrs, commit_moves_between_slots, $store);
        $crate::store_test_suite!(@test $attrs, commit_within_same_slot, $store);
    };
    (@test [$($attr:meta),*], $name:ident, $store:expr) => {
        $(#[$attr])*
        async fn $name() {
            let store = $store;
            $crate::store::testing::$name(store).await;
        }
    };
}

pub use store_test_suite;

/// Gives each test run its own queue so suites can share a server.
fn queue_name() -> String {
    format!("{QUEUE}-{}", JobId::new())
}

fn job_in(queue: &str) -> Job {
    Job::new(queue, "echo hi")
}

#[doc(hidden)]
pub async fn save_and_fetch_job(store: impl Store) {
    let job = Job::mock_job();
    store.save_job(&job, None).await.unwrap();

    assert_eq!(store.fetch_job(&job.id).await.unwrap(), Some(job.clone()));
    assert_eq!(store.fetch_job(&JobId::new()).await.unwrap(), None);
    store.delete_job(&job.id).await.unwrap();
}

#[doc(hidden)]
pub async fn fetch_expired_job_is_absent(store: impl Store) {
    let job = Job::mock_job();
    store
        .save_job(&job, Some(Utc::now() - TimeDelta::seconds(1)))
        .await
        .unwrap();

    assert_eq!(store.fetch_job(&job.id).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn delete_job_is_idempotent(store: impl Store) {
    let job = Job::mock_job();
    store.save_job(&job, None).await.unwrap();

    store.delete_job(&job.id).await.unwrap();
    store.delete_job(&job.id).await.unwrap();

    assert_eq!(store.fetch_job(&job.id).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn pending_is_fifo(store: impl Store) {
    let queue = queue_name();
    let ids = [JobId::new(), JobId::new(), JobId::new()];
    for id in &ids {
        store.push_pending(&queue, id, false).await.unwrap();
    }

    assert_eq!(store.pending_ids(&queue).await.unwrap(), ids.to_vec());
    for id in &ids {
        assert_eq!(store.pop_pending(&queue).await.unwrap(), Some(*id));
    }
    assert_eq!(store.pop_pending(&queue).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn push_pending_at_front(store: impl Store) {
    let queue = queue_name();
    let (first, urgent) = (JobId::new(), JobId::new());
    store.push_pending(&queue, &first, false).await.unwrap();
    store.push_pending(&queue, &urgent, true).await.unwrap();

    assert_eq!(store.pop_pending(&queue).await.unwrap(), Some(urgent));
    assert_eq!(store.pop_pending(&queue).await.unwrap(), Some(first));
}

#[doc(hidden)]
pub async fn pop_pending_from_empty_queue(store: impl Store) {
    assert_eq!(store.pop_pending(&queue_name()).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn concurrent_pops_are_exclusive(store: impl Store) {
    let queue = queue_name();
    let ids: HashSet<JobId> = (0..20).map(|_| JobId::new()).collect();
    for id in &ids {
        store.push_pending(&queue, id, false).await.unwrap();
    }

    let popped = futures::future::join_all((0..ids.len()).map(|_| {
        let store = store.clone();
        let queue = queue.clone();
        tokio::spawn(async move { store.pop_pending(&queue).await.unwrap() })
    }))
    .await
    .into_iter()
    .map(|result| result.unwrap().unwrap())
    .collect::<Vec<_>>();

    assert_eq!(popped.len(), ids.len());
    assert_eq!(popped.into_iter().collect::<HashSet<_>>(), ids);
}

#[doc(hidden)]
pub async fn remove_and_delete_pending(store: impl Store) {
    let queue = queue_name();
    let (id1, id2) = (JobId::new(), JobId::new());
    store.push_pending(&queue, &id1, false).await.unwrap();
    store.push_pending(&queue, &id2, false).await.unwrap();

    store.remove_pending(&queue, &id1).await.unwrap();
    store.remove_pending(&queue, &JobId::new()).await.unwrap();
    assert_eq!(store.pending_ids(&queue).await.unwrap(), vec![id2]);

    store.delete_pending(&queue).await.unwrap();
    assert!(store.pending_ids(&queue).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn registry_membership(store: impl Store) {
    let queue = queue_name();
    let kind = RegistryKind::Finished;
    let (id1, id2) = (JobId::new(), JobId::new());
    store.registry_add(&queue, kind, &id1, None).await.unwrap();
    store
        .registry_add(&queue, kind, &id2, Some(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();

    let members: HashSet<_> = store
        .registry_ids(&queue, kind, Utc::now())
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(members, [id1, id2].into_iter().collect());

    store.registry_remove(&queue, kind, &id1).await.unwrap();
    store.registry_remove(&queue, kind, &id1).await.unwrap();
    assert_eq!(
        store.registry_ids(&queue, kind, Utc::now()).await.unwrap(),
        vec![id2]
    );
}

#[doc(hidden)]
pub async fn registry_expiry(store: impl Store) {
    let queue = queue_name();
    let kind = RegistryKind::Failed;
    let now = Utc::now();
    let (live, expired) = (JobId::new(), JobId::new());
    store
        .registry_add(&queue, kind, &live, Some(now + TimeDelta::hours(1)))
        .await
        .unwrap();
    store
        .registry_add(&queue, kind, &expired, Some(now - TimeDelta::seconds(1)))
        .await
        .unwrap();

    assert_eq!(
        store.registry_ids(&queue, kind, now).await.unwrap(),
        vec![live]
    );
    assert_eq!(
        store.registry_expired_ids(&queue, kind, now).await.unwrap(),
        vec![expired]
    );
}

#[doc(hidden)]
pub async fn registries_are_scoped(store: impl Store) {
    let (queue, other) = (queue_name(), queue_name());
    let id = JobId::new();
    store
        .registry_add(&queue, RegistryKind::Started, &id, None)
        .await
        .unwrap();

    let now = Utc::now();
    assert!(store
        .registry_ids(&queue, RegistryKind::Failed, now)
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .registry_ids(&other, RegistryKind::Started, now)
        .await
        .unwrap()
        .is_empty());
}

#[doc(hidden)]
pub async fn queue_index(store: impl Store) {
    let queue = queue_name();
    store.register_queue(&queue).await.unwrap();
    store.register_queue(&queue).await.unwrap();
    assert_eq!(
        store
            .queues()
            .await
            .unwrap()
            .into_iter()
            .filter(|name| *name == queue)
            .count(),
        1
    );

    store.unregister_queue(&queue).await.unwrap();
    assert!(!store.queues().await.unwrap().contains(&queue));
}

#[doc(hidden)]
pub async fn claim_pending(store: impl Store) {
    let queue = queue_name();
    let id = JobId::new();
    store.push_pending(&queue, &id, false).await.unwrap();

    let expires_at = Utc::now() + TimeDelta::seconds(60);

    assert_eq!(store.claim_pending(&queue, Some(expires_at)).await.unwrap(), Some(id));
    assert!(store.pending_ids(&queue).await.unwrap().is_empty());
    assert_eq!(
        store
            .registry_ids(&queue, RegistryKind::Started, Utc::now())
            .await
            .unwrap(),
        vec![id]
    );
    assert_eq!(store.claim_pending(&queue, Some(expires_at)).await.unwrap(), None);

    // An unconfirmed claim does not hold the job forever.
    let later = expires_at + TimeDelta::seconds(1);
    assert!(store
        .registry_ids(&queue, RegistryKind::Started, later)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store
            .registry_expired_ids(&queue, RegistryKind::Started, later)
            .await
            .unwrap(),
        vec![id]
    );
}

#[doc(hidden)]
pub async fn concurrent_claims_are_exclusive(store: impl Store) {
    let queue = queue_name();
    let ids: HashSet<JobId> = (0..20).map(|_| JobId::new()).collect();
    for id in &ids {
        store.push_pending(&queue, id, false).await.unwrap();
    }

    let claimed = futures::future::join_all((0..ids.len() + 5).map(|_| {
        let store = store.clone();
        let queue = queue.clone();
        tokio::spawn(async move { store.claim_pending(&queue, None).await.unwrap() })
    }))
    .await
    .into_iter()
    .filter_map(|result| result.unwrap())
    .collect::<Vec<_>>();

    assert_eq!(claimed.len(), ids.len());
    assert_eq!(claimed.into_iter().collect::<HashSet<_>>(), ids);
}

#[doc(hidden)]
pub async fn commit_moves_between_slots(store: impl Store) {
    let queue = queue_name();
    let mut job = job_in(&queue);
    store
        .commit(Transition {
            job: &job,
            expires_at: None,
            leave: None,
            enter: Some(Placement::Pending { at_front: false }),
        })
        .await
        .unwrap();
    assert_eq!(store.pending_ids(&queue).await.unwrap(), vec![job.id]);

    job.mark_started(Utc::now());
    store
        .commit(Transition {
            job: &job,
            expires_at: None,
            leave: Some(Slot::Pending),
            enter: Some(Placement::Registry {
                kind: RegistryKind::Started,
                expires_at: None,
            }),
        })
        .await
        .unwrap();

    let now = Utc::now();
    assert!(store.pending_ids(&queue).await.unwrap().is_empty());
    assert_eq!(
        store
            .registry_ids(&queue, RegistryKind::Started, now)
            .await
            .unwrap(),
        vec![job.id]
    );
    assert!(store
        .fetch_job(&job.id)
        .await
        .unwrap()
        .unwrap()
        .is_started());

    job.mark_finished(Utc::now(), "hi\n".to_owned());
    store
        .commit(Transition {
            job: &job,
            expires_at: None,
            leave: Some(Slot::Registry(RegistryKind::Started)),
            enter: Some(Placement::Registry {
                kind: RegistryKind::Finished,
                expires_at: None,
            }),
        })
        .await
        .unwrap();

    let now = Utc::now();
    assert!(store
        .registry_ids(&queue, RegistryKind::Started, now)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store
            .registry_ids(&queue, RegistryKind::Finished, now)
            .await
            .unwrap(),
        vec![job.id]
    );
    let saved = store.fetch_job(&job.id).await.unwrap().unwrap();
    assert!(saved.is_finished());
    assert_eq!(saved.result.as_deref(), Some("hi\n"));
}

#[doc(hidden)]
pub async fn commit_within_same_slot(store: impl Store) {
    let queue = queue_name();
    let job = job_in(&queue);
    store
        .registry_add(&queue, RegistryKind::Started, &job.id, None)
        .await
        .unwrap();

    let expires_at = Utc::now() - TimeDelta::seconds(1);
    store
        .commit(Transition {
            job: &job,
            expires_at: None,
            leave: Some(Slot::Registry(RegistryKind::Started)),
            enter: Some(Placement::Registry {
                kind: RegistryKind::Started,
                expires_at: Some(expires_at),
            }),
        })
        .await
        .unwrap();

    let now = Utc::now();
    assert!(store
        .registry_ids(&queue, RegistryKind::Started, now)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store
            .registry_expired_ids(&queue, RegistryKind::Started, now)
            .await
            .unwrap(),
        vec![job.id]
    );
}
