use std::time::Duration;

use crate::{queue::Queue, store::Store, FabrqError};

use super::{Job, JobId, Ttl, DEFAULT_FAILURE_TTL, DEFAULT_RESULT_TTL, DEFAULT_TIMEOUT};

/// Builds and enqueues a [`Job`] with the common defaults.
///
/// Created via [`Job::builder`].
pub struct JobBuilder {
    payload: String,
    timeout: Option<Duration>,
    ttl: Ttl,
    result_ttl: Ttl,
    failure_ttl: Ttl,
}

impl Job {
    pub fn builder(payload: impl Into<String>) -> JobBuilder {
        JobBuilder {
            payload: payload.into(),
            timeout: Some(DEFAULT_TIMEOUT),
            ttl: Ttl::Unbounded,
            result_ttl: DEFAULT_RESULT_TTL,
            failure_ttl: DEFAULT_FAILURE_TTL,
        }
    }
}

impl JobBuilder {
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Let the job run for as long as it needs.
    pub fn without_timeout(self) -> Self {
        Self {
            timeout: None,
            ..self
        }
    }

    pub fn with_ttl(self, ttl: impl Into<Ttl>) -> Self {
        Self {
            ttl: ttl.into(),
            ..self
        }
    }

    pub fn with_result_ttl(self, result_ttl: impl Into<Ttl>) -> Self {
        Self {
            result_ttl: result_ttl.into(),
            ..self
        }
    }

    pub fn with_failure_ttl(self, failure_ttl: impl Into<Ttl>) -> Self {
        Self {
            failure_ttl: failure_ttl.into(),
            ..self
        }
    }

    pub async fn enqueue<S: Store>(self, queue: &Queue<S>) -> Result<JobId, FabrqError> {
        queue
            .enqueue(
                self.payload,
                self.timeout,
                self.ttl,
                self.result_ttl,
                self.failure_ttl,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    #[tokio::test]
    async fn enqueue_with_defaults() {
        let queue = Queue::new(InMemoryStore::new(), "q1").unwrap();

        let job_id = Job::builder("echo hi").enqueue(&queue).await.unwrap();

        let job = queue.fetch_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.payload, "echo hi");
        assert_eq!(job.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(job.ttl, Ttl::Unbounded);
        assert_eq!(job.result_ttl, DEFAULT_RESULT_TTL);
        assert_eq!(job.failure_ttl, DEFAULT_FAILURE_TTL);
    }

    #[tokio::test]
    async fn enqueue_with_overrides() {
        let queue = Queue::new(InMemoryStore::new(), "q1").unwrap();

        let job_id = Job::builder("sleep 1")
            .with_timeout(Duration::from_secs(5))
            .with_ttl(Duration::from_secs(60))
            .with_result_ttl(Ttl::Unbounded)
            .with_failure_ttl(-1_i64)
            .enqueue(&queue)
            .await
            .unwrap();

        let job = queue.fetch_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.timeout, Some(Duration::from_secs(5)));
        assert_eq!(job.ttl, Ttl::Seconds(60));
        assert_eq!(job.result_ttl, Ttl::Unbounded);
        assert_eq!(job.failure_ttl, Ttl::Unbounded);

        let job_id = Job::builder("sleep 1")
            .without_timeout()
            .enqueue(&queue)
            .await
            .unwrap();
        assert_eq!(queue.fetch_job(&job_id).await.unwrap().unwrap().timeout, None);
    }
}
