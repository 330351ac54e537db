//! Workers pull jobs from their queues, execute them and record the outcome.
//!
//! Execution errors never escape the worker: they become a failed transition with the reason
//! recorded on the job. Store errors abort the worker.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    executor::CommandExecutor,
    job::{Job, JobError, JobId},
    queue::{Outcome, Queue, DEFAULT_STARTED_GRACE},
    registry::RegistryKind,
    store::Store,
    FabrqError,
};

type Result<T> = std::result::Result<T, FabrqError>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait before polling again once every queue is empty.
    pub poll_interval: Duration,
    /// Stop as soon as every queue is empty instead of polling.
    pub burst: bool,
    /// How long a started job may overrun its timeout before it counts as abandoned.
    pub started_grace: Duration,
    /// How often expired registry entries are swept.
    pub maintenance_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            burst: false,
            started_grace: DEFAULT_STARTED_GRACE,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn burst(self) -> Self {
        Self {
            burst: true,
            ..self
        }
    }

    pub fn with_started_grace(self, started_grace: Duration) -> Self {
        Self {
            started_grace,
            ..self
        }
    }

    pub fn with_maintenance_interval(self, maintenance_interval: Duration) -> Self {
        Self {
            maintenance_interval,
            ..self
        }
    }
}

/// What became of one executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished(JobId),
    Failed(JobId),
    /// The job was deleted or moved while executing, so its result was dropped.
    Dropped(JobId),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub finished: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl WorkerSummary {
    pub fn processed(&self) -> usize {
        self.finished + self.failed + self.dropped
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Finished(_) => self.finished += 1,
            JobOutcome::Failed(_) => self.failed += 1,
            JobOutcome::Dropped(_) => self.dropped += 1,
        }
    }
}

pub struct Worker<S: Store, E: CommandExecutor> {
    name: String,
    store: S,
    executor: Arc<E>,
    queue_names: Vec<String>,
    config: WorkerConfig,
}

impl<S: Store, E: CommandExecutor> Worker<S, E> {
    pub fn new(name: impl Into<String>, store: S, executor: E) -> Self {
        Self {
            name: name.into(),
            store,
            executor: Arc::new(executor),
            queue_names: vec![],
            config: WorkerConfig::default(),
        }
    }

    /// Add a queue to work on. Queues are tried in the order they were added.
    pub fn listen_on(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_names.push(queue_name.into());
        self
    }

    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn queues(&self) -> Result<Vec<Queue<S>>> {
        if self.queue_names.is_empty() {
            return Err(FabrqError::Configuration(format!(
                "worker {} is not listening on any queue",
                self.name
            )));
        }
        self.queue_names
            .iter()
            .map(|name| {
                Queue::new(self.store.clone(), name.as_str())
                    .map(|queue| queue.with_started_grace(self.config.started_grace))
            })
            .collect()
    }

    /// Execute the next job of the first queue that has one.
    ///
    /// Returns [`None`] when every queue is empty.
    pub async fn work_once(&self) -> Result<Option<JobOutcome>> {
        for queue in self.queues()? {
            if let Some(job) = queue.dequeue().await? {
                return self.perform(&queue, job).await.map(Some);
            }
        }
        Ok(None)
    }

    #[instrument(skip_all, fields(worker = %self.name, queue = %queue.name(), job_id = %job.id))]
    async fn perform(&self, queue: &Queue<S>, job: Job) -> Result<JobOutcome> {
        let job_id = job.id;
        tracing::debug!(%job_id, "Executing job {job_id}");

        let outcome = match self.executor.execute(&job.payload, job.timeout).await {
            Ok(output) => match queue.finish_job(&job_id, output.output).await? {
                Outcome::Applied => JobOutcome::Finished(job_id),
                Outcome::Vanished | Outcome::Unchanged => JobOutcome::Dropped(job_id),
            },
            Err(error) => {
                tracing::warn!(%job_id, ?error, "Job {job_id} failed: {error}");
                match queue.fail_job(&job_id, JobError::from(&error)).await? {
                    Outcome::Applied => JobOutcome::Failed(job_id),
                    Outcome::Vanished | Outcome::Unchanged => JobOutcome::Dropped(job_id),
                }
            }
        };

        tracing::debug!(%job_id, ?outcome, "Completed job {job_id}");
        Ok(outcome)
    }

    /// Sweep the expired entries of every registry of every queue.
    pub async fn clean_registries(&self) -> Result<()> {
        let now = Utc::now();
        for queue in self.queues()? {
            for kind in RegistryKind::ALL {
                queue.registry(kind).sweep(now).await?;
            }
        }
        Ok(())
    }

    /// Work until cancelled, or until every queue is empty in burst mode.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<WorkerSummary> {
        self.queues()?;
        tracing::info!(worker = %self.name, queues = ?self.queue_names, "Worker started");

        let mut summary = WorkerSummary::default();
        let mut next_maintenance = Instant::now();
        while !cancellation_token.is_cancelled() {
            if Instant::now() >= next_maintenance {
                self.clean_registries().await?;
                next_maintenance = Instant::now() + self.config.maintenance_interval;
            }

            match self.work_once().await? {
                Some(outcome) => summary.record(outcome),
                None if self.config.burst => break,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancellation_token.cancelled() => {}
                    }
                }
            }
        }

        tracing::info!(worker = %self.name, ?summary, "Worker stopped");
        Ok(summary)
    }

    /// Run the worker on a background task.
    pub fn spawn(self) -> WorkerHandle {
        let cancellation_token = CancellationToken::new();
        let name = self.name.clone();
        let handle = tokio::spawn({
            let cancellation_token = cancellation_token.clone();
            async move { self.run(cancellation_token).await }
        });
        WorkerHandle {
            name,
            cancellation_token,
            handle: Some(handle),
        }
    }
}

/// A worker running on a background task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    cancellation_token: CancellationToken,
    handle: Option<JoinHandle<Result<WorkerSummary>>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Let the job in flight complete, then stop the worker.
    pub async fn graceful_shutdown(mut self) -> Result<WorkerSummary> {
        tracing::debug!(worker = %self.name, "Shutting down worker");
        self.cancellation_token.cancel();
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|_| FabrqError::GracefulShutdownFailed)?,
            None => Ok(WorkerSummary::default()),
        }
    }
}
