//! Starting and stopping workers.
//!
//! How a worker process is supervised is left to a [`Launcher`]. [`InProcessLauncher`] runs
//! each worker as a task on the current tokio runtime.
use async_trait::async_trait;
use chrono::Utc;

use crate::{
    executor::CommandExecutor,
    queue::validate_queue_name,
    store::Store,
    worker::{Worker, WorkerConfig, WorkerHandle},
    FabrqError,
};

type Result<T> = std::result::Result<T, FabrqError>;

#[async_trait]
pub trait Launcher: Send + Sync {
    type Handle: Send;

    /// Start a worker named `worker_name` that works on `queue_name`.
    async fn spawn_worker(&self, queue_name: &str, worker_name: &str) -> Result<Self::Handle>;

    /// Stop a worker once its current job is done.
    async fn stop_worker(&self, handle: Self::Handle) -> Result<()>;
}

/// Runs workers as tasks on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct InProcessLauncher<S: Store, E: CommandExecutor + Clone> {
    store: S,
    executor: E,
    config: WorkerConfig,
}

impl<S: Store, E: CommandExecutor + Clone> InProcessLauncher<S, E> {
    pub fn new(store: S, executor: E) -> Self {
        Self {
            store,
            executor,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }
}

#[async_trait]
impl<S: Store, E: CommandExecutor + Clone> Launcher for InProcessLauncher<S, E> {
    type Handle = WorkerHandle;

    async fn spawn_worker(&self, queue_name: &str, worker_name: &str) -> Result<WorkerHandle> {
        validate_queue_name(queue_name)?;
        tokio::runtime::Handle::try_current()
            .map_err(|error| FabrqError::Launch(error.to_string()))?;

        tracing::info!(queue = queue_name, worker = worker_name, "Launching worker {worker_name}");
        Ok(
            Worker::new(worker_name, self.store.clone(), self.executor.clone())
                .listen_on(queue_name)
                .with_config(self.config.clone())
                .spawn(),
        )
    }

    async fn stop_worker(&self, handle: WorkerHandle) -> Result<()> {
        let name = handle.name().to_owned();
        let summary = handle.graceful_shutdown().await?;
        tracing::info!(worker = %name, ?summary, "Stopped worker {name}");
        Ok(())
    }
}

/// The name of the `n`th worker of a batch launched at `timestamp`.
fn worker_name(n: usize, timestamp: i64) -> String {
    format!("fabrq_worker_{n}_{timestamp}")
}

/// Start `count` workers on `queue_name`.
///
/// If any of them fails to start, the ones already running are stopped again.
pub async fn launch_workers<L: Launcher>(
    launcher: &L,
    queue_name: &str,
    count: usize,
) -> Result<Vec<L::Handle>> {
    validate_queue_name(queue_name)?;
    let timestamp = Utc::now().timestamp();

    let mut handles = Vec::with_capacity(count);
    for n in 1..=count {
        match launcher
            .spawn_worker(queue_name, &worker_name(n, timestamp))
            .await
        {
            Ok(handle) => handles.push(handle),
            Err(error) => {
                tracing::error!(?error, queue = queue_name, "Failed to launch worker: {error}");
                if let Err(stop_error) = stop_workers(launcher, handles).await {
                    tracing::error!(?stop_error, "Failed to stop launched workers: {stop_error}");
                }
                return Err(error);
            }
        }
    }
    Ok(handles)
}

/// Stop every worker, waiting for each to finish its current job.
pub async fn stop_workers<L: Launcher>(launcher: &L, handles: Vec<L::Handle>) -> Result<()> {
    futures::future::join_all(
        handles
            .into_iter()
            .map(|handle| launcher.stop_worker(handle)),
    )
    .await
    .into_iter()
    .collect()
}
