//! A minimal distributed job queue on top of a shared key-value store.
//!
//! Producers enqueue shell commands onto named [`queue::Queue`]s. Workers claim them, execute
//! them through a [`executor::CommandExecutor`], and record the outcome by moving the job id
//! between the started, finished and failed [`registry::Registry`]s. [`admin::Admin`] provides
//! bulk deletion and requeuing by queue and state.
//!
//! All state lives behind a [`store::Store`]; [`store::memory::InMemoryStore`] ships with this
//! crate and `fabrq-redis` provides a Redis backed store.
//!
//! ```
//! # use fabrq::prelude::*;
//! # use fabrq::store::memory::InMemoryStore;
//! # use tokio_util::sync::CancellationToken;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), FabrqError> {
//! let store = InMemoryStore::new();
//! let queue = Queue::new(store.clone(), "q1")?;
//! let job_id = Job::builder("echo hi").enqueue(&queue).await?;
//!
//! let summary = Worker::new("w1", store, ShellExecutor)
//!     .listen_on(queue.name())
//!     .with_config(WorkerConfig::default().burst())
//!     .run(CancellationToken::new())
//!     .await?;
//! assert_eq!(summary.finished, 1);
//! assert!(queue.fetch_job(&job_id).await?.unwrap().is_finished());
//! # Ok(())
//! # }
//! ```
use thiserror::Error;

pub mod admin;
pub mod executor;
pub mod job;
pub mod launcher;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod store;
pub mod worker;

use store::StoreError;

#[derive(Debug, Error)]
pub enum FabrqError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Error communicating with the store")]
    StoreUnavailable(#[from] StoreError),
    #[error("Failed to launch worker: {0}")]
    Launch(String),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}
