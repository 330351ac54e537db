//! The purpose of this module is to alleviate the need to import many of the `[fabrq]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use fabrq::prelude::*;
//! ```
pub use crate::admin::{Admin, BatchReport, QueueCounts};
pub use crate::executor::{CommandExecutor, ExecutionError, ExecutionOutput, ShellExecutor};
pub use crate::job::{Job, JobId, JobStatus, Ttl};
pub use crate::launcher::{launch_workers, stop_workers, InProcessLauncher, Launcher};
pub use crate::queue::{Outcome, Queue};
pub use crate::registry::{Registry, RegistryKind};
pub use crate::store::{Store, StoreError};
pub use crate::worker::{Worker, WorkerConfig, WorkerHandle, WorkerSummary};
pub use crate::FabrqError;
