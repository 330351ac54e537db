//! The job record and its lifecycle status.
//!
//! A [`Job`] is a shell command plus the timing policy that governs how long it may wait, run,
//! and be retained. The record is owned by the [`crate::store::Store`]; queues and registries only
//! ever hold its [`JobId`].
use std::{fmt::Display, str::FromStr, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod builder;

/// The default maximum execution time of a job built with [`Job::builder`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);
/// The default retention of a finished job built with [`Job::builder`].
pub const DEFAULT_RESULT_TTL: Ttl = Ttl::Seconds(500);
/// The default retention of a failed job built with [`Job::builder`].
pub const DEFAULT_FAILURE_TTL: Ttl = Ttl::Seconds(365 * 24 * 60 * 60);

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A time-to-live.
///
/// Serialized as a number of seconds where `-1` means [`Ttl::Unbounded`], the same convention
/// producers use on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Ttl {
    #[default]
    Unbounded,
    Seconds(u64),
}

impl Ttl {
    /// The instant at which something started at `from` expires, or [`None`] if it never does.
    pub fn expires_at(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Ttl::Unbounded => None,
            Ttl::Seconds(seconds) => {
                let seconds = i64::try_from(*seconds).unwrap_or(i64::MAX);
                TimeDelta::try_seconds(seconds).and_then(|delta| from.checked_add_signed(delta))
            }
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Ttl::Unbounded)
    }
}

impl From<i64> for Ttl {
    fn from(value: i64) -> Self {
        match u64::try_from(value) {
            Ok(seconds) => Ttl::Seconds(seconds),
            Err(_) => Ttl::Unbounded,
        }
    }
}

impl From<Ttl> for i64 {
    fn from(value: Ttl) -> Self {
        match value {
            Ttl::Unbounded => -1,
            Ttl::Seconds(seconds) => i64::try_from(seconds).unwrap_or(i64::MAX),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(value: Duration) -> Self {
        Ttl::Seconds(value.as_secs())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        };
        f.write_str(status)
    }
}

/// One unit of enqueued work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// The name of the queue the job was enqueued to.
    pub origin: String,
    /// The shell command to execute.
    pub payload: String,
    /// Maximum execution time, [`None`] for unbounded.
    pub timeout: Option<Duration>,
    /// How long the job may wait in the queue before it is dropped.
    pub ttl: Ttl,
    pub result_ttl: Ttl,
    pub failure_ttl: Ttl,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Combined output of the last successful execution.
    pub result: Option<String>,
    /// The reason for the most recent failure.
    pub exc_info: Option<String>,
    pub errors: Vec<JobError>,
}

impl Job {
    pub(crate) fn new(origin: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            origin: origin.into(),
            payload: payload.into(),
            timeout: None,
            ttl: Ttl::Unbounded,
            result_ttl: Ttl::Unbounded,
            failure_ttl: Ttl::Unbounded,
            status: JobStatus::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            result: None,
            exc_info: None,
            errors: vec![],
        }
    }

    pub fn is_queued(&self) -> bool {
        self.status == JobStatus::Queued
    }

    pub fn is_started(&self) -> bool {
        self.status == JobStatus::Started
    }

    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.status == JobStatus::Failed
    }

    /// Whether the job has waited in its queue for longer than its [`Job::ttl`].
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.ttl
            .expires_at(self.enqueued_at)
            .is_some_and(|expires_at| expires_at <= now)
    }

    /// When the job record should stop being retained in its current status.
    pub(crate) fn record_expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.status {
            JobStatus::Queued | JobStatus::Started => None,
            JobStatus::Finished => self.result_ttl.expires_at(now),
            JobStatus::Failed => self.failure_ttl.expires_at(now),
        }
    }

    pub(crate) fn mark_started(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Started;
        self.started_at = Some(now);
        self.ended_at = None;
    }

    pub(crate) fn mark_finished(&mut self, now: DateTime<Utc>, result: String) {
        self.status = JobStatus::Finished;
        self.ended_at = Some(now);
        self.result = Some(result);
    }

    pub(crate) fn mark_failed(&mut self, now: DateTime<Utc>, error: JobError) {
        self.status = JobStatus::Failed;
        self.ended_at = Some(now);
        self.exc_info = Some(error.details.clone());
        self.errors.push(error);
    }

    /// Put the job back in line for a fresh run.
    ///
    /// The original `enqueued_at` is kept so `ttl` still counts from the first enqueue; the run
    /// timestamps are cleared because they belong to the previous run.
    pub(crate) fn mark_requeued(&mut self) {
        self.status = JobStatus::Queued;
        self.started_at = None;
        self.ended_at = None;
        self.result = None;
    }
}

/// A record of a single failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub error_type: ErrorType,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

impl JobError {
    pub fn new(error_type: ErrorType, details: impl Into<String>) -> Self {
        Self {
            error_type,
            details: details.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Classification of the reasons a job can end up failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The command exited with a non-zero status.
    Exit(Option<i32>),
    /// The command did not complete within [`Job::timeout`].
    Timeout,
    /// The command could not be started.
    Spawn,
    /// An administrator moved the job out of the started registry to requeue it.
    Requeued,
    /// The job outlived its started-registry entry without reporting an outcome.
    Abandoned,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ttl_serializes_unbounded_as_minus_one() {
        assert_eq!(serde_json::to_string(&Ttl::Unbounded).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Ttl::Seconds(30)).unwrap(), "30");
        assert_eq!(serde_json::from_str::<Ttl>("-1").unwrap(), Ttl::Unbounded);
        assert_eq!(serde_json::from_str::<Ttl>("-20").unwrap(), Ttl::Unbounded);
        assert_eq!(serde_json::from_str::<Ttl>("7").unwrap(), Ttl::Seconds(7));
    }

    #[test]
    fn ttl_expires_at() {
        let now = Utc::now();
        assert_eq!(Ttl::Unbounded.expires_at(now), None);
        assert_eq!(
            Ttl::Seconds(10).expires_at(now),
            Some(now + TimeDelta::seconds(10))
        );
        assert_eq!(Ttl::Seconds(u64::MAX).expires_at(now), None);
    }

    #[test]
    fn job_is_stale() {
        let mut job = Job::new("q1", "echo hi");
        let now = job.enqueued_at;
        assert!(!job.is_stale(now + TimeDelta::days(365)));

        job.ttl = Ttl::Seconds(5);
        assert!(!job.is_stale(now + TimeDelta::seconds(4)));
        assert!(job.is_stale(now + TimeDelta::seconds(5)));
    }

    #[test]
    fn job_lifecycle_timestamps() {
        let mut job = Job::new("q1", "echo hi");
        assert!(job.is_queued());

        let started = job.enqueued_at + TimeDelta::seconds(1);
        job.mark_started(started);
        assert!(job.is_started());
        assert_eq!(job.started_at, Some(started));

        let ended = started + TimeDelta::seconds(1);
        job.mark_finished(ended, "hi\n".to_owned());
        assert!(job.is_finished());
        assert_eq!(job.ended_at, Some(ended));
        assert_eq!(job.result.as_deref(), Some("hi\n"));
        assert!(job.started_at <= job.ended_at);
    }

    #[test]
    fn record_retention_follows_status() {
        let now = Utc::now();
        let mut job = Job::new("q1", "true");
        job.result_ttl = Ttl::Seconds(1);
        job.failure_ttl = Ttl::Seconds(2);

        assert_eq!(job.record_expires_at(now), None);
        job.mark_started(now);
        assert_eq!(job.record_expires_at(now), None);

        let mut finished = job.clone();
        finished.mark_finished(now, String::new());
        assert_eq!(
            finished.record_expires_at(now),
            Some(now + TimeDelta::seconds(1))
        );

        job.mark_failed(now, JobError::new(ErrorType::Timeout, "too slow"));
        assert_eq!(job.record_expires_at(now), Some(now + TimeDelta::seconds(2)));
        assert_eq!(job.exc_info.as_deref(), Some("too slow"));
        assert_eq!(job.errors.len(), 1);
    }

    #[test]
    fn requeue_clears_run_timestamps() {
        let now = Utc::now();
        let mut job = Job::new("q1", "false");
        let enqueued_at = job.enqueued_at;
        job.mark_started(now);
        job.mark_failed(now, JobError::new(ErrorType::Exit(Some(1)), "exit 1"));

        job.mark_requeued();

        assert!(job.is_queued());
        assert_eq!(job.enqueued_at, enqueued_at);
        assert_eq!(job.started_at, None);
        assert_eq!(job.ended_at, None);
        assert_eq!(job.errors.len(), 1);
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
