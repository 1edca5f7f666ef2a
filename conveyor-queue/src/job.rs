//! Job definition, delivery options and state management.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Job identifier, assigned by the engine unless pinned with
/// [`JobOptions::job_id`].
pub type JobId = String;

/// Job data payload.
pub type JobData = serde_json::Value;

/// Highest accepted priority value. Larger values are clamped.
pub const MAX_PRIORITY: u32 = 1 << 20;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `delay * 2^(attempts_made - 1)`
    Exponential,
    /// Always `delay`
    Fixed,
}

/// Backoff descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Strategy
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    pub delay: u64,
}

impl Backoff {
    /// Fixed backoff.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
        }
    }

    /// Exponential backoff.
    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
        }
    }

    /// Delay in milliseconds before the retry that follows the
    /// `attempts_made`-th failed attempt.
    pub fn delay_for(&self, attempts_made: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let factor = 1u64
                    .checked_shl(attempts_made.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                self.delay.saturating_mul(factor)
            }
        }
    }
}

/// What to do with a finished job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeepJobs {
    /// `true` removes the record immediately, `false` keeps it.
    Remove(bool),
    /// Keep only the most recent N records.
    KeepLast(u64),
}

/// Delivery options for a job.
///
/// Every field is optional so that two option sets can be merged field by
/// field with [`JobOptions::merged_with`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Milliseconds to wait before the job becomes available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,

    /// Priority, 1 is the highest. Jobs without a priority run after
    /// prioritized ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    /// Total number of attempts, including the first one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Backoff between attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,

    /// Retention of completed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<KeepJobs>,

    /// Retention of failed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<KeepJobs>,

    /// Pin the job id instead of letting the engine assign one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl JobOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay in milliseconds.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the total number of attempts.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Set the backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Set the retention of completed jobs.
    pub fn with_remove_on_complete(mut self, keep: KeepJobs) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    /// Set the retention of failed jobs.
    pub fn with_remove_on_fail(mut self, keep: KeepJobs) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }

    /// Pin the job id.
    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Shallow merge: every field set in `overrides` wins, every field it
    /// leaves unset keeps the value from `self`.
    pub fn merged_with(&self, overrides: &JobOptions) -> JobOptions {
        JobOptions {
            delay: overrides.delay.or(self.delay),
            priority: overrides.priority.or(self.priority),
            attempts: overrides.attempts.or(self.attempts),
            backoff: overrides.backoff.or(self.backoff),
            remove_on_complete: overrides.remove_on_complete.or(self.remove_on_complete),
            remove_on_fail: overrides.remove_on_fail.or(self.remove_on_fail),
            job_id: overrides.job_id.clone().or_else(|| self.job_id.clone()),
        }
    }

    /// Total attempts allowed; at least one.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }

    /// Ordering rank within the waiting set; lower runs first.
    pub fn priority_rank(&self) -> u64 {
        match self.priority {
            Some(p) if p > 0 => u64::from(p.min(MAX_PRIORITY)),
            _ => u64::from(MAX_PRIORITY) + 1,
        }
    }
}

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be picked up
    Waiting,
    /// Waiting for its delay to elapse
    Delayed,
    /// Being processed by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Failed permanently (attempts exhausted)
    Failed,
}

/// A job to be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier
    pub id: JobId,

    /// Job name
    pub name: String,

    /// Queue name (without prefix)
    pub queue: String,

    /// Payload
    pub data: JobData,

    /// Effective delivery options
    pub options: JobOptions,

    /// Current state
    pub state: JobState,

    /// Attempts started so far
    pub attempts_made: u32,

    /// When the job was enqueued
    pub timestamp: DateTime<Utc>,

    /// When the latest attempt started
    pub processed_on: Option<DateTime<Utc>>,

    /// When the job completed or failed permanently
    pub finished_on: Option<DateTime<Utc>>,

    /// Value reported on completion
    pub return_value: Option<JobData>,

    /// Error of the latest failed attempt
    pub failed_reason: Option<String>,

    /// Engine-internal enqueue sequence; distinguishes a record from a
    /// later record that reuses the same pinned id.
    #[serde(default)]
    pub seq: u64,
}

impl Job {
    /// Create a job as the engine does on enqueue.
    pub fn new(
        id: impl Into<JobId>,
        queue: impl Into<String>,
        name: impl Into<String>,
        data: JobData,
        options: JobOptions,
    ) -> Self {
        let state = if options.delay.unwrap_or(0) > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Self {
            id: id.into(),
            name: name.into(),
            queue: queue.into(),
            data,
            options,
            state,
            attempts_made: 0,
            timestamp: Utc::now(),
            processed_on: None,
            finished_on: None,
            return_value: None,
            failed_reason: None,
            seq: 0,
        }
    }

    /// Set the engine sequence number.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// When the job becomes available for processing.
    pub fn ready_at(&self) -> DateTime<Utc> {
        let delay = self.options.delay.unwrap_or(0).min(i64::MAX as u64) as i64;
        self.timestamp
            .checked_add_signed(Duration::milliseconds(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether another attempt is allowed after the current one.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.options.max_attempts()
    }

    /// Backoff before the next attempt, in milliseconds.
    pub fn backoff_delay(&self) -> u64 {
        self.options
            .backoff
            .map(|backoff| backoff.delay_for(self.attempts_made))
            .unwrap_or(0)
    }

    /// Mark the job as picked up by a worker.
    pub fn start_processing(&mut self) {
        self.state = JobState::Active;
        self.processed_on = Some(Utc::now());
        self.attempts_made += 1;
    }

    /// Mark the job as completed.
    pub fn complete(&mut self, return_value: JobData) {
        self.state = JobState::Completed;
        self.return_value = Some(return_value);
        self.finished_on = Some(Utc::now());
    }

    /// Record a failed attempt.
    ///
    /// Returns the retry delay in milliseconds when another attempt is
    /// allowed, or `None` when the job failed permanently.
    pub fn fail(&mut self, reason: impl Into<String>) -> Option<u64> {
        self.failed_reason = Some(reason.into());

        if self.can_retry() {
            let delay = self.backoff_delay();
            self.state = if delay > 0 {
                JobState::Delayed
            } else {
                JobState::Waiting
            };
            Some(delay)
        } else {
            self.state = JobState::Failed;
            self.finished_on = Some(Utc::now());
            None
        }
    }
}
