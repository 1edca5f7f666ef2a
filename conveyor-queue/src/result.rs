//! The result contract between processors and the engine.

use serde::{Deserialize, Serialize};

use crate::job::JobData;

/// Request to re-enqueue the job's work with a new delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToDelay {
    /// Delay in milliseconds for the new job
    pub delay: u64,

    /// Target queue; the job's own queue when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
}

/// What a processor reports for one job.
///
/// When `move_to_delay` is present the job is redirected regardless of
/// `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Whether the processor considers the job successful
    pub success: bool,

    /// Result payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JobData>,

    /// Error description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Redirection request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_to_delay: Option<MoveToDelay>,
}

impl JobResult {
    /// Successful result with a payload.
    pub fn ok(data: JobData) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            move_to_delay: None,
        }
    }

    /// Successful result without a payload.
    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            move_to_delay: None,
        }
    }

    /// Unsuccessful result. The job still completes; return an `Err` from
    /// the processor to make the engine retry it.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            move_to_delay: None,
        }
    }

    /// Attach a payload.
    pub fn with_data(mut self, data: JobData) -> Self {
        self.data = Some(data);
        self
    }

    /// Ask for the job to be re-enqueued on its own queue after `delay_ms`.
    pub fn move_to_delay(mut self, delay_ms: u64) -> Self {
        self.move_to_delay = Some(MoveToDelay {
            delay: delay_ms,
            queue_name: None,
        });
        self
    }

    /// Ask for the job to be re-enqueued on `queue` after `delay_ms`.
    pub fn move_to_queue(mut self, queue: impl Into<String>, delay_ms: u64) -> Self {
        self.move_to_delay = Some(MoveToDelay {
            delay: delay_ms,
            queue_name: Some(queue.into()),
        });
        self
    }
}

/// Payload of the result reported for a redirected job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirected {
    /// Always `true`
    pub moved_to_delay: bool,
    /// Queue the new job was enqueued on
    pub target_queue: String,
    /// Delay of the new job in milliseconds
    pub delay: u64,
    /// `data` of the processor's own result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_result: Option<JobData>,
}
