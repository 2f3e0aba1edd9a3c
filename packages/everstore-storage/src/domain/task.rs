//! Durable embedding-queue task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal tasks are kept for diagnostics but never scheduled again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of background embedding work.
///
/// At most one non-terminal task exists per `entity_uuid`; the queue
/// enforces this on enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingTask {
    pub id: String,
    pub entity_uuid: String,
    pub entity_type: String,
    pub text: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl EmbeddingTask {
    pub fn new(
        entity_uuid: impl Into<String>,
        entity_type: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_uuid: entity_uuid.into(),
            entity_type: entity_type.into(),
            text: text.into(),
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
        }
    }

    pub fn mark_processing(&mut self) {
        self.status = TaskStatus::Processing;
        self.last_attempt_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.last_error = None;
    }

    /// Record a failed attempt; moves back to pending until the retry
    /// budget runs out, then to failed.
    pub fn mark_attempt_failed(&mut self, error: impl Into<String>, max_retries: u32) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.status = if self.retry_count >= max_retries {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };
    }
}
