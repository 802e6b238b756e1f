//! Job model and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::ChatAction;
use crate::error::ValidationError;

/// Identifier of a queued job.
pub type JobId = Uuid;

/// Ephemeral per-connection client identifier.
pub type ClientId = String;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for the worker, FIFO by enqueue order.
    Waiting,
    /// Scheduled; becomes waiting at `delay_until`.
    Delayed,
    /// Being executed by the worker.
    Active,
    /// Finished with an outcome (possibly aborted).
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Waiting, Active) | (Waiting, Delayed) | (Delayed, Waiting) |
            (Active, Completed) | (Active, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What the caller asked for. Stored verbatim on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub user_id: String,
    pub action: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl JobPayload {
    /// A plain chat request (action 1).
    pub fn chat(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            conversation_id: None,
            client_id: None,
            user_id: user_id.into(),
            action: 1,
            payload: None,
            expires_at: None,
        }
    }

    pub fn with_client(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Interpret `action` + `payload` as a typed action.
    pub fn chat_action(&self) -> Result<ChatAction, ValidationError> {
        ChatAction::from_parts(self.action, self.message.as_deref(), self.payload.as_ref())
    }

    /// True when `expires_at` lies strictly before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Why a job finished without calling upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Expired,
    ClientGone,
}

/// Result payload of a job that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResult {
    pub job_id: JobId,
    pub conversation_id: String,
    pub reply: String,
    pub docs: Vec<serde_json::Value>,
    pub user_message_id: String,
    pub assistant_message_id: String,
}

/// Marker value of a job that was short-circuited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortedJob {
    pub aborted: bool,
    pub reason: AbortReason,
}

/// Terminal value of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutcome {
    Delivered(ChatResult),
    Aborted(AbortedJob),
}

impl JobOutcome {
    pub fn aborted(reason: AbortReason) -> Self {
        Self::Aborted(AbortedJob {
            aborted: true,
            reason,
        })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// One queued unit of chat work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Enqueue sequence; FIFO order among waiting jobs.
    pub seq: u64,
    pub state: JobState,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Job {
    pub(crate) fn new(seq: u64, payload: JobPayload, delay_until: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            state: if delay_until.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            payload,
            created_at: Utc::now(),
            delay_until,
            started_at: None,
            finished_at: None,
            result: None,
            failure_reason: None,
        }
    }

    /// Move to `target`, stamping timestamps. Fails on an illegal edge.
    pub(crate) fn transition_to(&mut self, target: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, target
            ));
        }
        self.state = target;
        let now = Utc::now();
        match target {
            JobState::Active => self.started_at = Some(now),
            JobState::Waiting => self.delay_until = None,
            JobState::Completed | JobState::Failed => self.finished_at = Some(now),
            JobState::Delayed => {}
        }
        Ok(())
    }

    pub fn client_id(&self) -> Option<&str> {
        self.payload.client_id.as_deref()
    }

    /// Age of the job relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}
