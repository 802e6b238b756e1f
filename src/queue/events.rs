//! Queue lifecycle events and aggregate counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::job::{ClientId, JobId};

/// Lifecycle event published by the job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Carries the job's place in line as of the transition.
    Waiting {
        job_id: JobId,
        client_id: Option<ClientId>,
        /// 1-based position among waiting jobs.
        position: usize,
        /// waiting + delayed + active.
        length: usize,
    },
    Active {
        job_id: JobId,
    },
    Completed {
        job_id: JobId,
    },
    Failed {
        job_id: JobId,
        client_id: Option<ClientId>,
        reason: String,
    },
    /// A job was found active with no live worker (process restart).
    Stalled {
        job_id: JobId,
    },
    Delayed {
        job_id: JobId,
        delay: Duration,
    },
    /// A job finished and nothing is waiting.
    Drained,
}

impl QueueEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting { .. } => "waiting",
            Self::Active { .. } => "active",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stalled { .. } => "stalled",
            Self::Delayed { .. } => "delayed",
            Self::Drained => "drained",
        }
    }
}

/// Aggregate queue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    /// waiting + delayed + active.
    pub length: usize,
}

impl QueueStats {
    pub fn new(waiting: usize, delayed: usize, active: usize) -> Self {
        Self {
            waiting,
            delayed,
            active,
            length: waiting + delayed + active,
        }
    }
}
