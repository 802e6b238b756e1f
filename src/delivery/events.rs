//! Frames pushed to connected clients.

use serde::{Deserialize, Serialize};

use crate::queue::{ChatResult, ClientId, JobId, QueueStats};

/// Server → client frame, serialized as `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "session")]
    Session(SessionInfo),
    #[serde(rename = "chat:waiting")]
    Waiting(WaitingNotice),
    #[serde(rename = "chat:response")]
    Response(ChatResult),
    #[serde(rename = "chat:error")]
    Error(ChatFailure),
    #[serde(rename = "queue:stats")]
    Stats(QueueStats),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Waiting(_) => "chat:waiting",
            Self::Response(_) => "chat:response",
            Self::Error(_) => "chat:error",
            Self::Stats(_) => "queue:stats",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub client_id: ClientId,
}

/// Queue position of a freshly waiting job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingNotice {
    pub job_id: JobId,
    /// 1-based.
    pub position: usize,
    /// waiting + delayed + active.
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFailure {
    pub job_id: JobId,
    pub error: String,
}

/// Client → server frame. Only the stats request is understood.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event")]
pub enum ClientRequest {
    #[serde(rename = "queue:stats")]
    Stats,
}
