//! Delivery: addressing and fan-out of server frames to connected clients.

pub mod broadcaster;
pub mod events;
pub mod router;

pub use broadcaster::EventBroadcaster;
pub use events::{ChatFailure, ClientRequest, ServerEvent, SessionInfo, WaitingNotice};
pub use router::ClientRouter;
