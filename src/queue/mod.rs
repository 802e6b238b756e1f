//! Job queue: durable multi-state job list with lifecycle events.
//!
//! - `job`: Job model and state machine (waiting → active → completed/failed)
//! - `action`: typed chat actions derived from the numeric action code
//! - `events`: lifecycle events and aggregate stats
//! - `store`: the queue itself plus the journal seam

pub mod action;
pub mod events;
pub mod job;
pub mod store;

pub use action::{ChatAction, DerivedInput};
pub use events::{QueueEvent, QueueStats};
pub use job::{
    AbortReason, AbortedJob, ChatResult, ClientId, Job, JobId, JobOutcome, JobPayload, JobState,
};
pub use store::{JobJournal, JobQueue};
