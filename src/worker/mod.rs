//! Worker: serialized execution of chat jobs.
//!
//! - `worker`: the single-concurrency loop and per-job steps
//! - `history`: upstream history and conversation titles

pub mod history;
pub mod worker;

pub use worker::{ChatWorker, WorkerDeps};
