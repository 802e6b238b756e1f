//! Chat Relay: async chat job queue and delivery pipeline.

pub mod auth;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod queue;
pub mod reaper;
pub mod server;
pub mod service;
pub mod store;
pub mod upstream;
pub mod worker;
