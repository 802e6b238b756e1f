//! Persistence layer: libSQL-backed chat store and queue journal.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{ChatStore, Conversation, NewMessage, Role, StoredMessage};
