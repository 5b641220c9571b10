//! Local durable storage for fieldsync
//!
//! A SQLite-backed small-object store holds the queue, status, feedback
//! cache, conflict log, and snapshot. Media bytes live in the filesystem
//! blob store (`crate::media`), not here.

mod connection;
mod migrations;
mod state;

pub use connection::Storage;
pub use migrations::{run_migrations, SCHEMA_VERSION};
pub use state::{
    read_json, write_json, SqliteStateStore, StateStore, WriteError, WriteOutcome,
};
