//! # cowrite Client
//!
//! One replica of a collaborative cowrite session.
//!
//! ## Architecture
//!
//! The client runs four concurrent tasks:
//! 1. **Input**: parses editing commands from stdin
//! 2. **Receiver**: forwards messages from the session authority
//! 3. **Flusher**: writes queued operation records in batches
//! 4. **Redraw**: prints the document and status after every change
//!
//! A single [`Session`] loop owns the document and applies every edit,
//! journaling each record to `SQLite` so a restarted client resumes where
//! it stopped.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod input;
pub mod persistence;
pub mod replication;
pub mod runtime;
pub mod view;

pub use config::ClientConfig;
pub use input::{input_loop, Command, CommandError};
pub use persistence::{SqliteStore, StoreError};
pub use replication::{connect, Inbound, Link, ReplicationError};
pub use runtime::Session;
pub use view::{redraw_loop, Status, View};
