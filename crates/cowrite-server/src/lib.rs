//! # cowrite Server
//!
//! The session authority. It assigns every connecting replica a fresh site
//! id, relays operation records between replicas, and brokers snapshots
//! for replicas that join an ongoing session.
//!
//! ## Architecture
//!
//! - One task per connection reads messages and forwards them as events
//! - One writer task per connection drains that peer's outbox
//! - A single hub task owns the peer table and routes every message

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod hub;
pub mod server;

pub use config::ServerConfig;
pub use hub::{Hub, HubEvent};
pub use server::serve;
