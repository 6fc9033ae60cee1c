//! # cowrite Protocol
//!
//! Wire messages exchanged between replicas and the session authority.
//!
//! ## Messages
//!
//! - `Join` / `SiteId`: session start and site assignment
//! - `Operation`: one identifier-addressed insert or delete
//! - `DocRequest` / `DocSync`: snapshot bootstrap of a joining replica
//! - `Joined` / `Users`: presence notices
//!
//! ## Framing
//!
//! One JSON object per line over any tokio byte stream.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod wire;

pub use messages::{Message, MessageError};
pub use wire::{MessageReader, MessageWriter, WireError};
