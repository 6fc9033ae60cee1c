//! # cowrite Core
//!
//! Synchronisation core of the cowrite collaborative text editor.
//!
//! This crate provides:
//! - Dense, totally ordered position identifiers with site tiebreaking
//! - Character nodes with tombstone deletion
//! - A sequence CRDT document with index-based local edits and
//!   identifier-based remote merge
//! - Site id allocation for the session authority
//! - A CBOR snapshot codec for persistence and replica bootstrap

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod document;
pub mod ident;
pub mod node;
pub mod site;

pub use codec::CodecError;
pub use document::{Document, DocumentError, OperationRecord};
pub use ident::{between, IdentError, Identifier, Position};
pub use node::{CharNode, Dot};
pub use site::{SiteAssignment, SiteError, SiteId, SiteRegistry, SENTINEL_SITE};
