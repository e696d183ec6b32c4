//! Shared types for webterm.
//!
//! This crate holds the transport-agnostic pieces: the broker error
//! taxonomy and the wire types exchanged with clients. The broker itself
//! and the HTTP surface live in the `webterm` binary crate.
//!
//! # Modules
//!
//! - [`error`]: broker error taxonomy with stable, kind-tagged messages
//! - [`protocol`]: terminal ids and HTTP response payloads

pub mod error;
pub mod protocol;
