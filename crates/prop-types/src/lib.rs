//! Core types and traits for the property estimation orchestrator.
//!
//! DTOs are shared verbatim between the HTTP server, the client and the batch runner so the
//! JSON on the wire and on disk has a single definition.

mod dto;
mod hashing;
mod lifecycle;
mod traits;

pub use dto::*;
pub use hashing::{hash_str, hash_value, to_canonical_json};
pub use lifecycle::*;
pub use traits::*;
