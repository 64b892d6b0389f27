//! Thin request/poll façade over the estimation server's HTTP API.

mod client;
mod error;

pub use client::{ConnectionOptions, EstimationClient, RequestHandle};
pub use error::ClientError;
