//! Estimation server: accepts requests, schedules their work items on a calculation backend
//! with cache reuse and single-flight coalescing, and serves progress over HTTP.

mod coalesce;
mod config;
mod error;
mod http;
mod server;
mod tracker;

pub use config::ServerConfig;
pub use error::ServerError;
pub use http::{router, StatusQuery};
pub use server::{decompose, EstimationServer};
