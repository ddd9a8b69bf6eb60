//! JobTrack export API.
//!
//! HTTP surface, configuration and background jobs around the export
//! engine in [`services::export`].

pub mod app;
pub mod config;
pub mod error;
pub mod extractors;
pub mod jobs;
pub mod middleware;
pub mod routes;
pub mod services;
