//! Domain layer for the JobTrack export engine.
//!
//! This crate contains:
//! - Domain models (ExportTask, FilterSpec, JobApplication)
//! - Store ports and in-memory adapters
//! - Domain error types

pub mod models;
pub mod services;
