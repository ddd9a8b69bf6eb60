//! Persistence layer for the JobTrack export engine.
//!
//! This crate contains:
//! - Database connection management
//! - Entity definitions (database row mappings)
//! - Postgres implementations of the export store ports

pub mod db;
pub mod entities;
pub mod metrics;
pub mod repositories;
