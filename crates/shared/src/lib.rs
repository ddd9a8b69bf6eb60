//! Shared utilities and common types for the JobTrack backend.
//!
//! This crate provides common functionality used across all other crates:
//! - Checksums for stored artifacts
//! - JWT access-token handling (owner identity)
//! - History cursor pagination
//! - Common validation logic

pub mod crypto;
pub mod jwt;
pub mod pagination;
pub mod validation;
