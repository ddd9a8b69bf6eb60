//! HTTP route handlers.

pub mod exports;
pub mod health;
