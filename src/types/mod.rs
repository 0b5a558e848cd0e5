//! Shared type definitions
//!
//! Parameter sets, model references and transcript entries used across the crate.

pub mod config;
pub mod message;
pub mod model;
