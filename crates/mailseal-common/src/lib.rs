//! MailSeal Common - Shared types and utilities
//!
//! This crate provides the error type, configuration, and value types
//! shared across all MailSeal components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
