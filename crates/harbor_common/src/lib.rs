//! Shared types for the pgharbor control plane.
//!
//! Domain model, typed errors, and configuration loading used by the
//! `harbord` daemon.

pub mod config;
pub mod error;
pub mod model;

pub use error::HarborError;
