//! Common types for Pageweave
//!
//! Shared vocabulary between the orchestration engine and its callers:
//! the [`provider::ModelProvider`] capability, the closed
//! [`error::ErrorKind`] failure classification, job progress events,
//! configuration, and display helpers.

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;
pub mod provider;

pub use crate::error::{Error, ErrorKind, ProviderError, Result};
