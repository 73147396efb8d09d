//! Cache-then-store attachments over pluggable storage backends.
//!
//! Uploads land in a volatile cache backend first and are promoted to a
//! durable store backend when their record is saved, either inline or from
//! a background job. See [`attacher::Attacher`] for the lifecycle and
//! [`analyzer::AnalyzerRegistry`] for metadata extraction.

pub mod analyzer;
pub mod attacher;
pub mod config;
pub mod error;
pub mod observers;
pub mod pipeline;
pub mod processor;
pub mod records;

mod integration_test;
#[cfg(test)]
mod testing;
