//! Photo metadata ingestion into a relational store.
//!
//! A JSON tag taxonomy drives the table schema; extracted metadata records
//! are normalized against it and inserted in batches. Failures on
//! individual records or columns are collected as diagnostics instead of
//! aborting the run.

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod report;
pub mod source;
pub mod taxonomy;

pub use error::{Error, Result};
