//! marketplace-sync - A rate-limited synchronization engine for marketplace APIs
//!
//! This crate keeps an ERP's local store in sync with a marketplace REST API.
//! Every outbound call passes a per-class rate limiter and a retry policy;
//! paginated listings are ingested per account on a schedule and upserted
//! idempotently into SQLite.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod server;
pub mod sync;
pub mod telemetry;
