//! Floodgate - inline event rate limiting
//!
//! This crate rate-limits a stream of structured events against quotas
//! fetched from a remote policy source. Each distinct identity and matching
//! rule gets its own sliding window of fixed-width buckets; counters are
//! created on demand and dropped once idle.

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod processor;
pub mod ratelimit;
pub mod server;
