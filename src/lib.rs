//! Gatekeeper - Admission Control for Alert Ingestion
//!
//! This crate decides whether an incoming request may proceed. A sliding
//! window rate limiter caps requests per client key, and a circuit breaker
//! per downstream resource stops calls to dependencies that keep failing.
//! State lives in a shared Redis store so every instance enforces the same
//! limits, or in an in-memory store for single-instance deployments.

pub mod circuit;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod ratelimit;
pub mod store;
