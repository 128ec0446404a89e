//! Sluice - Distributed Rate Limiting
//!
//! This crate implements a sliding-window rate limiter whose state lives in a
//! shared store, so every instance of a horizontally scaled service enforces
//! the same budgets. Callers that stay under their budget earn burst credit
//! that temporarily raises their limit. A fail-open circuit breaker keeps
//! requests flowing when the store is unavailable, and every decision feeds
//! per-minute usage metrics and high-usage alerts.

pub mod admission;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod ratelimit;
pub mod store;

pub use error::{Result, SluiceError};
