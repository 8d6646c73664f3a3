//! Floodgate - Fixed-Window Admission Control
//!
//! This crate decides, per inbound HTTP request, whether to admit or reject it
//! based on a fixed-window counter keyed by the caller's identity (network
//! address or bearer token). Counters live in a shared store with atomic
//! increments, so any number of service instances can enforce one limit.

pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod store;
