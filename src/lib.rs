//! Turnstile - Admission Control and Request Throttling
//!
//! This crate implements per-key fixed-window rate limiting for request
//! pipelines. Counters live in a shared Redis store so every process sees
//! the same counts; when that store is unreachable each call falls back to
//! an in-process store rather than failing the request.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod store;
