//! Ratekeeper - Distributed Fixed-Window Rate Limiting
//!
//! This crate enforces per-route, per-caller request quotas across a fleet of
//! stateless HTTP servers. Every instance increments the same counter in a
//! shared Redis store through one atomic script, so the fleet agrees on how
//! many requests a caller made in the current window.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod web;
