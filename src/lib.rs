//! IPv6 alias resolution by fragmentation-identifier velocity.
//!
//! A run drives a remote probing daemon through a staged pipeline: classify
//! which addresses expose an incrementing fragment-ID counter, group those
//! whose counters could be shared, and confirm candidate pairs with the
//! daemon's ally test.

pub mod agent;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod control;
pub mod engine;
pub mod export;
pub mod input;
pub mod object;
pub mod pipeline;
pub mod report;
pub mod sequence;
pub mod sink;
pub mod target;
pub mod wait;
