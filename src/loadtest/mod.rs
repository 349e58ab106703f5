//! Staged HTTP load generation.
//!
//! Provides typed TOML configuration, an HTTP client that records request
//! metrics, declarative checks, a run-scoped metric registry with
//! HdrHistogram-backed trends, a stage scheduler that ramps virtual users,
//! threshold evaluation, and terminal/JSON reporting.

pub mod checks;
pub mod client;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod report;
pub mod scheduler;
pub mod script;
pub mod summary;
pub mod threshold;
pub mod vu;
