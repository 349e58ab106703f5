//! loadramp: staged HTTP load testing.
//!
//! The [`loadtest`] module holds the engine. A scenario is a TOML file with
//! ramp stages, a target request, checks and thresholds; the engine ramps
//! virtual users along the stages, aggregates metrics and returns a
//! pass/fail verdict.
//!
//! ```no_run
//! use loadramp::loadtest::config::LoadTestConfig;
//! use loadramp::loadtest::engine::LoadTestEngine;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoadTestConfig::load(std::path::Path::new(".loadramp/loadtest.toml"))?;
//! let result = LoadTestEngine::new(config).run().await?;
//! std::process::exit(if result.passed() { 0 } else { 99 });
//! # }
//! ```

pub mod loadtest;
