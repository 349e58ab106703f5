//! The per-iteration script a virtual user executes.
//!
//! [`Script`] is the seam between the executor and user behaviour. The
//! built-in [`HttpScript`] is built from a scenario file: one GET, the
//! configured checks, the custom rates, then a random think time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::prelude::*;
use tokio::time::Instant;

use crate::loadtest::checks::{self, Check, CheckResult};
use crate::loadtest::client::{HttpClient, RequestOptions, Response};
use crate::loadtest::config::{Condition, LoadTestConfig, ThinkTime};
use crate::loadtest::error::LoadTestError;
use crate::loadtest::metrics::{MetricKind, MetricRegistry};

/// Per-iteration context handed to [`Script::iteration`].
#[derive(Debug)]
pub struct ExecutionContext {
    /// Id of the executing virtual user.
    pub vu_id: u32,
    /// Zero-based iteration count of this virtual user.
    pub iteration: u64,
    client: HttpClient,
}

impl ExecutionContext {
    /// Creates a context for `vu_id`.
    pub fn new(vu_id: u32, client: HttpClient) -> Self {
        Self {
            vu_id,
            iteration: 0,
            client,
        }
    }

    /// The measuring HTTP client.
    pub fn http(&self) -> &HttpClient {
        &self.client
    }

    /// The run's metric registry.
    pub fn registry(&self) -> &MetricRegistry {
        self.client.registry()
    }

    /// Runs `checks` against `response`.
    pub fn check(&self, response: &Response, checks: &[Check]) -> Vec<CheckResult> {
        checks::evaluate(self.registry(), response, checks)
    }

    /// Records every check in `checks` as failed.
    pub fn fail_checks(&self, checks: &[Check]) -> Vec<CheckResult> {
        checks::fail_all(self.registry(), checks)
    }

    /// Records a sample into a custom metric. Errors are logged, not returned:
    /// a bad metric write never stops a virtual user.
    pub fn add(&self, name: &str, kind: MetricKind, value: f64) {
        if let Err(err) = self.registry().record(name, kind, value) {
            tracing::warn!(vu = self.vu_id, error = %err, "custom metric write rejected");
        }
    }
}

/// What the executor should do after an iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationResult {
    /// Pause before the next iteration.
    pub think_time: Duration,
}

/// One unit of virtual-user behaviour, run repeatedly by the executor.
///
/// Implementations must not panic; request errors are expected to be folded
/// into metrics rather than returned.
#[async_trait]
pub trait Script: Send + Sync {
    /// Runs one iteration.
    async fn iteration(&self, ctx: &mut ExecutionContext) -> IterationResult;
}

/// A custom rate fed once per iteration.
#[derive(Debug, Clone)]
struct RateRule {
    name: String,
    condition: Condition,
}

/// The scenario-file script: GET, checks, custom rates, think time.
#[derive(Debug)]
pub struct HttpScript {
    url: String,
    options: RequestOptions,
    checks: Vec<Check>,
    rates: Vec<RateRule>,
    think_time: ThinkTime,
}

impl HttpScript {
    /// Builds the script from a validated config.
    ///
    /// `url_override` wins over `request.url`; one of them must be set.
    pub fn from_config(
        config: &LoadTestConfig,
        url_override: Option<&str>,
    ) -> Result<Self, LoadTestError> {
        let url = url_override
            .map(str::to_owned)
            .or_else(|| config.request.url.clone())
            .ok_or_else(|| {
                LoadTestError::validation("No target URL: set request.url or pass --url")
            })?;
        crate::loadtest::config::validate_url(&url)?;

        Ok(Self {
            url,
            options: RequestOptions {
                timeout: Some(config.request_timeout()),
                tags: config.request.tags.clone(),
            },
            checks: config.check.iter().map(Check::from_spec).collect(),
            rates: config
                .rate
                .iter()
                .map(|r| RateRule {
                    name: r.name.clone(),
                    condition: r.condition.clone(),
                })
                .collect(),
            think_time: config.request.think_time,
        })
    }

    /// The target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.options.tags
    }

    fn draw_think_time(&self) -> Duration {
        let (min, max) = (self.think_time.min.0, self.think_time.max.0);
        if max <= min {
            return min;
        }
        let secs = rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[async_trait]
impl Script for HttpScript {
    async fn iteration(&self, ctx: &mut ExecutionContext) -> IterationResult {
        let start = Instant::now();
        let response = match ctx.http().get(&self.url, &self.options).await {
            Ok(response) => {
                ctx.check(&response, &self.checks);
                response
            },
            Err(err) => {
                tracing::trace!(vu = ctx.vu_id, error = %err, "iteration request failed");
                ctx.fail_checks(&self.checks);
                Response::no_response(start.elapsed())
            },
        };

        for rate in &self.rates {
            let hit = rate.condition.matches(&response);
            ctx.add(&rate.name, MetricKind::Rate, if hit { 1.0 } else { 0.0 });
        }

        IterationResult {
            think_time: self.draw_think_time(),
        }
    }
}

/// Shared handle to a script.
pub type SharedScript = Arc<dyn Script>;
