//! Named per-response assertions.
//!
//! Each [`Check`] runs independently against a response; results go into the
//! `checks` rate and into a `checks{check:<name>}` series per check, which is
//! what the summary's pass/fail table is built from.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::loadtest::client::Response;
use crate::loadtest::config::{CheckSpec, Condition};
use crate::loadtest::metrics::{names, series_key, MetricRegistry};

/// Tag key under which per-check series are recorded.
pub const CHECK_TAG: &str = "check";

type Predicate = Box<dyn Fn(&Response) -> bool + Send + Sync>;

/// A named boolean assertion over a [`Response`].
pub struct Check {
    name: String,
    predicate: Predicate,
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Check {
    /// Creates a check from a closure.
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
        }
    }

    /// Creates a check from a declarative `[[check]]` table.
    pub fn from_spec(spec: &CheckSpec) -> Self {
        let condition: Condition = spec.condition.clone();
        Self::new(spec.name.clone(), move |r| condition.matches(r))
    }

    /// The check name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of one check against one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Check name.
    pub name: String,
    /// Whether the predicate returned `true`.
    pub passed: bool,
}

/// Runs every check against `response` and records the results.
///
/// No short-circuit: a failing check does not skip the next one. A predicate
/// that panics is recorded as failed.
pub fn evaluate(registry: &MetricRegistry, response: &Response, checks: &[Check]) -> Vec<CheckResult> {
    checks
        .iter()
        .map(|check| {
            let passed = match catch_unwind(AssertUnwindSafe(|| (check.predicate)(response))) {
                Ok(passed) => passed,
                Err(_) => {
                    tracing::warn!(check = %check.name, "check predicate panicked; counting as failed");
                    false
                },
            };
            record(registry, &check.name, passed);
            CheckResult {
                name: check.name.clone(),
                passed,
            }
        })
        .collect()
}

/// Records every check as failed. Used when the request itself errored and
/// there is no response to assert on.
pub fn fail_all(registry: &MetricRegistry, checks: &[Check]) -> Vec<CheckResult> {
    checks
        .iter()
        .map(|check| {
            record(registry, &check.name, false);
            CheckResult {
                name: check.name.clone(),
                passed: false,
            }
        })
        .collect()
}

fn record(registry: &MetricRegistry, name: &str, passed: bool) {
    let result = registry
        .record_rate(names::CHECKS, passed)
        .and_then(|()| registry.record_rate(&series_key(names::CHECKS, CHECK_TAG, name), passed));
    if let Err(err) = result {
        tracing::warn!(check = name, error = %err, "dropping check result");
    }
}
