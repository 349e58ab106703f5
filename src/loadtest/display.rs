//! Live terminal progress for a running load test.
//!
//! Renders one in-place spinner line with the stage label, running/target VUs,
//! request rate, p95 latency, failed-request rate and elapsed time. Updates
//! arrive through a watch channel from the engine's monitor task every couple
//! of seconds, never per request.

use crate::loadtest::engine::DisplayState;
use crate::loadtest::metrics::{names, MetricsSnapshot};

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// p95 above this is highlighted.
const SLOW_P95_MS: f64 = 1000.0;

/// Spinner line showing live run progress on stderr.
pub struct LiveDisplay {
    status_bar: ProgressBar,
}

impl LiveDisplay {
    /// Create a new live display.
    ///
    /// If `no_color` is true or stderr is not a terminal (piped), color output
    /// is disabled.
    pub fn new(no_color: bool) -> Self {
        if no_color || !std::io::stderr().is_terminal() {
            colored::control::set_override(false);
        }

        let status_bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {wide_msg}") {
            status_bar.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        status_bar.enable_steady_tick(Duration::from_millis(100));

        Self { status_bar }
    }

    /// Formats one status line.
    ///
    /// Red marks a non-zero failed-request rate, yellow a p95 above one
    /// second.
    pub fn format_status(
        snap: &MetricsSnapshot,
        elapsed: Duration,
        active_vus: u32,
        target_vus: u32,
        stage_label: Option<&str>,
    ) -> String {
        let elapsed_secs = elapsed.as_secs_f64();
        let requests = snap.counter_total(names::HTTP_REQS);
        let rps = if elapsed_secs > 0.0 {
            requests / elapsed_secs
        } else {
            0.0
        };
        let p95 = snap
            .trend(names::HTTP_REQ_DURATION)
            .and_then(|t| t.percentile(95.0))
            .unwrap_or(0.0);
        let failed = snap.rate(names::HTTP_REQ_FAILED).unwrap_or(0.0);

        let p95_str = format!("{p95:.0}ms");
        let p95_display = if p95 > SLOW_P95_MS {
            p95_str.yellow().to_string()
        } else {
            p95_str.green().to_string()
        };
        let failed_str = format!("{:.1}%", failed * 100.0);
        let failed_display = if failed > 0.0 {
            failed_str.red().to_string()
        } else {
            failed_str
        };

        let line = format!(
            "vus: {}  |  reqs: {} ({}/s)  |  p95: {}  |  failed: {}  |  elapsed: {}s",
            format!("{active_vus}/{target_vus}").green(),
            requests as u64,
            format!("{rps:.1}").green(),
            p95_display,
            failed_display,
            elapsed.as_secs()
        );

        match stage_label {
            Some(label) => format!("  [{label}]  {line}"),
            None => format!("  {line}"),
        }
    }

    /// Replaces the status line.
    pub fn update(&self, state: &DisplayState) {
        self.status_bar.set_message(Self::format_status(
            &state.snapshot,
            state.elapsed,
            state.active_vus,
            state.target_vus,
            state.stage_label.as_deref(),
        ));
    }

    /// Stop the display and clear the spinner.
    pub fn finish(&self) {
        self.status_bar.finish_and_clear();
    }
}

/// Run the live display loop.
///
/// Redraws on every [`DisplayState`] published by the engine. Stops when the
/// [`CancellationToken`] is cancelled or the watch sender is dropped.
pub async fn display_loop(
    mut display_rx: watch::Receiver<DisplayState>,
    cancel: CancellationToken,
    no_color: bool,
) {
    let display = LiveDisplay::new(no_color);

    eprintln!();
    eprintln!("  Running load test...");
    eprintln!();

    loop {
        tokio::select! {
            result = display_rx.changed() => {
                if result.is_err() {
                    break;
                }
                let state = display_rx.borrow_and_update().clone();
                display.update(&state);
            }
            _ = cancel.cancelled() => {
                let state = display_rx.borrow().clone();
                display.update(&state);
                break;
            }
        }
    }

    display.finish();
}
