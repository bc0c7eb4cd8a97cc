//! Telemetry & Observability
//!
//! Structured logging for recovery attempts.
//! Features:
//! - Subscriber setup with `RESILIENCE_LOG` / `RUST_LOG` filters
//! - Compact stderr output or JSON lines
//! - Per-attempt and per-action spans with timing
//! - Log-injection and secret scrubbing for externally supplied text

use regex::Regex;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info_span, warn, Instrument, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Sanitize a string for safe log output by escaping control characters.
/// Prevents log injection where a component embeds newlines to forge entries.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn secret_patterns() -> &'static [Regex] {
    SECRET_PATTERNS.get_or_init(|| {
        [
            r"(?i)(sk-|key-|token-)[A-Za-z0-9_\-]{8,}",
            r"(?i)Bearer\s+[A-Za-z0-9_\-\.]{8,}",
            r"(?i)(password|passwd|pwd|passphrase)\s*[=:]\s*\S+",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Redact credentials that components sometimes echo into error messages.
pub fn redact_secrets(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }
    result
}

/// Both scrubs, in the order they should be applied to component errors.
pub fn scrub(input: &str) -> String {
    redact_secrets(&sanitize_for_log(input))
}

/// Install the global subscriber. Later calls are no-ops.
///
/// Filter precedence: `RESILIENCE_LOG`, `RUST_LOG`, `config.level`, `warn`.
pub fn init_tracing(config: &LoggingConfig) {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let directive = std::env::var("RESILIENCE_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .or_else(|| config.level.clone())
            .unwrap_or_else(|| "warn".to_string());
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));

        let registry = tracing_subscriber::registry().with(filter);
        let result = if config.json {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(std::io::stderr),
                )
                .try_init()
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_level(true)
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init()
        };
        if result.is_err() {
            debug!("Tracing subscriber already installed");
        }
    });
}

/// Span wrapping one recovery attempt.
pub fn recovery_span(attempt_id: &str, trigger: &str, component: &str) -> Span {
    info_span!(
        "recovery_attempt",
        attempt_id = attempt_id,
        trigger = trigger,
        component = %sanitize_for_log(component),
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Run one action future inside an `action` span, recording duration and outcome.
pub async fn track_action<F, T, E>(label: &str, attempt: u32, fut: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let span = info_span!(
        "action",
        action = label,
        attempt = attempt,
        duration_ms = tracing::field::Empty,
        success = tracing::field::Empty,
    );
    let result = fut.instrument(span.clone()).await;
    let duration = start.elapsed().as_millis() as u64;
    span.record("duration_ms", duration);
    span.record("success", result.is_ok());
    if let Err(e) = &result {
        warn!(
            action = label,
            attempt,
            duration_ms = duration,
            error = %scrub(&e.to_string()),
            "Action attempt failed"
        );
    } else {
        debug!(action = label, attempt, duration_ms = duration, "Action attempt succeeded");
    }
    result
}

/// Initialize tracing for tests with a simple subscriber
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
