// ── Alert sink & error reporter (SPEC_FULL §1.B) ────────────────────────
// The original posts consistency-check results to a chat webhook with
// severity-based coloring and only pings on nonzero inconsistencies, and
// wires a Sentry-style capture hook around every process entrypoint. We
// generalize both to small traits so the Checker and the ledger's
// `LEDGER_INCONSISTENCY` / `INTERNAL` paths don't depend on a concrete
// product (Slack, Sentry, or anything else).

use crate::atoms::error::PlatformError;
use crate::atoms::types::CheckResult;
use crate::config::PlatformConfig;
use log::{error, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Critical,
}

pub trait AlertSink: Send + Sync {
    fn send(&self, severity: AlertSeverity, summary: &str, body: &str);

    /// Post a consistency-audit summary. Pings (Critical) only when at
    /// least one finding has `status == false`, mirroring the source's
    /// "escalate only when non-zero inconsistencies are found" policy.
    fn send_check_summary(&self, band: &str, results: &[CheckResult]) {
        let failures = results.iter().filter(|r| !r.status).count();
        let severity = if failures > 0 { AlertSeverity::Critical } else { AlertSeverity::Info };
        let summary = format!("{band} consistency audit: {failures}/{} checks failed", results.len());
        let body = results
            .iter()
            .map(|r| format!("- [{}] {} ({})", if r.status { "ok" } else { "FAIL" }, r.check_type, r.details))
            .collect::<Vec<_>>()
            .join("\n");
        self.send(severity, &summary, &body);
    }
}

/// Default sink: writes through the `log` facade. Good enough for local
/// development and for tests; production deployments plug in a real
/// webhook sink behind the same trait.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, severity: AlertSeverity, summary: &str, body: &str) {
        match severity {
            AlertSeverity::Critical => error!("[alert] {summary}\n{body}"),
            AlertSeverity::Info => info!("[alert] {summary}"),
        }
    }
}

/// Posts a JSON payload to a configured webhook URL. Network failures are
/// logged and swallowed — an alert sink must never itself become a source
/// of request failures.
pub struct WebhookAlertSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), client: reqwest::Client::new() }
    }
}

impl AlertSink for WebhookAlertSink {
    fn send(&self, severity: AlertSeverity, summary: &str, body: &str) {
        let payload = serde_json::json!({
            "severity": if severity == AlertSeverity::Critical { "critical" } else { "info" },
            "summary": summary,
            "body": body,
        });
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                warn!("[alert] failed to deliver webhook alert: {e}");
            }
        });
    }
}

/// Captures errors from the LEDGER_INCONSISTENCY / INTERNAL kinds per the
/// §7 propagation policy ("logged and alerted for 9-10"). The default
/// implementation just logs; a Sentry-backed implementation would report
/// here instead.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &PlatformError);
}

pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, err: &PlatformError) {
        if err.should_alert() {
            error!("[error-reporter] {}: {err}", err.kind());
        }
    }
}

/// Builds the configured alert sink: a webhook when `alert_webhook_url` is
/// set, falling back to the log-only sink otherwise.
pub fn alert_sink_from_config(config: &PlatformConfig) -> Arc<dyn AlertSink> {
    match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(url.clone())),
        None => Arc::new(LogAlertSink),
    }
}

/// Builds the configured error reporter. No Sentry SDK is wired into this
/// crate; when `sentry_dsn` is set we note it once so an operator can see
/// capture isn't actually happening, rather than silently dropping it.
pub fn error_reporter_from_config(config: &PlatformConfig) -> Arc<dyn ErrorReporter> {
    if let Some(dsn) = &config.sentry_dsn {
        info!("[error-reporter] SENTRY_DSN is set ({dsn}) but no Sentry SDK is wired in; falling back to the log-based reporter");
    }
    Arc::new(LogErrorReporter)
}
