// ── Model Provider Registry ──────────────────────────────────────────────
// AnyProvider wraps Box<dyn ModelProvider> so adding a new backend never
// requires touching the execution engine — only implement the trait and
// add one arm to `from_config`. The HTTP/SSE wire formats below are the
// ambient "the engine has to call a real model somewhere" plumbing the
// distilled spec omits; payment gating and settlement never look past
// `StreamChunk`.

pub mod anthropic;
pub mod google;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;

use crate::atoms::error::{PlatformError, PlatformResult};
use crate::atoms::types::{Message, ProviderConfig, ProviderKind, StreamChunk, ToolDefinition};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
    ) -> PlatformResult<Vec<StreamChunk>>;
}

/// Type-erased model provider. The execution engine holds one of these per
/// configured backend and never matches on `ProviderKind` itself.
pub struct AnyProvider(Box<dyn ModelProvider>);

impl AnyProvider {
    pub fn from_config(config: &ProviderConfig) -> Self {
        let provider: Box<dyn ModelProvider> = match config.kind {
            ProviderKind::Anthropic => Box::new(AnthropicProvider::new(config)),
            ProviderKind::Google => Box::new(GoogleProvider::new(config)),
            ProviderKind::OpenAI | ProviderKind::Custom => Box::new(OpenAiProvider::new(config)),
        };
        AnyProvider(provider)
    }

    /// Wrap an already-constructed provider — the execution engine's tests
    /// drive a stub `ModelProvider` this way instead of going through
    /// `from_config`.
    pub fn from_boxed(provider: Box<dyn ModelProvider>) -> Self {
        AnyProvider(provider)
    }

    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
    ) -> PlatformResult<Vec<StreamChunk>> {
        self.0.chat(messages, tools, model, temperature).await
    }

    pub fn kind(&self) -> ProviderKind {
        self.0.kind()
    }
}

// ── Shared retry / circuit-breaker plumbing ──────────────────────────────

pub(crate) const MAX_RETRIES: u32 = 2;

pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status == 500 || status == 502 || status == 503 || status == 504
}

pub(crate) fn parse_retry_after(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}

pub(crate) async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let delay = match retry_after_secs {
        Some(secs) => Duration::from_secs(secs),
        None => Duration::from_millis(250 * 2u64.pow(attempt)),
    };
    tokio::time::sleep(delay).await;
    delay
}

/// Per-provider failure tracker: trips open after `threshold` consecutive
/// failures and rejects new requests for `cooldown` before half-opening.
/// A provider outage never blocks callers behind an unbounded retry storm.
pub(crate) struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    opened_at_unix_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        CircuitBreaker {
            threshold,
            cooldown: Duration::from_secs(cooldown_secs),
            consecutive_failures: AtomicU32::new(0),
            opened_at_unix_ms: AtomicU64::new(0),
        }
    }

    pub fn check(&self) -> Result<(), String> {
        let opened_at = self.opened_at_unix_ms.load(Ordering::Relaxed);
        if opened_at == 0 {
            return Ok(());
        }
        let now = now_unix_ms();
        if now.saturating_sub(opened_at) >= self.cooldown.as_millis() as u64 {
            // Half-open: let one request through to probe recovery.
            return Ok(());
        }
        Err("circuit open: provider has exceeded its failure threshold".into())
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.opened_at_unix_ms.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold {
            self.opened_at_unix_ms.store(now_unix_ms(), Ordering::Relaxed);
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub(crate) fn model_error(provider: &str, status: u16, message: impl Into<String>) -> PlatformError {
    PlatformError::model_error(provider, format!("status {status}: {}", message.into()))
}

pub(crate) fn transport_error(provider: &str, message: impl Into<String>) -> PlatformError {
    PlatformError::model_error(provider, message.into())
}
