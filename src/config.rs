// ── Platform configuration ───────────────────────────────────────────────
// Loaded once at process start from the environment (§6 "Environment
// contract") and passed explicitly from then on — never a lazy global
// singleton (§9 "global config singleton" guidance).

use crate::atoms::error::{PlatformError, PlatformResult};
use log::info;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub database_dsn: String,
    pub kv_host: String,
    pub model_api_keys: HashMap<String, String>,
    pub jwt_secret: String,
    pub admin_auth_enabled: bool,
    pub auto_migrate: bool,
    pub free_credit_ceiling: rust_decimal::Decimal,
    pub skill_pricing_table_path: String,
    pub sentry_dsn: Option<String>,
    pub alert_webhook_url: Option<String>,
}

impl PlatformConfig {
    /// Load from environment variables, aborting with `Config` on any
    /// missing required key.
    pub fn from_env() -> PlatformResult<Self> {
        let database_dsn = require_env("DATABASE_DSN")?;
        let kv_host = require_env("KV_HOST")?;
        let jwt_secret = require_env("JWT_SECRET")?;
        let free_credit_ceiling_raw = require_env("FREE_CREDIT_CEILING")?;
        let free_credit_ceiling = free_credit_ceiling_raw
            .parse()
            .map_err(|e| PlatformError::Config(format!("FREE_CREDIT_CEILING: {e}")))?;
        let skill_pricing_table_path = require_env("SKILL_PRICING_TABLE_PATH")?;

        let mut model_api_keys = HashMap::new();
        for (provider, var) in [
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("openai", "OPENAI_API_KEY"),
            ("google", "GOOGLE_API_KEY"),
        ] {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    model_api_keys.insert(provider.to_string(), key);
                }
            }
        }
        if model_api_keys.is_empty() {
            return Err(PlatformError::Config(
                "at least one model provider API key must be configured".into(),
            ));
        }

        let admin_auth_enabled = bool_env("ADMIN_AUTH_ENABLED", true);
        let auto_migrate = bool_env("AUTO_MIGRATE", true);

        info!("[config] loaded platform configuration ({} model providers)", model_api_keys.len());

        Ok(PlatformConfig {
            database_dsn,
            kv_host,
            model_api_keys,
            jwt_secret,
            admin_auth_enabled,
            auto_migrate,
            free_credit_ceiling,
            skill_pricing_table_path,
            sentry_dsn: std::env::var("SENTRY_DSN").ok().filter(|s| !s.is_empty()),
            alert_webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
        })
    }

    /// In-memory defaults for tests: SQLite-in-memory DSN, no external
    /// providers required, a permissive free-credit ceiling.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        PlatformConfig {
            database_dsn: ":memory:".into(),
            kv_host: "memory".into(),
            model_api_keys: HashMap::from([("anthropic".into(), "test-key".into())]),
            jwt_secret: "test-secret".into(),
            admin_auth_enabled: false,
            auto_migrate: true,
            free_credit_ceiling: "10.0000".parse().unwrap(),
            skill_pricing_table_path: "skills.toml".into(),
            sentry_dsn: None,
            alert_webhook_url: None,
        }
    }
}

fn require_env(key: &str) -> PlatformResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PlatformError::Config(format!("missing required environment key: {key}")))
}

fn bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}
