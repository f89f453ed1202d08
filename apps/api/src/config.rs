use std::str::FromStr;

use anyhow::{Context, Result};

use crate::llm_client::DEFAULT_BASE_URL;

/// Application configuration loaded from environment variables.
/// Every backing service is optional: without `DATABASE_URL` the library lives in
/// memory, without `REDIS_URL` job analyses are cached in-process.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub port: u16,
    pub rust_log: String,
    pub embed_poll_interval_ms: u64,
    pub embed_concurrency: usize,
    pub enable_fallback_scoring: bool,
    pub prefilter_per_role_cap: usize,
    pub prefilter_global_cap: usize,
    pub max_selected_bullets: usize,
    pub worker_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: None,
            redis_url: None,
            openai_api_key: None,
            openai_base_url: DEFAULT_BASE_URL.to_string(),
            port: 8080,
            rust_log: "info".to_string(),
            embed_poll_interval_ms: 1000,
            embed_concurrency: 3,
            enable_fallback_scoring: true,
            prefilter_per_role_cap: 60,
            prefilter_global_cap: 240,
            max_selected_bullets: 50,
            worker_timeout_secs: 120,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        let defaults = Config::default();

        Ok(Config {
            database_url: optional_env("DATABASE_URL"),
            redis_url: optional_env("REDIS_URL"),
            openai_api_key: optional_env("OPENAI_API_KEY"),
            openai_base_url: optional_env("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            port: parse_env("PORT", defaults.port)?,
            rust_log: optional_env("RUST_LOG").unwrap_or(defaults.rust_log),
            embed_poll_interval_ms: parse_env("EMBED_POLL_INTERVAL_MS", defaults.embed_poll_interval_ms)?,
            embed_concurrency: parse_env("EMBED_CONCURRENCY", defaults.embed_concurrency)?,
            enable_fallback_scoring: parse_env(
                "ENABLE_FALLBACK_SCORING",
                defaults.enable_fallback_scoring,
            )?,
            prefilter_per_role_cap: parse_env("PREFILTER_PER_ROLE_CAP", defaults.prefilter_per_role_cap)?,
            prefilter_global_cap: parse_env("PREFILTER_GLOBAL_CAP", defaults.prefilter_global_cap)?,
            max_selected_bullets: parse_env("MAX_SELECTED_BULLETS", defaults.max_selected_bullets)?,
            worker_timeout_secs: parse_env("WORKER_TIMEOUT_SECS", defaults.worker_timeout_secs)?,
        })
    }
}

/// Unset and blank are both treated as absent.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("Environment variable '{key}' has invalid value '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_accepts_valid_numbers_and_bools() {
        assert_eq!(parse_value::<u16>("PORT", "9090").unwrap(), 9090);
        assert!(!parse_value::<bool>("ENABLE_FALLBACK_SCORING", "false").unwrap());
    }

    #[test]
    fn test_parse_value_rejects_garbage_with_variable_name() {
        let err = parse_value::<usize>("EMBED_CONCURRENCY", "three").unwrap_err();
        assert!(err.to_string().contains("EMBED_CONCURRENCY"));
    }
}
