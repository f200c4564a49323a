//! Boot-time configuration, read once from the environment.

use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Clone)]
pub struct AiConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Clone)]
pub struct Config {
    pub bind: String,
    pub database_url: String,
    pub redis_url: String,
    /// Provider app secret, signs inbound webhook bodies.
    pub app_secret: String,
    /// Token echoed back on the provider's GET verification challenge.
    pub verify_token: String,
    pub jwt_secret: String,
    pub provider_api_base: String,
    pub media_root: PathBuf,
    pub allow_internal_urls: bool,
    /// Empty list means every origin may upgrade.
    pub ws_allowed_origins: Vec<String>,
    pub webhook_poll_secs: u64,
    pub media_sweep_secs: u64,
    pub campaign_workers: usize,
    pub pipeline_buffer: usize,
    pub json_logs: bool,
    pub ai: Option<AiConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let ai = match std::env::var("AI_API_URL") {
            Ok(api_url) if !api_url.is_empty() => Some(AiConfig {
                api_url,
                api_key: std::env::var("AI_API_KEY").unwrap_or_default(),
                model: std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            }),
            _ => None,
        };

        Ok(Self {
            bind: std::env::var("BIND").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL required")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            app_secret: std::env::var("APP_SECRET").context("APP_SECRET required")?,
            verify_token: std::env::var("VERIFY_TOKEN").context("VERIFY_TOKEN required")?,
            jwt_secret: std::env::var("JWT_SECRET").context("JWT_SECRET required")?,
            provider_api_base: std::env::var("WA_API_BASE")
                .unwrap_or_else(|_| "https://graph.facebook.com".into()),
            media_root: std::env::var("MEDIA_ROOT")
                .unwrap_or_else(|_| "./media".into())
                .into(),
            allow_internal_urls: env_flag("ALLOW_INTERNAL_URLS"),
            ws_allowed_origins: std::env::var("WS_ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            webhook_poll_secs: env_u64("WEBHOOK_POLL_SECS", 10),
            media_sweep_secs: env_u64("MEDIA_SWEEP_SECS", 3600),
            campaign_workers: env_u64("CAMPAIGN_WORKERS", 2) as usize,
            pipeline_buffer: env_u64("PIPELINE_BUFFER", 1024) as usize,
            json_logs: env_flag("JSON_LOGS"),
            ai,
        })
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
