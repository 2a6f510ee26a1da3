//! Environment configuration for bot binaries

use crate::dispatch::DEFAULT_MAX_CONCURRENCY;
use crate::poller::PollerConfig;
use crate::transport::{HttpTransport, TransportError, UpdateParams, DEFAULT_API_HOST, MAX_UPDATES_LIMIT};
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TELBOT_TOKEN is not set")]
    MissingToken,

    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub token: String,
    pub api_host: String,
    pub poll_timeout_secs: u32,
    pub poll_limit: u32,
    pub allowed_updates: Vec<String>,
    pub max_concurrency: usize,
    pub log_json: bool,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process
    /// environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("TELBOT_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let allowed_updates = lookup("TELBOT_ALLOWED_UPDATES").map_or_else(
            || vec!["message".to_string()],
            |raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|kind| !kind.is_empty())
                    .map(String::from)
                    .collect()
            },
        );

        Ok(Self {
            token,
            api_host: lookup("TELBOT_API_HOST").unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
            poll_timeout_secs: parse_var(&lookup, "TELBOT_POLL_TIMEOUT_SECS", 30)?,
            poll_limit: parse_var(&lookup, "TELBOT_POLL_LIMIT", MAX_UPDATES_LIMIT)?
                .clamp(1, MAX_UPDATES_LIMIT),
            allowed_updates,
            max_concurrency: parse_var(&lookup, "TELBOT_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY)?
                .max(1),
            log_json: lookup("TELBOT_LOG_JSON")
                .is_some_and(|v| !matches!(v.trim(), "" | "0" | "false")),
        })
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            params: UpdateParams {
                offset: 0,
                limit: self.poll_limit,
                timeout: self.poll_timeout_secs,
                allowed_updates: self.allowed_updates.clone(),
            },
            ..PollerConfig::default()
        }
    }

    pub fn http_transport(&self) -> Result<HttpTransport, TransportError> {
        HttpTransport::new(&self.token, Some(&self.api_host))
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse();
            parsed.map_err(|_| ConfigError::Invalid { var, value })
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// `telbot=info` fallback.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "telbot=info,question_bot=info,echo_bot=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
