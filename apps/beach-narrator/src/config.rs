use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::auth::AuthMode;
use crate::narration::BatchPolicy;
use crate::narration::pipeline::DEFAULT_TICK;
use crate::session::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PING_INTERVAL, DEFAULT_PONG_GRACE, DEFAULT_REQUEST_TIMEOUT,
    SessionOptions,
};

pub const ENV_SERVER: &str = "BEACH_NARRATOR_SERVER";
pub const ENV_SESSION: &str = "BEACH_NARRATOR_SESSION";
pub const ENV_AUTH: &str = "BEACH_NARRATOR_AUTH";
pub const ENV_AUTH_GATEWAY: &str = "BEACH_NARRATOR_AUTH_GATEWAY";
pub const ENV_CHAR_THRESHOLD: &str = "BEACH_NARRATOR_CHAR_THRESHOLD";
pub const ENV_TIME_THRESHOLD_MS: &str = "BEACH_NARRATOR_TIME_THRESHOLD_MS";
pub const ENV_MAX_CHUNK: &str = "BEACH_NARRATOR_MAX_CHUNK";
pub const ENV_TICK_MS: &str = "BEACH_NARRATOR_TICK_MS";
pub const ENV_PING_INTERVAL_SECS: &str = "BEACH_NARRATOR_PING_INTERVAL_SECS";
pub const ENV_PONG_GRACE_SECS: &str = "BEACH_NARRATOR_PONG_GRACE_SECS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "BEACH_NARRATOR_REQUEST_TIMEOUT_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "BEACH_NARRATOR_MAX_ATTEMPTS";

const DEFAULT_SERVER: &str = "127.0.0.1:8080";
const DEFAULT_AUTH_GATEWAY: &str = "https://auth.beach.sh";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {source}")]
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
    #[error("invalid {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub mode: AuthMode,
    pub gateway: Url,
}

/// Narrator configuration, loaded from `BEACH_NARRATOR_*` variables.
#[derive(Debug, Clone)]
pub struct NarratorConfig {
    /// HTTP(S) base of the session server.
    pub server: Url,
    pub session_id: Option<String>,
    pub auth: AuthSettings,
    pub batch: BatchPolicy,
    pub narration_tick: Duration,
    pub ping_interval: Duration,
    pub pong_grace: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
}

impl NarratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let server = normalize_server(
            ENV_SERVER,
            var(ENV_SERVER).as_deref().unwrap_or(DEFAULT_SERVER),
        )?;
        let mode = match var(ENV_AUTH).as_deref() {
            None => AuthMode::NotRequired,
            Some(value) => parse_auth_mode(value).ok_or_else(|| ConfigError::InvalidValue {
                var: ENV_AUTH,
                expected: "'none' or 'bearer'",
                value: value.to_string(),
            })?,
        };
        let gateway = var(ENV_AUTH_GATEWAY).unwrap_or_else(|| DEFAULT_AUTH_GATEWAY.to_string());
        let gateway = Url::parse(&gateway).map_err(|source| ConfigError::InvalidUrl {
            var: ENV_AUTH_GATEWAY,
            source,
        })?;

        let batch_defaults = BatchPolicy::default();
        let batch = BatchPolicy {
            char_threshold: parse_number(ENV_CHAR_THRESHOLD, var(ENV_CHAR_THRESHOLD))?
                .unwrap_or(batch_defaults.char_threshold as u64) as usize,
            time_threshold: parse_number(ENV_TIME_THRESHOLD_MS, var(ENV_TIME_THRESHOLD_MS))?
                .map(Duration::from_millis)
                .unwrap_or(batch_defaults.time_threshold),
            max_chunk_size: parse_number(ENV_MAX_CHUNK, var(ENV_MAX_CHUNK))?
                .unwrap_or(batch_defaults.max_chunk_size as u64) as usize,
        };

        Ok(Self {
            server,
            session_id: var(ENV_SESSION),
            auth: AuthSettings { mode, gateway },
            batch,
            narration_tick: parse_period(ENV_TICK_MS, var(ENV_TICK_MS))?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TICK),
            ping_interval: parse_period(ENV_PING_INTERVAL_SECS, var(ENV_PING_INTERVAL_SECS))?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PING_INTERVAL),
            pong_grace: parse_period(ENV_PONG_GRACE_SECS, var(ENV_PONG_GRACE_SECS))?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PONG_GRACE),
            request_timeout: parse_period(ENV_REQUEST_TIMEOUT_SECS, var(ENV_REQUEST_TIMEOUT_SECS))?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_attempts: parse_number(ENV_MAX_ATTEMPTS, var(ENV_MAX_ATTEMPTS))?
                .map(|value| value.min(u32::MAX as u64) as u32)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
        })
    }

    pub fn set_server(&mut self, raw: &str) -> Result<(), ConfigError> {
        self.server = normalize_server(ENV_SERVER, raw)?;
        Ok(())
    }

    /// WebSocket streaming endpoint derived from the server base.
    pub fn stream_url(&self) -> Url {
        let mut url = self.server.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        if url.set_scheme(scheme).is_err() {
            tracing::warn!(target: "narrator::session", server = %self.server, "cannot derive websocket scheme");
        }
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", "stream"]);
        }
        url
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            ping_interval: self.ping_interval,
            pong_grace: self.pong_grace,
            request_timeout: self.request_timeout,
            max_attempts: self.max_attempts,
            ..SessionOptions::new(self.stream_url())
        }
    }
}

/// Accepts bare `host:port` as well as full URLs. Local addresses default to
/// plain HTTP, everything else to HTTPS, and `localhost` is pinned to IPv4.
pub fn normalize_server(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim().trim_end_matches('/');
    let mut candidate = if raw.contains("://") {
        raw.to_string()
    } else if raw.starts_with("localhost") || raw.starts_with("127.0.0.1") {
        format!("http://{raw}")
    } else {
        format!("https://{raw}")
    };
    if let Some(rest) = candidate.strip_prefix("ws://") {
        candidate = format!("http://{rest}");
    } else if let Some(rest) = candidate.strip_prefix("wss://") {
        candidate = format!("https://{rest}");
    }

    let mut url = Url::parse(&candidate).map_err(|source| ConfigError::InvalidUrl { var, source })?;
    if url.host_str() == Some("localhost") {
        url.set_host(Some("127.0.0.1"))
            .map_err(|source| ConfigError::InvalidUrl { var, source })?;
    }
    Ok(url)
}

fn parse_auth_mode(value: &str) -> Option<AuthMode> {
    match value.to_ascii_lowercase().as_str() {
        "none" | "off" | "false" | "0" => Some(AuthMode::NotRequired),
        "bearer" | "token" | "on" | "true" | "1" => Some(AuthMode::Bearer),
        _ => None,
    }
}

fn parse_number(var: &'static str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
    value
        .map(|value| {
            value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                var,
                expected: "a non-negative integer",
                value,
            })
        })
        .transpose()
}

/// Timer periods must be non-zero.
fn parse_period(var: &'static str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
    match parse_number(var, value)? {
        Some(0) => Err(ConfigError::InvalidValue {
            var,
            expected: "a positive integer",
            value: "0".to_string(),
        }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<NarratorConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        NarratorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test_timeout::timeout]
    fn defaults_apply_when_nothing_is_set() {
        let config = from_pairs(&[]).expect("config");
        assert_eq!(config.server.as_str(), "http://127.0.0.1:8080/");
        assert_eq!(config.stream_url().as_str(), "ws://127.0.0.1:8080/api/stream");
        assert_eq!(config.auth.mode, AuthMode::NotRequired);
        assert_eq!(config.batch, BatchPolicy::default());
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.pong_grace, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.session_id, None);
    }

    #[test_timeout::timeout]
    fn overrides_are_parsed() {
        let config = from_pairs(&[
            (ENV_SERVER, "sessions.example.com/base/"),
            (ENV_SESSION, " abc "),
            (ENV_AUTH, "Bearer"),
            (ENV_CHAR_THRESHOLD, "40"),
            (ENV_TIME_THRESHOLD_MS, "750"),
            (ENV_MAX_ATTEMPTS, "3"),
        ])
        .expect("config");
        assert_eq!(config.server.as_str(), "https://sessions.example.com/base");
        assert_eq!(
            config.stream_url().as_str(),
            "wss://sessions.example.com/base/api/stream"
        );
        assert_eq!(config.session_id.as_deref(), Some("abc"));
        assert_eq!(config.auth.mode, AuthMode::Bearer);
        assert_eq!(config.batch.char_threshold, 40);
        assert_eq!(config.batch.time_threshold, Duration::from_millis(750));
        assert_eq!(config.session_options().max_attempts, 3);
    }

    #[test_timeout::timeout]
    fn bad_values_name_the_variable() {
        let err = from_pairs(&[(ENV_PONG_GRACE_SECS, "soon")]).expect_err("invalid");
        assert!(err.to_string().contains(ENV_PONG_GRACE_SECS));
        assert!(matches!(
            from_pairs(&[(ENV_AUTH, "maybe")]),
            Err(ConfigError::InvalidValue { var: ENV_AUTH, .. })
        ));
        for var in [
            ENV_TICK_MS,
            ENV_PING_INTERVAL_SECS,
            ENV_PONG_GRACE_SECS,
            ENV_REQUEST_TIMEOUT_SECS,
        ] {
            assert!(
                matches!(
                    from_pairs(&[(var, "0")]),
                    Err(ConfigError::InvalidValue { var: named, expected: "a positive integer", .. }) if named == var
                ),
                "{var} accepted zero"
            );
        }
        assert_eq!(
            from_pairs(&[(ENV_TIME_THRESHOLD_MS, "0")])
                .expect("config")
                .batch
                .time_threshold,
            Duration::ZERO
        );
    }

    #[test_timeout::timeout]
    fn localhost_is_pinned_to_ipv4() {
        let url = normalize_server(ENV_SERVER, "ws://localhost:9000").expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/");
    }

    #[test_timeout::timeout]
    fn reads_the_process_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var(ENV_SESSION).ok();

        unsafe {
            env::set_var(ENV_SESSION, "from-env");
        }
        let config = NarratorConfig::from_env().expect("config");
        assert_eq!(config.session_id.as_deref(), Some("from-env"));

        unsafe {
            match original {
                Some(value) => env::set_var(ENV_SESSION, value),
                None => env::remove_var(ENV_SESSION),
            }
        }
    }
}
