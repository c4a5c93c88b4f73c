/// Server Configuration
///
/// All settings come from environment variables with defaults, following the
/// same `VAR -> default` pattern as the transport selection in `main.rs`.
/// `from_lookup` takes any key lookup so tests can feed a map instead of the
/// process environment.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::ConfigError;
use crate::core::origin::OriginPolicy;
use crate::core::session::{DEFAULT_SESSION_TIMEOUT, SinkOptions};

/// Which transports to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Http,
    Both,
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "both" => Ok(Self::Both),
            other => Err(ConfigError::TransportMode(other.to_string())),
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name as reported in MCP initialize responses
    pub name: String,
    /// Server version string as reported in MCP initialize responses
    pub version: String,
    pub transport: TransportMode,
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub origin_policy: OriginPolicy,
    pub sse: SinkOptions,
    pub resource_scheme: String,
    /// Cap on one HTTP POST body and on one stdio line.
    pub max_body_bytes: usize,
    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let workers = match lookup("WORKER_THREADS") {
            Some(raw) => parse("WORKER_THREADS", &raw)?,
            // CPU count capped at 16 to avoid excessive context switching
            None => num_cpus::get().clamp(1, 16),
        };

        let allowed_origins = get("MCP_ALLOWED_ORIGINS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            name: get("SERVER_NAME", "mcp-engine"),
            version: get("SERVER_VERSION", env!("CARGO_PKG_VERSION")),
            transport: get("MCP_TRANSPORT_MODE", "both").parse()?,
            host: get("HOST", "0.0.0.0"),
            port: parse("PORT", &get("PORT", "3000"))?,
            workers,
            session_timeout: seconds(
                "MCP_SESSION_TIMEOUT_SECS",
                &get(
                    "MCP_SESSION_TIMEOUT_SECS",
                    &DEFAULT_SESSION_TIMEOUT.as_secs().to_string(),
                ),
            )?,
            sweep_interval: seconds(
                "MCP_SWEEP_INTERVAL_SECS",
                &get("MCP_SWEEP_INTERVAL_SECS", "60"),
            )?,
            origin_policy: OriginPolicy {
                validate_origins: flag("MCP_VALIDATE_ORIGINS", &get("MCP_VALIDATE_ORIGINS", "true"))?,
                allow_localhost: flag("MCP_ALLOW_LOCALHOST", &get("MCP_ALLOW_LOCALHOST", "true"))?,
                allowed_origins,
            },
            sse: SinkOptions {
                capacity: parse("MCP_SSE_BUFFER", &get("MCP_SSE_BUFFER", "64"))?,
                send_timeout: seconds(
                    "MCP_SSE_SEND_TIMEOUT_SECS",
                    &get("MCP_SSE_SEND_TIMEOUT_SECS", "5"),
                )?,
                keep_alive: seconds(
                    "MCP_SSE_KEEPALIVE_SECS",
                    &get("MCP_SSE_KEEPALIVE_SECS", "15"),
                )?,
            },
            resource_scheme: get("MCP_RESOURCE_SCHEME", "mcp"),
            max_body_bytes: parse("MCP_MAX_BODY_BYTES", &get("MCP_MAX_BODY_BYTES", "1048576"))?,
            json_logs: get("MCP_LOG_FORMAT", "text") == "json",
        })
    }

    /// Load from a plain map (tests, embedding).
    pub fn from_map(vars: &HashMap<&str, &str>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn seconds(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse(key, raw)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        let cfg = ServerConfig::from_map(&HashMap::new()).expect("config");
        assert_eq!(cfg.name, "mcp-engine");
        assert_eq!(cfg.transport, TransportMode::Both);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:3000");
        assert_eq!(cfg.session_timeout, Duration::from_secs(1800));
        assert!(cfg.origin_policy.validate_origins);
        assert!(cfg.origin_policy.allow_localhost);
        assert!(cfg.origin_policy.allowed_origins.is_empty());
        assert_eq!(cfg.resource_scheme, "mcp");
        assert!((1..=16).contains(&cfg.workers));
    }

    #[test]
    fn reads_overrides_and_origin_list() {
        let vars = HashMap::from([
            ("MCP_TRANSPORT_MODE", "http"),
            ("PORT", "8080"),
            ("MCP_VALIDATE_ORIGINS", "false"),
            ("MCP_ALLOWED_ORIGINS", "https://a.example.com, https://b.example.*"),
            ("MCP_SESSION_TIMEOUT_SECS", "90"),
            ("WORKER_THREADS", "2"),
        ]);
        let cfg = ServerConfig::from_map(&vars).expect("config");
        assert_eq!(cfg.transport, TransportMode::Http);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.workers, 2);
        assert!(!cfg.origin_policy.validate_origins);
        assert_eq!(
            cfg.origin_policy.allowed_origins,
            vec!["https://a.example.com", "https://b.example.*"]
        );
        assert_eq!(cfg.session_timeout, Duration::from_secs(90));
    }

    #[test]
    fn rejects_malformed_values() {
        for (key, value) in [
            ("PORT", "http"),
            ("MCP_TRANSPORT_MODE", "carrier-pigeon"),
            ("MCP_VALIDATE_ORIGINS", "maybe"),
            ("MCP_SWEEP_INTERVAL_SECS", "0"),
        ] {
            let vars = HashMap::from([(key, value)]);
            assert!(ServerConfig::from_map(&vars).is_err(), "{key}={value}");
        }
    }
}
