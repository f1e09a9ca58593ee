use std::str::FromStr;
use std::time::Duration;

use dispatch_queue::QueueConfig;

/// Configuration errors raised at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

/// Socket protocol and background loop settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Connections with no client message for this long are closed.
    pub idle_timeout: Duration,
    /// Transport ping and idle sweep period.
    pub heartbeat_interval: Duration,
    /// Consecutive malformed messages that force a disconnect.
    pub max_malformed: u32,
    /// Emergencies one reporter may raise per window.
    pub emergency_rate_limit: u64,
    pub emergency_rate_window: Duration,
    /// How often waiting jobs are (re)offered.
    pub offer_loop_interval: Duration,
    pub reaper_interval: Duration,
    /// Archive retry and queue cleanup period.
    pub cleanup_interval: Duration,
    /// Rolling window for error rate and latency.
    pub metrics_window: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            max_malformed: 5,
            emergency_rate_limit: 5,
            emergency_rate_window: Duration::from_secs(60),
            offer_loop_interval: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(60),
            metrics_window: Duration::from_secs(300),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Postgres archive; the in-memory archive is used when unset.
    pub database_url: Option<String>,
    /// Shared state store; the in-memory store is used when unset.
    pub redis_url: Option<String>,
    /// Bearer token guarding `/api/v1`. Open when unset.
    pub admin_api_token: Option<String>,
    /// Identifies this process in relay frames.
    pub node_id: String,
    pub relay_enabled: bool,
    pub log_format: LogFormat,
    pub dispatch: DispatchConfig,
    pub queue: QueueConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".into()],
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            database_url: None,
            redis_url: None,
            admin_api_token: None,
            node_id: uuid::Uuid::new_v4().to_string(),
            relay_enabled: true,
            log_format: LogFormat::Text,
            dispatch: DispatchConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                 |
    /// |--------------------------------|-------------------------|
    /// | `HOST`                         | `0.0.0.0`               |
    /// | `PORT`                         | `3000`                  |
    /// | `CORS_ORIGINS`                 | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`         | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`        | `30`                    |
    /// | `DATABASE_URL`                 | unset (memory archive)  |
    /// | `REDIS_URL`                    | unset (memory store)    |
    /// | `ADMIN_API_TOKEN`              | unset (open)            |
    /// | `NODE_ID`                      | random UUID             |
    /// | `RELAY_ENABLED`                | `true`                  |
    /// | `LOG_FORMAT`                   | `text`                  |
    /// | `WS_IDLE_TIMEOUT_SECS`         | `300`                   |
    /// | `WS_HEARTBEAT_INTERVAL_SECS`   | `30`                    |
    /// | `WS_MAX_MALFORMED`             | `5`                     |
    /// | `EMERGENCY_RATE_LIMIT`         | `5`                     |
    /// | `EMERGENCY_RATE_WINDOW_SECS`   | `60`                    |
    /// | `OFFER_LOOP_INTERVAL_SECS`     | `5`                     |
    /// | `REAPER_INTERVAL_SECS`         | `15`                    |
    /// | `CLEANUP_INTERVAL_SECS`        | `60`                    |
    /// | `METRICS_WINDOW_SECS`          | `300`                   |
    /// | `QUEUE_MAX_RETRIES`            | `3`                     |
    /// | `QUEUE_HEARTBEAT_TIMEOUT_SECS` | `120`                   |
    /// | `QUEUE_OFFER_INTERVAL_SECS`    | `30`                    |
    /// | `QUEUE_CLEANUP_GRACE_SECS`     | `3600`                  |
    /// | `QUEUE_RECORD_TTL_SECS`        | `86400`                 |
    /// | `QUEUE_LOCK_TTL_SECS`          | `5`                     |
    /// | `QUEUE_MAX_PENDING`            | `10000`                 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = ServerConfig::default();
        let dispatch_defaults = DispatchConfig::default();
        let queue_defaults = QueueConfig::default();

        let cors_origins = match env.get("CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.cors_origins,
        };

        let dispatch = DispatchConfig {
            idle_timeout: env.secs("WS_IDLE_TIMEOUT_SECS", dispatch_defaults.idle_timeout)?,
            heartbeat_interval: env.secs(
                "WS_HEARTBEAT_INTERVAL_SECS",
                dispatch_defaults.heartbeat_interval,
            )?,
            max_malformed: env.parse("WS_MAX_MALFORMED", dispatch_defaults.max_malformed)?,
            emergency_rate_limit: env.parse(
                "EMERGENCY_RATE_LIMIT",
                dispatch_defaults.emergency_rate_limit,
            )?,
            emergency_rate_window: env.secs(
                "EMERGENCY_RATE_WINDOW_SECS",
                dispatch_defaults.emergency_rate_window,
            )?,
            offer_loop_interval: env.secs(
                "OFFER_LOOP_INTERVAL_SECS",
                dispatch_defaults.offer_loop_interval,
            )?,
            reaper_interval: env.secs("REAPER_INTERVAL_SECS", dispatch_defaults.reaper_interval)?,
            cleanup_interval: env.secs(
                "CLEANUP_INTERVAL_SECS",
                dispatch_defaults.cleanup_interval,
            )?,
            metrics_window: env.secs("METRICS_WINDOW_SECS", dispatch_defaults.metrics_window)?,
        };

        let queue = QueueConfig {
            max_retries: env.parse("QUEUE_MAX_RETRIES", queue_defaults.max_retries)?,
            heartbeat_timeout: env.secs(
                "QUEUE_HEARTBEAT_TIMEOUT_SECS",
                queue_defaults.heartbeat_timeout,
            )?,
            offer_interval: env.secs("QUEUE_OFFER_INTERVAL_SECS", queue_defaults.offer_interval)?,
            cleanup_grace: env.secs("QUEUE_CLEANUP_GRACE_SECS", queue_defaults.cleanup_grace)?,
            record_ttl: env.secs("QUEUE_RECORD_TTL_SECS", queue_defaults.record_ttl)?,
            lock_ttl: env.secs("QUEUE_LOCK_TTL_SECS", queue_defaults.lock_ttl)?,
            max_pending: env.parse("QUEUE_MAX_PENDING", queue_defaults.max_pending)?,
        };

        if dispatch.max_malformed == 0 {
            return Err(ConfigError::Invalid {
                var: "WS_MAX_MALFORMED",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            host: env.get("HOST").unwrap_or(defaults.host),
            port: env.parse("PORT", defaults.port)?,
            cors_origins,
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            shutdown_timeout_secs: env.parse(
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout_secs,
            )?,
            database_url: env.get("DATABASE_URL"),
            redis_url: env.get("REDIS_URL"),
            admin_api_token: env.get("ADMIN_API_TOKEN"),
            node_id: env.get("NODE_ID").unwrap_or(defaults.node_id),
            relay_enabled: env.parse("RELAY_ENABLED", defaults.relay_enabled)?,
            log_format: env.parse("LOG_FORMAT", defaults.log_format)?,
            dispatch,
            queue,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `var`.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());
        assert_eq!(config.queue.cleanup_grace, Duration::from_secs(3600));
        assert_eq!(config.dispatch.max_malformed, 5);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("CORS_ORIGINS", "https://a.example, https://b.example"),
            ("QUEUE_CLEANUP_GRACE_SECS", "120"),
            ("WS_IDLE_TIMEOUT_SECS", "45"),
            ("LOG_FORMAT", "json"),
            ("RELAY_ENABLED", "false"),
            ("NODE_ID", "node-7"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.cors_origins.len(), 2);
        assert_eq!(config.queue.cleanup_grace, Duration::from_secs(120));
        assert_eq!(config.dispatch.idle_timeout, Duration::from_secs(45));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(!config.relay_enabled);
        assert_eq!(config.node_id, "node-7");
    }

    #[test]
    fn invalid_values_are_reported() {
        assert_matches!(
            config_from(&[("PORT", "not-a-port")]),
            Err(ConfigError::Invalid { var: "PORT", .. })
        );
        assert_matches!(
            config_from(&[("WS_MAX_MALFORMED", "0")]),
            Err(ConfigError::Invalid { var: "WS_MAX_MALFORMED", .. })
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config_from(&[("REDIS_URL", "  "), ("PORT", "")]).unwrap();
        assert!(config.redis_url.is_none());
        assert_eq!(config.port, 3000);
    }
}
