//! Application state and configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tally_core::{AggregatorConfig, FlushMode, WindowStore};

/// Which window store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Shared Redis sets.
    Redis,
    /// Process-local sets (single instance only).
    Memory,
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080").
    pub bind_addr: String,

    /// Window store backend.
    pub store: StoreKind,

    /// Redis host.
    pub redis_host: String,

    /// Redis port.
    pub redis_port: u16,

    /// RabbitMQ host.
    pub rabbit_host: String,

    /// RabbitMQ port.
    pub rabbit_port: u16,

    /// Durable queue receiving flushed counts.
    pub rabbit_queue: String,

    /// Flush loop settings.
    pub aggregator: AggregatorConfig,

    /// Per-request timeout for callback notifications.
    pub notify_timeout: Duration,

    /// Prometheus metrics port (0 disables).
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `TALLY_BIND_ADDR`: Server bind address (default: "0.0.0.0:8080")
    /// - `TALLY_STORE`: `redis` or `memory` (default: "redis")
    /// - `REDIS_HOST` / `REDIS_PORT`: Counting store (default: "redis" / 6379)
    /// - `RABBIT_HOST` / `RABBIT_PORT`: Queue broker (default: "rabbitmq" / 5672)
    /// - `RABBIT_QUEUE`: Queue name (default: "counts_queue")
    /// - `TALLY_FLUSH_INTERVAL_SECS`: Flush period (default: 60)
    /// - `TALLY_FLUSH_MODE`: `read-then-clear` or `atomic` (default: "read-then-clear")
    /// - `TALLY_CLEAR_ON_READ_FAILURE`: Clear even if the read failed (default: false)
    /// - `TALLY_NOTIFY_TIMEOUT_SECS`: Callback timeout (default: 5)
    /// - `TALLY_METRICS_PORT`: Prometheus port, 0 disables (default: 0)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind_addr = var("TALLY_BIND_ADDR", "0.0.0.0:8080");

        let store = match var("TALLY_STORE", "redis").trim().to_ascii_lowercase().as_str() {
            "redis" => StoreKind::Redis,
            "memory" => StoreKind::Memory,
            other => anyhow::bail!("TALLY_STORE must be 'redis' or 'memory', got '{other}'"),
        };

        let redis_host = var("REDIS_HOST", "redis");
        let redis_port = parse(&var("REDIS_PORT", "6379"), "REDIS_PORT")?;

        let rabbit_host = var("RABBIT_HOST", "rabbitmq");
        let rabbit_port = parse(&var("RABBIT_PORT", "5672"), "RABBIT_PORT")?;
        let rabbit_queue = var("RABBIT_QUEUE", "counts_queue");

        let flush_secs: u64 = parse(
            &var("TALLY_FLUSH_INTERVAL_SECS", "60"),
            "TALLY_FLUSH_INTERVAL_SECS",
        )?;
        if flush_secs == 0 {
            anyhow::bail!("TALLY_FLUSH_INTERVAL_SECS must be greater than zero");
        }

        let flush_mode: FlushMode = var("TALLY_FLUSH_MODE", "read-then-clear").parse()?;
        let clear_on_read_failure = parse(
            &var("TALLY_CLEAR_ON_READ_FAILURE", "false"),
            "TALLY_CLEAR_ON_READ_FAILURE",
        )?;

        let notify_secs: u64 = parse(
            &var("TALLY_NOTIFY_TIMEOUT_SECS", "5"),
            "TALLY_NOTIFY_TIMEOUT_SECS",
        )?;
        let metrics_port = parse(&var("TALLY_METRICS_PORT", "0"), "TALLY_METRICS_PORT")?;

        let config = Self {
            bind_addr,
            store,
            redis_host,
            redis_port,
            rabbit_host,
            rabbit_port,
            rabbit_queue,
            aggregator: AggregatorConfig {
                flush_interval: Duration::from_secs(flush_secs),
                flush_mode,
                clear_on_read_failure,
            },
            notify_timeout: Duration::from_secs(notify_secs),
            metrics_port,
        };

        tracing::info!(
            bind_addr = %config.bind_addr,
            store = ?config.store,
            redis = %format!("{}:{}", config.redis_host, config.redis_port),
            rabbit = %format!("{}:{}", config.rabbit_host, config.rabbit_port),
            queue = %config.rabbit_queue,
            flush_secs,
            flush_mode = %flush_mode,
            clear_on_read_failure,
            "configuration loaded"
        );

        Ok(config)
    }
}

fn parse<T>(value: &str, key: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} has invalid value '{value}'"))
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Current window's sets.
    pub store: Arc<dyn WindowStore>,
}

impl AppState {
    /// Create application state around an already-constructed store.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self { store }
    }
}
