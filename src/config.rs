use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::model::Minutes;

/// Process configuration, read once from `TURNERO_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub persist_timeout: Duration,
    pub default_slot_minutes: Option<Minutes>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            persist_timeout: Duration::from_millis(2000),
            default_slot_minutes: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unparseable values fall back to the
    /// default, with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| -> Option<String> {
            lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        };
        fn number<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("ignoring {name}={raw:?}: not a valid number");
                    None
                }
            }
        }

        Self {
            bind: parsed("TURNERO_BIND").unwrap_or(defaults.bind),
            port: number("TURNERO_PORT", parsed("TURNERO_PORT")).unwrap_or(defaults.port),
            data_dir: parsed("TURNERO_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: number("TURNERO_MAX_CONNECTIONS", parsed("TURNERO_MAX_CONNECTIONS"))
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: number("TURNERO_COMPACT_THRESHOLD", parsed("TURNERO_COMPACT_THRESHOLD"))
                .unwrap_or(defaults.compact_threshold),
            metrics_port: number("TURNERO_METRICS_PORT", parsed("TURNERO_METRICS_PORT")),
            persist_timeout: number("TURNERO_PERSIST_TIMEOUT_MS", parsed("TURNERO_PERSIST_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.persist_timeout),
            default_slot_minutes: number(
                "TURNERO_DEFAULT_SLOT_MINUTES",
                parsed("TURNERO_DEFAULT_SLOT_MINUTES"),
            )
            .filter(|m| *m > 0),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("turnero.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            persist_timeout: self.persist_timeout,
            default_slot_minutes: self.default_slot_minutes,
        }
    }
}
