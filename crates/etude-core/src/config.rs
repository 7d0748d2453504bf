use crate::error::{EtudeError, EtudeResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind (default: 0.0.0.0)
    pub host: String,

    /// Port to listen on (default: 8080)
    pub port: u16,

    /// Directory files are served from (default: ./www)
    pub doc_root: PathBuf,

    /// Worker threads (default: one per CPU)
    pub workers: usize,

    /// Requests that may wait in the worker queue at once (default: 10000)
    pub max_requests: usize,

    /// Simultaneously open client connections (default: 65535)
    pub max_connections: usize,

    /// Readiness events fetched per `epoll_wait` (default: 10000)
    pub max_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("./www"),
            workers: num_cpus::get(),
            max_requests: 10_000,
            max_connections: 65_535,
            max_events: 10_000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `ETUDE_*` environment variables (with .env support).
    ///
    /// Unset variables keep their defaults; a set but unparsable value is an error.
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Ok(Self {
            host: std::env::var("ETUDE_HOST").unwrap_or(defaults.host),
            port: env_or("ETUDE_PORT", defaults.port)?,
            doc_root: std::env::var("ETUDE_DOC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.doc_root),
            workers: env_or("ETUDE_WORKERS", defaults.workers)?,
            max_requests: env_or("ETUDE_MAX_REQUESTS", defaults.max_requests)?,
            max_connections: env_or("ETUDE_MAX_CONNECTIONS", defaults.max_connections)?,
            max_events: env_or("ETUDE_MAX_EVENTS", defaults.max_events)?,
        })
    }

    /// Reject sizes the server cannot run with.
    pub fn validate(&self) -> EtudeResult<()> {
        let sizes = [
            ("workers", self.workers),
            ("max_requests", self.max_requests),
            ("max_connections", self.max_connections),
            ("max_events", self.max_events),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(EtudeError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> EtudeResult<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EtudeError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}
