// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment at startup. Every numeric
//! bound of the ledger is configurable.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding `ledger.redb` | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `JWT_SECRET` | HS256 secret for bearer tokens | Required for production |
//! | `JWT_ISSUER` | Expected JWT issuer claim | Optional |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `LEDGER_MAX_RETRIES` | Commit attempts before `rejected:contention` | `5` |
//! | `LEDGER_RETRY_BACKOFF_MS` | Base delay between commit attempts | `5` |
//! | `LEDGER_STORAGE_TIMEOUT_MS` | Upper bound on one storage call | `2000` |
//! | `LEDGER_INFLIGHT_WAIT_MS` | Wait for an in-flight duplicate | `3000` |
//! | `LEDGER_INFLIGHT_POLL_MS` | Poll interval while waiting | `25` |
//! | `LEDGER_STALE_PENDING_SECS` | Age at which a pending operation is reclaimed | `60` |
//! | `LEDGER_CACHE_CAPACITY` | Balance cache entries | `10000` |
//! | `LEDGER_CACHE_TTL_SECS` | Balance cache TTL | `30` |
//! | `LEDGER_RETENTION_DAYS` | Age at which finished operations are archived | `30` |
//! | `LEDGER_REAPER_INTERVAL_SECS` | Archival sweep interval | `3600` |
//! | `LEDGER_EVENT_BUFFER` | Event channel capacity | `1024` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::ledger::{EngineConfig, GuardConfig};

/// Environment variable name for the data directory path.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";

/// HS256 secret. When unset, tokens are decoded without signature
/// verification (development mode).
pub const JWT_SECRET_ENV: &str = "JWT_SECRET";
pub const JWT_ISSUER_ENV: &str = "JWT_ISSUER";

pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const MAX_RETRIES_ENV: &str = "LEDGER_MAX_RETRIES";
pub const RETRY_BACKOFF_MS_ENV: &str = "LEDGER_RETRY_BACKOFF_MS";
pub const STORAGE_TIMEOUT_MS_ENV: &str = "LEDGER_STORAGE_TIMEOUT_MS";
pub const INFLIGHT_WAIT_MS_ENV: &str = "LEDGER_INFLIGHT_WAIT_MS";
pub const INFLIGHT_POLL_MS_ENV: &str = "LEDGER_INFLIGHT_POLL_MS";
pub const STALE_PENDING_SECS_ENV: &str = "LEDGER_STALE_PENDING_SECS";
pub const CACHE_CAPACITY_ENV: &str = "LEDGER_CACHE_CAPACITY";
pub const CACHE_TTL_SECS_ENV: &str = "LEDGER_CACHE_TTL_SECS";
pub const RETENTION_DAYS_ENV: &str = "LEDGER_RETENTION_DAYS";
pub const REAPER_INTERVAL_SECS_ENV: &str = "LEDGER_REAPER_INTERVAL_SECS";
pub const EVENT_BUFFER_ENV: &str = "LEDGER_EVENT_BUFFER";

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

/// Name of the database file inside `DATA_DIR`.
pub const DATABASE_FILE: &str = "ledger.redb";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a valid {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    pub log_format: LogFormat,
    pub engine: EngineConfig,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub retention: Duration,
    pub reaper_interval: Duration,
    pub event_buffer: usize,
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let log_format = match var(LOG_FORMAT_ENV).as_deref() {
            Some("json") => LogFormat::Json,
            Some("pretty") | None => LogFormat::Pretty,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: LOG_FORMAT_ENV,
                    expected: "log format (json|pretty)",
                    value: other.to_string(),
                })
            }
        };

        let engine = EngineConfig {
            max_retries: parse(&var, MAX_RETRIES_ENV, 5)?,
            retry_backoff: Duration::from_millis(parse(&var, RETRY_BACKOFF_MS_ENV, 5)?),
            storage_timeout: Duration::from_millis(parse(&var, STORAGE_TIMEOUT_MS_ENV, 2000)?),
            guard: GuardConfig {
                wait_timeout: Duration::from_millis(parse(&var, INFLIGHT_WAIT_MS_ENV, 3000)?),
                poll_interval: Duration::from_millis(parse(&var, INFLIGHT_POLL_MS_ENV, 25)?),
                stale_after: Duration::from_secs(parse(&var, STALE_PENDING_SECS_ENV, 60)?),
            },
        };

        let retention_days: u64 = parse(&var, RETENTION_DAYS_ENV, 30)?;

        Ok(Self {
            data_dir: PathBuf::from(var(DATA_DIR_ENV).unwrap_or_else(|| "/data".to_string())),
            host: var(HOST_ENV).unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(&var, PORT_ENV, 8080)?,
            jwt_secret: var(JWT_SECRET_ENV),
            jwt_issuer: var(JWT_ISSUER_ENV),
            log_format,
            engine,
            cache_capacity: parse(&var, CACHE_CAPACITY_ENV, 10_000)?,
            cache_ttl: Duration::from_secs(parse(&var, CACHE_TTL_SECS_ENV, 30)?),
            retention: Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)),
            reaper_interval: Duration::from_secs(parse(&var, REAPER_INTERVAL_SECS_ENV, 3600)?),
            event_buffer: parse(&var, EVENT_BUFFER_ENV, 1024)?,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: std::any::type_name::<T>(),
            value,
        }),
    }
}
