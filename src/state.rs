// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::AuthConfig;
use crate::config::LedgerConfig;
use crate::ledger::{BroadcastPublisher, LedgerEngine, LruBalanceCache};
use crate::storage::{RedbLedgerStore, StoreResult};

/// The ledger as wired in production.
pub type Ledger = LedgerEngine<RedbLedgerStore, LruBalanceCache, BroadcastPublisher>;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    /// Event fan-out shared with the engine; subscribe for audit/notification.
    pub events: BroadcastPublisher,
    pub auth_config: AuthConfig,
    /// Directory holding the database, reported by `/health`.
    pub data_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(ledger: Ledger, events: BroadcastPublisher) -> Self {
        Self {
            ledger,
            events,
            auth_config: AuthConfig::default(),
            data_dir: None,
        }
    }

    pub fn with_auth_config(mut self, auth_config: AuthConfig) -> Self {
        self.auth_config = auth_config;
        self
    }

    /// Open the store under `config.data_dir` and wire the engine.
    pub fn from_config(config: &LedgerConfig) -> StoreResult<Self> {
        let store = RedbLedgerStore::open(&config.database_path())?;
        let cache = LruBalanceCache::new(config.cache_capacity, config.cache_ttl);
        let events = BroadcastPublisher::new(config.event_buffer);
        let ledger = LedgerEngine::new(
            Arc::new(store),
            Arc::new(cache),
            Arc::new(events.clone()),
            config.engine.clone(),
        );
        let auth_config = AuthConfig::from_config(config);
        let mut state = Self::new(ledger, events).with_auth_config(auth_config);
        state.data_dir = Some(config.data_dir.clone());
        Ok(state)
    }
}

#[cfg(test)]
impl AppState {
    /// State over a fresh on-disk database in a temp directory.
    pub fn temporary() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = LedgerConfig::from_lookup(|name| match name {
            crate::config::DATA_DIR_ENV => Some(dir.path().display().to_string()),
            _ => None,
        })
        .expect("default config");
        let state = Self::from_config(&config).expect("Failed to open ledger");
        (state, dir)
    }
}
