// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Foxya Ledger - Coin Ledger Service
//!
//! Per-user, per-currency balances changed only through idempotent credit,
//! debit and transfer operations. Every change is an immutable posting
//! committed atomically with the balance it produces.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Authentication and authorization (HS256 JWT)
//! - `ledger` - Operation engine, idempotency guard, balance cache, events
//! - `storage` - Transactional store (redb)

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod state;
pub mod storage;
