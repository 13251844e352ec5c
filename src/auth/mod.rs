// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Bearer JWT authentication and the ownership rules the ledger enforces.
//!
//! ## Auth Flow
//!
//! 1. Client sends `Authorization: Bearer <JWT>`
//! 2. Server verifies the HS256 signature, expiry and issuer
//! 3. Extracts:
//!    - `sub` → canonical `user_id` (owner id of the user's accounts)
//!    - `role` → `admin`, `client` or `auditor`
//!
//! ## Security
//!
//! - All non-health endpoints require authentication
//! - Without `JWT_SECRET` the server runs in development mode and does not
//!   verify signatures
//! - Clock skew tolerance is 60 seconds

pub mod claims;
pub mod error;
pub mod extractor;
pub mod ownership;
pub mod roles;

pub use claims::AuthenticatedUser;
pub use error::AuthError;
pub use extractor::{AdminOnly, Auth, AuthConfig};
pub use roles::Role;
