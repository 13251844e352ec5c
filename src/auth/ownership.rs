// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ownership enforcement for ledger accounts.
//!
//! Every ledger call passes the caller through one of these checks before
//! touching storage.

use crate::ledger::{Account, AccountRef, LedgerError, LedgerResult};

use super::{AuthenticatedUser, Role};

/// Trait for resources that have an owner.
pub trait OwnedResource {
    /// Get the owner's user ID.
    fn owner_user_id(&self) -> &str;
}

impl OwnedResource for AccountRef {
    fn owner_user_id(&self) -> &str {
        &self.owner
    }
}

impl OwnedResource for Account {
    fn owner_user_id(&self) -> &str {
        &self.owner
    }
}

/// Kind of access requested on an owned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Move funds out of the account: owner or admin.
    Spend,
    /// Read balance or history: owner, admin or auditor.
    Read,
}

/// Trait for enforcing ownership on ledger operations.
pub trait OwnershipEnforcer {
    /// # Errors
    /// Returns `LedgerError::Forbidden` if the user may not access the resource.
    fn verify_access(&self, user: &AuthenticatedUser, access: Access) -> LedgerResult<()>;
}

impl<T: OwnedResource> OwnershipEnforcer for T {
    fn verify_access(&self, user: &AuthenticatedUser, access: Access) -> LedgerResult<()> {
        let allowed = self.owner_user_id() == user.user_id
            || match access {
                Access::Spend => user.is_admin(),
                Access::Read => user.role.reads_all_accounts(),
            };
        if allowed {
            Ok(())
        } else {
            Err(LedgerError::Forbidden(format!(
                "user {} may not access account of {}",
                user.user_id,
                self.owner_user_id()
            )))
        }
    }
}

/// Require admin privileges for `action`.
pub fn require_admin(user: &AuthenticatedUser, action: &str) -> LedgerResult<()> {
    if user.role.has_privilege(Role::Admin) {
        Ok(())
    } else {
        Err(LedgerError::Forbidden(format!("{action} requires admin")))
    }
}
