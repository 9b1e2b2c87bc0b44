//! Per-account scan allowance.
//!
//! Verified accounts are unlimited. Guest accounts carry a counter that is
//! checked and decremented in one atomic step, so concurrent submissions
//! for the same guest can never both pass against a stale count.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Account, AccountId, QuotaView, Remaining};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    QuotaExhausted,
    UnknownAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied(DenyReason),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allowed)
    }
}

#[derive(Debug)]
struct AccountEntry {
    id: AccountId,
    is_guest: bool,
    remaining: AtomicU32,
    created_at: DateTime<Utc>,
}

impl AccountEntry {
    fn snapshot(&self) -> Account {
        Account {
            id: self.id,
            is_guest: self.is_guest,
            scan_quota_remaining: self.remaining.load(Ordering::Acquire),
            created_at: self.created_at,
        }
    }
}

pub struct QuotaLedger {
    accounts: RwLock<HashMap<AccountId, Arc<AccountEntry>>>,
    guest_limit: u32,
}

impl QuotaLedger {
    pub fn new(guest_limit: u32) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            guest_limit,
        }
    }

    pub fn guest_limit(&self) -> u32 {
        self.guest_limit
    }

    /// Register a guest with the configured starting allowance.
    pub fn register_guest(&self) -> Account {
        self.insert(true, self.guest_limit)
    }

    pub fn register_verified(&self) -> Account {
        self.insert(false, 0)
    }

    /// Register a guest with an explicit allowance.
    pub fn register_guest_with_quota(&self, quota: u32) -> Account {
        self.insert(true, quota)
    }

    fn insert(&self, is_guest: bool, quota: u32) -> Account {
        let entry = Arc::new(AccountEntry {
            id: Uuid::new_v4(),
            is_guest,
            remaining: AtomicU32::new(quota),
            created_at: Utc::now(),
        });
        let account = entry.snapshot();
        self.accounts.write().insert(entry.id, entry);
        info!(account_id = %account.id, is_guest, quota, "Registered account");
        account
    }

    fn entry(&self, id: &AccountId) -> Option<Arc<AccountEntry>> {
        self.accounts.read().get(id).cloned()
    }

    pub fn account(&self, id: &AccountId) -> Option<Account> {
        self.entry(id).map(|e| e.snapshot())
    }

    /// Charge one scan against the account if it has allowance left.
    pub fn authorize(&self, id: &AccountId) -> Authorization {
        let Some(entry) = self.entry(id) else {
            return Authorization::Denied(DenyReason::UnknownAccount);
        };
        if !entry.is_guest {
            return Authorization::Allowed;
        }

        match entry
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => {
                debug!(account_id = %id, remaining = previous - 1, "Scan authorized");
                Authorization::Allowed
            }
            Err(_) => {
                debug!(account_id = %id, "Guest quota exhausted");
                Authorization::Denied(DenyReason::QuotaExhausted)
            }
        }
    }

    /// Return a charge taken by `authorize` for a scan that never started.
    pub fn release(&self, id: &AccountId) {
        if let Some(entry) = self.entry(id) {
            if entry.is_guest {
                entry.remaining.fetch_add(1, Ordering::AcqRel);
                debug!(account_id = %id, "Scan charge released");
            }
        }
    }

    pub fn view(&self, id: &AccountId) -> Option<QuotaView> {
        self.entry(id).map(|entry| QuotaView {
            is_guest: entry.is_guest,
            remaining: if entry.is_guest {
                Remaining::Limited(entry.remaining.load(Ordering::Acquire))
            } else {
                Remaining::Unlimited
            },
        })
    }
}
