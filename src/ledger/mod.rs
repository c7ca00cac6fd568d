//! Credit ledger.
//!
//! Owns account balances and the audit log of every balance change. All
//! mutating operations stage their writes into a [`WriteBatch`]; nothing
//! changes here until the coordinator has persisted the batch and calls
//! [`Ledger::apply`].
//!
//! # Invariants
//!
//! - Balances are [`Credits`], which cannot represent a negative amount.
//! - A debit or transfer never stages anything when it fails.
//! - Every staged balance change is paired with a [`LedgerEntry`] carrying
//!   the signed delta and the resulting balance.

pub mod credits;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Snapshot, WriteBatch};

pub use credits::Credits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub display_name: String,
    pub balance: Credits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: &str, balance: Credits, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            display_name: format!("User-{}", id),
            balance,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Starting balance granted on first touch.
    Open,
    Debit,
    Credit,
    TransferOut,
    TransferIn,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Open => write!(f, "open"),
            EntryKind::Debit => write!(f, "debit"),
            EntryKind::Credit => write!(f, "credit"),
            EntryKind::TransferOut => write!(f, "transfer_out"),
            EntryKind::TransferIn => write!(f, "transfer_in"),
        }
    }
}

/// Audit record for one balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account_id: String,
    pub kind: EntryKind,
    /// Signed change in micro-credits.
    pub delta_micros: i64,
    pub balance_after: Credits,
    /// Job id or counterparty account, when there is one.
    pub reference: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Ledger {
    accounts: HashMap<String, Account>,
    entries: Vec<LedgerEntry>,
    starting_balance: Credits,
}

impl Ledger {
    pub fn new(starting_balance: Credits) -> Self {
        Self {
            accounts: HashMap::new(),
            entries: Vec::new(),
            starting_balance,
        }
    }

    pub fn from_snapshot(snapshot: &Snapshot, starting_balance: Credits) -> Self {
        Self {
            accounts: snapshot
                .accounts
                .values()
                .map(|a| (a.id.clone(), a.clone()))
                .collect(),
            entries: snapshot.ledger_entries.clone(),
            starting_balance,
        }
    }

    pub fn starting_balance(&self) -> Credits {
        self.starting_balance
    }

    /// Balance of an existing account, `None` if it was never touched.
    pub fn balance(&self, account_id: &str) -> Option<Credits> {
        self.accounts.get(account_id).map(|a| a.balance)
    }

    pub fn account(&self, account_id: &str) -> Option<&Account> {
        self.accounts.get(account_id)
    }

    pub fn balances(&self) -> BTreeMap<String, Credits> {
        self.accounts
            .values()
            .map(|a| (a.id.clone(), a.balance))
            .collect()
    }

    /// Sum of all balances, saturating at the largest representable amount.
    pub fn total(&self) -> Credits {
        let sum: u128 = self
            .accounts
            .values()
            .map(|a| u128::from(a.balance.micros()))
            .sum();
        Credits::from_micros(u64::try_from(sum).unwrap_or(u64::MAX))
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Audit log for one account, oldest first.
    pub fn entries_for(&self, account_id: &str) -> Vec<&LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .collect()
    }

    /// Current view of an account including writes already staged in `batch`.
    fn current(&self, batch: &WriteBatch, account_id: &str) -> Option<Account> {
        batch
            .staged_account(account_id)
            .or_else(|| self.accounts.get(account_id))
            .cloned()
    }

    /// Balance an account has or would have after first-touch creation.
    pub fn effective_balance(&self, batch: &WriteBatch, account_id: &str) -> Credits {
        self.current(batch, account_id)
            .map(|a| a.balance)
            .unwrap_or(self.starting_balance)
    }

    /// Stage first-touch creation if the account does not exist yet.
    /// Returns the (possibly new) account.
    pub fn open(&self, batch: &mut WriteBatch, account_id: &str, now: DateTime<Utc>) -> Account {
        if let Some(existing) = self.current(batch, account_id) {
            return existing;
        }

        let account = Account::new(account_id, self.starting_balance, now);
        batch.record_entry(LedgerEntry {
            account_id: account_id.to_string(),
            kind: EntryKind::Open,
            delta_micros: self.starting_balance.signed(),
            balance_after: self.starting_balance,
            reference: None,
            at: now,
        });
        batch.put_account(account.clone());
        tracing::info!(
            account_id,
            balance = %self.starting_balance,
            "Account created with starting balance"
        );
        account
    }

    /// Stage a debit. Returns false, staging nothing, if `amount` is zero or
    /// exceeds the current balance.
    pub fn debit(
        &self,
        batch: &mut WriteBatch,
        account_id: &str,
        amount: Credits,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        self.stage_decrease(batch, account_id, amount, EntryKind::Debit, reference, now)
    }

    /// Stage a credit, creating the account on first touch. Returns false,
    /// staging nothing, if `amount` is zero.
    pub fn credit(
        &self,
        batch: &mut WriteBatch,
        account_id: &str,
        amount: Credits,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        self.stage_increase(batch, account_id, amount, EntryKind::Credit, reference, now)
    }

    /// Stage a transfer as one unit: both sides are staged or neither is.
    pub fn transfer(
        &self,
        batch: &mut WriteBatch,
        from: &str,
        to: &str,
        amount: Credits,
        now: DateTime<Utc>,
    ) -> bool {
        if from == to {
            tracing::warn!(account_id = from, "Rejected transfer to the same account");
            return false;
        }
        // Overflow on the receiving side must be ruled out before the source
        // is touched.
        if self
            .effective_balance(batch, to)
            .checked_add(amount)
            .is_none()
        {
            tracing::warn!(from, to, amount = %amount, "Transfer would overflow destination balance");
            return false;
        }
        if !self.stage_decrease(
            batch,
            from,
            amount,
            EntryKind::TransferOut,
            Some(to.to_string()),
            now,
        ) {
            return false;
        }
        let credited = self.stage_increase(
            batch,
            to,
            amount,
            EntryKind::TransferIn,
            Some(from.to_string()),
            now,
        );
        debug_assert!(credited, "destination credit was pre-checked");
        tracing::info!(from, to, amount = %amount, "Transfer staged");
        credited
    }

    fn stage_decrease(
        &self,
        batch: &mut WriteBatch,
        account_id: &str,
        amount: Credits,
        kind: EntryKind,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if amount.is_zero() {
            tracing::warn!(account_id, "Rejected zero-amount {}", kind);
            return false;
        }
        let available = self.effective_balance(batch, account_id);
        let Some(balance_after) = available.checked_sub(amount) else {
            tracing::warn!(
                account_id,
                required = %amount,
                available = %available,
                "Insufficient credits"
            );
            return false;
        };

        let mut account = self.open(batch, account_id, now);
        account.balance = balance_after;
        account.updated_at = now;
        batch.put_account(account);
        batch.record_entry(LedgerEntry {
            account_id: account_id.to_string(),
            kind,
            delta_micros: -amount.signed(),
            balance_after,
            reference,
            at: now,
        });
        tracing::info!(account_id, amount = %amount, balance = %balance_after, "Credits deducted");
        true
    }

    fn stage_increase(
        &self,
        batch: &mut WriteBatch,
        account_id: &str,
        amount: Credits,
        kind: EntryKind,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if amount.is_zero() {
            tracing::warn!(account_id, "Rejected zero-amount {}", kind);
            return false;
        }
        let Some(balance_after) = self.effective_balance(batch, account_id).checked_add(amount)
        else {
            tracing::warn!(account_id, amount = %amount, "Credit would overflow balance");
            return false;
        };

        let mut account = self.open(batch, account_id, now);
        account.balance = balance_after;
        account.updated_at = now;
        batch.put_account(account);
        batch.record_entry(LedgerEntry {
            account_id: account_id.to_string(),
            kind,
            delta_micros: amount.signed(),
            balance_after,
            reference,
            at: now,
        });
        tracing::info!(account_id, amount = %amount, balance = %balance_after, "Credits awarded");
        true
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of audit entries recorded before `cutoff`.
    pub fn entries_before(&self, cutoff: DateTime<Utc>) -> usize {
        self.entries.iter().filter(|e| e.at < cutoff).count()
    }

    /// Install the account and entry writes of a persisted batch. Balances
    /// are kept when old entries are pruned.
    pub fn apply(&mut self, batch: &WriteBatch) {
        for account in &batch.accounts {
            self.accounts.insert(account.id.clone(), account.clone());
        }
        self.entries.extend(batch.ledger_entries.iter().cloned());
        if let Some(cutoff) = batch.entries_cutoff {
            self.entries.retain(|e| e.at >= cutoff);
        }
    }
}
