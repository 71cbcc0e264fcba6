//! Ledger repository trait for abstracting the shared relational store.
//!
//! The ledger never touches storage directly; it goes through
//! [`LedgerRepository`], whose capabilities are small:
//! find, insert-only save, and revision-checked compare-and-swap. The two
//! uniqueness rules of the domain live here, inside the store:
//!
//! - a voucher code is stored at most once
//! - a payment reference links at most one voucher
//! - an account holds at most one Active demo voucher
//!
//! All are enforced in the same atomic step that inserts the voucher, so
//! webhook retries delivered concurrently cannot issue twice.
//!
//! # Implementing LedgerRepository
//!
//! For a SQL database, map the operations to:
//! - `save_voucher`: one transaction with `INSERT` on a `UNIQUE(code)` table and
//!   `UPDATE transactions SET voucher_code = ? WHERE reference = ? AND voucher_code IS NULL`,
//!   with a partial `UNIQUE(account) WHERE source = 'demo' AND status = 'active'` index
//! - `compare_and_swap`: `UPDATE vouchers SET ..., revision = revision + 1
//!   WHERE code = ? AND revision = ?` and check the affected row count
//!
//! [`InMemoryRepository`] is provided for tests and single-process deployments.

use crate::entity::Record;
use crate::error::{Error, Result};
use crate::identifier::AccountId;
use crate::key::RecordKey;
use crate::model::{
    Account, IssueSource, LedgerStats, Package, PaymentReference, Transaction, TransactionStatus,
    Voucher, VoucherCode,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Result of an insert-only voucher save.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Voucher stored (and payment linked, if one was given).
    Saved,
    /// Another voucher already holds this code. Nothing was written.
    CodeTaken,
    /// The payment reference already links a voucher. Nothing was written.
    ReferenceTaken,
    /// The account already holds an Active demo voucher. Nothing was written.
    DemoTaken,
}

/// Trait for ledger storage implementations.
///
/// All methods take `&self`; implementations use interior mutability or an
/// external database so one repository can be shared by concurrent requests.
#[allow(async_fn_in_trait)]
pub trait LedgerRepository: Send + Sync {
    /// Fetch a voucher by code.
    ///
    /// # Returns
    /// - `Ok(Some(voucher))` - Voucher found
    /// - `Ok(None)` - Unknown code (not an error)
    ///
    /// # Errors
    /// Returns `Err` if the store is unavailable or the record is corrupted
    async fn find_voucher(&self, code: &VoucherCode) -> Result<Option<Voucher>>;

    /// Insert a new voucher, optionally completing a payment in the same step.
    ///
    /// When `payment` is given, the store writes it (status Completed, linked
    /// to the voucher) only if the stored transaction with that reference has
    /// no voucher yet. Either both records are written or neither is.
    ///
    /// A demo voucher is stored only if the account's previous demo voucher,
    /// if any, is no longer Active.
    ///
    /// # Errors
    /// Returns `Error::PaymentFailed` if the stored transaction was marked
    /// Failed, or `Err` if the store is unavailable or a record fails validation
    async fn save_voucher(
        &self,
        voucher: &Voucher,
        payment: Option<&Transaction>,
    ) -> Result<SaveOutcome>;

    /// Replace a stored voucher if its revision still equals `expected_revision`.
    ///
    /// On success the stored revision becomes `expected_revision + 1`.
    /// Returns `Ok(false)` when the voucher changed (or vanished) since it was read.
    ///
    /// # Errors
    /// Returns `Err` if the store is unavailable, or the update would move a
    /// terminal status
    async fn compare_and_swap(&self, expected_revision: u64, updated: &Voucher) -> Result<bool>;

    /// All vouchers owned by an account, oldest first.
    ///
    /// # Errors
    /// Returns `Err` if the store is unavailable
    async fn vouchers_for_account(&self, account: &AccountId) -> Result<Vec<Voucher>>;

    /// # Errors
    /// Returns `Err` if the store is unavailable
    async fn find_transaction(&self, reference: &PaymentReference) -> Result<Option<Transaction>>;

    /// Insert a transaction if its reference is new. Returns `false` if it existed.
    ///
    /// # Errors
    /// Returns `Err` if the store is unavailable
    async fn record_transaction(&self, transaction: &Transaction) -> Result<bool>;

    /// Move a Pending transaction to `status`. Returns `false` if it was not Pending.
    ///
    /// # Errors
    /// Returns `Error::TransactionNotFound` for an unknown reference
    async fn settle_transaction(
        &self,
        reference: &PaymentReference,
        status: TransactionStatus,
    ) -> Result<bool>;

    /// # Errors
    /// Returns `Err` if the store is unavailable
    async fn find_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Insert an account if its identifier is new. Returns `false` if it existed.
    ///
    /// # Errors
    /// Returns `Err` if the store is unavailable
    async fn save_account(&self, account: &Account) -> Result<bool>;

    /// # Errors
    /// Returns `Err` if the store is unavailable
    async fn find_package(&self, id: &str) -> Result<Option<Package>>;

    /// Insert or replace a package.
    ///
    /// # Errors
    /// Returns `Error::InvalidPackage` for a package without allowance
    async fn save_package(&self, package: &Package) -> Result<()>;

    /// Packages currently on sale (optional).
    ///
    /// # Errors
    /// Returns `Err` if not implemented or if the store fails
    async fn active_packages(&self) -> Result<Vec<Package>> {
        Err(Error::RepositoryError(
            "active_packages not implemented for this repository".to_string(),
        ))
    }

    /// Ledger totals (optional, for the administrator dashboard).
    ///
    /// # Errors
    /// Returns `Err` if not implemented or if the store fails
    async fn stats(&self) -> Result<LedgerStats> {
        Err(Error::RepositoryError(
            "stats not implemented for this repository".to_string(),
        ))
    }
}

// ============================================================================
// In-Memory Repository
// ============================================================================

/// Thread-safe in-memory ledger store.
///
/// Uses one DashMap per table, each holding versioned postcard envelopes.
/// Cross-table writes always lock `transactions` or `demo_claims` before `vouchers`.
/// Cloning is cheap and clones share the same tables.
///
/// # Example
///
/// ```no_run
/// use voucher_ledger::repository::{InMemoryRepository, LedgerRepository};
/// use voucher_ledger::model::VoucherCode;
///
/// #[tokio::main]
/// async fn main() -> voucher_ledger::Result<()> {
///     let repo = InMemoryRepository::new();
///     assert!(repo.find_voucher(&VoucherCode::new("ABCDEFGH23")).await?.is_none());
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    vouchers: Arc<DashMap<String, Vec<u8>>>,
    transactions: Arc<DashMap<String, Vec<u8>>>,
    accounts: Arc<DashMap<String, Vec<u8>>>,
    packages: Arc<DashMap<String, Vec<u8>>>,
    /// Account key -> code of its latest demo voucher.
    demo_claims: Arc<DashMap<String, VoucherCode>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every record. Useful for resetting state between test cases.
    pub fn clear(&self) {
        self.vouchers.clear();
        self.transactions.clear();
        self.accounts.clear();
        self.packages.clear();
        self.demo_claims.clear();
        warn!("InMemory ledger CLEAR executed - all records removed");
    }

    fn load<T: Record>(table: &DashMap<String, Vec<u8>>, key: &T::Key) -> Result<Option<T>> {
        let key = RecordKey::build::<T>(key);
        let found = table.get(&key).map(|bytes| T::decode(bytes.value()));
        debug!(
            "InMemory GET {} -> {}",
            key,
            if found.is_some() { "HIT" } else { "MISS" }
        );
        found.transpose()
    }

    fn insert_voucher(&self, voucher: &Voucher, bytes: Vec<u8>) -> SaveOutcome {
        match self.vouchers.entry(RecordKey::of(voucher)) {
            Entry::Occupied(_) => {
                debug!("InMemory INSERT voucher {} -> CODE TAKEN", voucher.code);
                SaveOutcome::CodeTaken
            }
            Entry::Vacant(slot) => {
                slot.insert(bytes);
                debug!("InMemory INSERT voucher {}", voucher.code);
                SaveOutcome::Saved
            }
        }
    }

    fn insert_demo_voucher(&self, voucher: &Voucher, bytes: Vec<u8>) -> Result<SaveOutcome> {
        // Held until the voucher insert finishes, like the payment claim.
        let claim = self.demo_claims.entry(RecordKey::build::<Account>(&voucher.account));
        if let Entry::Occupied(existing) = &claim {
            let held = Self::load::<Voucher>(&self.vouchers, existing.get())?;
            if held.is_some_and(|v| !v.status.is_terminal()) {
                debug!(
                    "InMemory DEMO CLAIM {} -> HELD by {}",
                    voucher.account,
                    existing.get()
                );
                return Ok(SaveOutcome::DemoTaken);
            }
        }

        let outcome = self.insert_voucher(voucher, bytes);
        if outcome == SaveOutcome::Saved {
            claim.insert(voucher.code.clone());
            debug!("InMemory DEMO CLAIM {} -> {}", voucher.account, voucher.code);
        }
        Ok(outcome)
    }
}

impl LedgerRepository for InMemoryRepository {
    async fn find_voucher(&self, code: &VoucherCode) -> Result<Option<Voucher>> {
        Self::load::<Voucher>(&self.vouchers, code)
    }

    async fn save_voucher(
        &self,
        voucher: &Voucher,
        payment: Option<&Transaction>,
    ) -> Result<SaveOutcome> {
        voucher.validate()?;
        let voucher_bytes = voucher.encode()?;

        let Some(payment) = payment else {
            if voucher.source == IssueSource::Demo {
                return self.insert_demo_voucher(voucher, voucher_bytes);
            }
            return Ok(self.insert_voucher(voucher, voucher_bytes));
        };

        if payment.status != TransactionStatus::Completed
            || payment.voucher_code.as_ref() != Some(&voucher.code)
        {
            return Err(Error::InvalidRecord(format!(
                "payment {} must be completed and linked to voucher {}",
                payment.reference, voucher.code
            )));
        }
        let payment_bytes = payment.encode()?;

        // Held until the voucher insert finishes: the claim and the insert are one step.
        let claim = self.transactions.entry(RecordKey::of(payment));
        if let Entry::Occupied(existing) = &claim {
            let current = Transaction::decode(existing.get())?;
            if current.voucher_code.is_some() {
                debug!("InMemory CLAIM {} -> ALREADY LINKED", payment.reference);
                return Ok(SaveOutcome::ReferenceTaken);
            }
            if current.status == TransactionStatus::Failed {
                return Err(Error::PaymentFailed(payment.reference.to_string()));
            }
        }

        let outcome = self.insert_voucher(voucher, voucher_bytes);
        if outcome == SaveOutcome::Saved {
            claim.insert(payment_bytes);
            debug!(
                "InMemory CLAIM {} -> voucher {}",
                payment.reference, voucher.code
            );
        }
        Ok(outcome)
    }

    async fn compare_and_swap(&self, expected_revision: u64, updated: &Voucher) -> Result<bool> {
        updated.validate()?;
        let key = RecordKey::of(updated);

        let Some(mut slot) = self.vouchers.get_mut(&key) else {
            debug!("InMemory CAS {} -> MISSING", key);
            return Ok(false);
        };

        let current = Voucher::decode(slot.value())?;
        if current.revision != expected_revision {
            debug!(
                "InMemory CAS {} -> STALE (expected r{}, found r{})",
                key, expected_revision, current.revision
            );
            return Ok(false);
        }
        if current.status.is_terminal() && current.status != updated.status {
            return Err(Error::RepositoryError(format!(
                "voucher {} cannot leave terminal status {}",
                current.code, current.status
            )));
        }

        let mut next = updated.clone();
        next.revision = expected_revision + 1;
        *slot.value_mut() = next.encode()?;
        debug!("InMemory CAS {} -> r{}", key, next.revision);
        Ok(true)
    }

    async fn vouchers_for_account(&self, account: &AccountId) -> Result<Vec<Voucher>> {
        let mut owned = Vec::new();
        for entry in self.vouchers.iter() {
            let voucher = Voucher::decode(entry.value())?;
            if &voucher.account == account {
                owned.push(voucher);
            }
        }
        // Ids are v7, so they order vouchers issued in the same instant.
        owned.sort_by_key(|v| (v.issued_at, v.id));
        Ok(owned)
    }

    async fn find_transaction(&self, reference: &PaymentReference) -> Result<Option<Transaction>> {
        Self::load::<Transaction>(&self.transactions, reference)
    }

    async fn record_transaction(&self, transaction: &Transaction) -> Result<bool> {
        transaction.validate()?;
        let bytes = transaction.encode()?;
        match self.transactions.entry(RecordKey::of(transaction)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(bytes);
                debug!("InMemory INSERT txn {}", transaction.reference);
                Ok(true)
            }
        }
    }

    async fn settle_transaction(
        &self,
        reference: &PaymentReference,
        status: TransactionStatus,
    ) -> Result<bool> {
        let key = RecordKey::build::<Transaction>(reference);
        let mut slot = self
            .transactions
            .get_mut(&key)
            .ok_or_else(|| Error::TransactionNotFound(reference.to_string()))?;

        let mut transaction = Transaction::decode(slot.value())?;
        if transaction.status != TransactionStatus::Pending {
            return Ok(false);
        }
        transaction.status = status;
        transaction.validate()?;
        *slot.value_mut() = transaction.encode()?;
        debug!("InMemory SETTLE txn {} -> {:?}", reference, status);
        Ok(true)
    }

    async fn find_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Self::load::<Account>(&self.accounts, id)
    }

    async fn save_account(&self, account: &Account) -> Result<bool> {
        let bytes = account.encode()?;
        match self.accounts.entry(RecordKey::of(account)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(bytes);
                debug!("InMemory INSERT account {}", account.id);
                Ok(true)
            }
        }
    }

    async fn find_package(&self, id: &str) -> Result<Option<Package>> {
        Self::load::<Package>(&self.packages, &id.to_string())
    }

    async fn save_package(&self, package: &Package) -> Result<()> {
        package.validate()?;
        self.packages.insert(RecordKey::of(package), package.encode()?);
        debug!("InMemory UPSERT package {}", package.id);
        Ok(())
    }

    async fn active_packages(&self) -> Result<Vec<Package>> {
        let mut active = Vec::new();
        for entry in self.packages.iter() {
            let package = Package::decode(entry.value())?;
            if package.active {
                active.push(package);
            }
        }
        active.sort_by_key(|p| p.price_cents);
        Ok(active)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let mut stats = LedgerStats {
            accounts: self.accounts.len() as u64,
            ..LedgerStats::default()
        };
        for entry in self.vouchers.iter() {
            stats.count_voucher(Voucher::decode(entry.value())?.status);
        }
        for entry in self.transactions.iter() {
            stats.count_transaction(&Transaction::decode(entry.value())?);
        }
        Ok(stats)
    }
}
