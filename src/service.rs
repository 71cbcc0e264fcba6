//! Shareable ledger handle for web handlers and payment callbacks.
//!
//! Wraps [`VoucherLedger`] in an `Arc` so request handlers, webhook workers
//! and the gateway poller can each hold a clone.

use crate::error::Result;
use crate::ledger::{IssueRequest, VoucherLedger};
use crate::model::{Entitlement, LedgerStats, Transaction, Voucher};
use crate::notify::AccessGrant;
use crate::repository::LedgerRepository;
use std::sync::Arc;

/// Cloneable ledger service.
///
/// The ledger only takes `&self`, and repositories synchronize internally,
/// so no extra `Mutex` is needed.
///
/// # Example
///
/// ```ignore
/// use voucher_ledger::{LedgerService, VoucherLedger, config::Settings, repository::InMemoryRepository};
///
/// let ledger = VoucherLedger::new(InMemoryRepository::new(), &Settings::default())?;
/// let service = LedgerService::new(ledger);
///
/// // payment webhook
/// let webhook = service.clone();
/// tokio::spawn(async move {
///     webhook.issue_voucher("0712345678", "basic", "WIFI_1A2B3C4D").await
/// });
///
/// // splash page
/// let grant = service.redeem("0712345678", "K7XM2PQR9A").await?;
/// ```
pub struct LedgerService<R: LedgerRepository> {
    ledger: Arc<VoucherLedger<R>>,
}

impl<R: LedgerRepository> Clone for LedgerService<R> {
    fn clone(&self) -> Self {
        LedgerService {
            ledger: Arc::clone(&self.ledger),
        }
    }
}

impl<R: LedgerRepository> LedgerService<R> {
    pub fn new(ledger: VoucherLedger<R>) -> Self {
        LedgerService {
            ledger: Arc::new(ledger),
        }
    }

    /// Issue a voucher for a confirmed payment.
    ///
    /// # Errors
    ///
    /// Same as [`VoucherLedger::issue`].
    pub async fn issue_voucher(
        &self,
        account: &str,
        package_id: &str,
        reference: &str,
    ) -> Result<Voucher> {
        self.ledger
            .issue_voucher(account, package_id, reference)
            .await
    }

    /// # Errors
    ///
    /// Same as [`VoucherLedger::issue`].
    pub async fn issue(&self, request: IssueRequest) -> Result<Voucher> {
        self.ledger.issue(request).await
    }

    /// # Errors
    ///
    /// Same as [`VoucherLedger::record_payment`].
    pub async fn record_payment(
        &self,
        account: &str,
        package_id: &str,
        reference: &str,
    ) -> Result<Transaction> {
        self.ledger
            .record_payment(account, package_id, reference)
            .await
    }

    /// # Errors
    ///
    /// Same as [`VoucherLedger::fail_payment`].
    pub async fn fail_payment(&self, reference: &str) -> Result<Transaction> {
        self.ledger.fail_payment(reference).await
    }

    /// # Errors
    ///
    /// Same as [`VoucherLedger::validate`].
    pub async fn validate(&self, account: &str, code: &str) -> Result<Entitlement> {
        self.ledger.validate(account, code).await
    }

    /// # Errors
    ///
    /// Same as [`VoucherLedger::redeem_with_usage`].
    pub async fn redeem(&self, account: &str, code: &str) -> Result<AccessGrant> {
        self.ledger.redeem(account, code).await
    }

    /// # Errors
    ///
    /// Same as [`VoucherLedger::redeem_with_usage`].
    pub async fn redeem_with_usage(
        &self,
        account: &str,
        code: &str,
        data_used_mb: u64,
    ) -> Result<AccessGrant> {
        self.ledger
            .redeem_with_usage(account, code, data_used_mb)
            .await
    }

    /// # Errors
    ///
    /// Same as [`VoucherLedger::stats`].
    pub async fn stats(&self) -> Result<LedgerStats> {
        self.ledger.stats().await
    }

    /// Direct access to the ledger for less common operations.
    pub fn ledger(&self) -> &VoucherLedger<R> {
        &self.ledger
    }
}
