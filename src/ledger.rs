//! Voucher ledger - issuance, validation and redemption.

use crate::clock::{Clock, SystemClock};
use crate::code::CodeGenerator;
use crate::config::{LedgerConfig, Settings};
use crate::error::{Error, Result};
use crate::identifier::AccountId;
use crate::model::{
    Account, Entitlement, IssueSource, LedgerStats, Package, PaymentReference, Transaction,
    TransactionStatus, Voucher, VoucherCode, VoucherStatus,
};
use crate::notify::{
    AccessGrant, GrantSink, GrantUrlBuilder, LogGrantSink, LogMailer, Mailer, VoucherEmail,
};
use crate::observability::{LedgerMetrics, NoOpMetrics};
use crate::repository::{LedgerRepository, SaveOutcome};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Inbound issuance request.
///
/// `account` is the raw identifier as typed or received; the ledger
/// normalizes it.
#[derive(Clone, Debug, PartialEq)]
pub struct IssueRequest {
    pub account: String,
    pub package_id: String,
    pub source: IssueSource,
}

impl IssueRequest {
    /// Issuance for a confirmed payment.
    pub fn payment(
        account: impl Into<String>,
        package_id: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        IssueRequest {
            account: account.into(),
            package_id: package_id.into(),
            source: IssueSource::Payment {
                reference: PaymentReference::new(reference),
            },
        }
    }

    /// Free trial grant.
    pub fn demo(account: impl Into<String>, package_id: impl Into<String>) -> Self {
        IssueRequest {
            account: account.into(),
            package_id: package_id.into(),
            source: IssueSource::Demo,
        }
    }

    /// Manual grant by an administrator.
    pub fn admin(account: impl Into<String>, package_id: impl Into<String>) -> Self {
        IssueRequest {
            account: account.into(),
            package_id: package_id.into(),
            source: IssueSource::Admin,
        }
    }
}

/// Core voucher ledger.
///
/// Every voucher mutation is a read-check-write closed by a revision-checked
/// compare-and-swap, so concurrent splash-page retries cannot double-grant.
///
/// # Example
///
/// ```ignore
/// use voucher_ledger::{VoucherLedger, config::Settings, repository::InMemoryRepository};
///
/// let ledger = VoucherLedger::new(InMemoryRepository::new(), &Settings::default())?;
/// let voucher = ledger.issue_voucher("0712345678", "basic", "WIFI_1A2B3C4D").await?;
/// let grant = ledger.redeem("0712345678", voucher.code.as_str()).await?;
/// ```
pub struct VoucherLedger<R: LedgerRepository> {
    repository: R,
    config: LedgerConfig,
    codes: CodeGenerator,
    grant_urls: GrantUrlBuilder,
    clock: Arc<dyn Clock>,
    mailer: Box<dyn Mailer>,
    grants: Box<dyn GrantSink>,
    metrics: Box<dyn LedgerMetrics>,
}

impl<R: LedgerRepository> VoucherLedger<R> {
    /// Create a ledger over `repository`, logging mail and grants until
    /// real collaborators are attached.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if `settings` do not validate.
    pub fn new(repository: R, settings: &Settings) -> Result<Self> {
        settings.validate()?;
        Ok(VoucherLedger {
            repository,
            codes: settings.ledger.code_generator()?,
            grant_urls: GrantUrlBuilder::new(&settings.grant)?,
            config: settings.ledger.clone(),
            clock: Arc::new(SystemClock),
            mailer: Box::new(LogMailer),
            grants: Box::new(LogGrantSink),
            metrics: Box::new(NoOpMetrics),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_mailer(mut self, mailer: Box<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn with_grant_sink(mut self, grants: Box<dyn GrantSink>) -> Self {
        self.grants = grants;
        self
    }

    pub fn with_metrics(mut self, metrics: Box<dyn LedgerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn account_id(&self, raw: &str) -> Result<AccountId> {
        self.config.identifier.normalize(raw)
    }

    // ========================================================================
    // Accounts and packages
    // ========================================================================

    /// Register an account, or return the existing one with that identifier.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidIdentifier`: Identifier does not normalize
    /// - `Error::RepositoryError`: Store failure
    pub async fn register_account(
        &self,
        raw_account: &str,
        credential_hash: Option<String>,
    ) -> Result<Account> {
        let id = self.account_id(raw_account)?;
        self.ensure_account(&id, credential_hash).await
    }

    async fn ensure_account(&self, id: &AccountId, credential_hash: Option<String>) -> Result<Account> {
        let account = Account {
            id: id.clone(),
            credential_hash,
            created_at: self.clock.now(),
        };
        if self.repository.save_account(&account).await? {
            info!("Registered account {}", id);
            return Ok(account);
        }
        self.repository
            .find_account(id)
            .await?
            .ok_or_else(|| Error::RepositoryError(format!("account {} vanished", id)))
    }

    /// Create or replace a package (administrator action).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPackage` for a package without allowance.
    pub async fn save_package(&self, package: &Package) -> Result<()> {
        self.repository.save_package(package).await?;
        info!("Saved package {} ({})", package.id, package.summary());
        Ok(())
    }

    /// Packages currently on sale, cheapest first.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the repository does not support listing.
    pub async fn packages(&self) -> Result<Vec<Package>> {
        self.repository.active_packages().await
    }

    async fn package_for_sale(&self, package_id: &str) -> Result<Package> {
        let package = self
            .repository
            .find_package(package_id)
            .await?
            .ok_or_else(|| Error::PackageNotFound(package_id.to_string()))?;
        if !package.active {
            return Err(Error::PackageInactive(package_id.to_string()));
        }
        Ok(package)
    }

    // ========================================================================
    // Payments
    // ========================================================================

    /// Record a payment the gateway has started but not confirmed.
    ///
    /// Idempotent: a repeated reference returns the stored transaction.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidIdentifier`: Identifier does not normalize
    /// - `Error::PackageNotFound` / `Error::PackageInactive`: Package not on sale
    pub async fn record_payment(
        &self,
        raw_account: &str,
        package_id: &str,
        reference: &str,
    ) -> Result<Transaction> {
        let account = self.account_id(raw_account)?;
        let package = self.package_for_sale(package_id).await?;
        let transaction = Transaction {
            reference: PaymentReference::new(reference),
            account,
            amount_cents: package.price_cents,
            currency: package.currency,
            status: TransactionStatus::Pending,
            voucher_code: None,
            created_at: self.clock.now(),
        };

        if self.repository.record_transaction(&transaction).await? {
            debug!("Recorded pending payment {}", reference);
            return Ok(transaction);
        }
        self.stored_transaction(&transaction.reference).await
    }

    /// Mark a pending payment as failed. Completed payments are left alone.
    ///
    /// # Errors
    ///
    /// Returns `Error::TransactionNotFound` for an unknown reference.
    pub async fn fail_payment(&self, reference: &str) -> Result<Transaction> {
        let reference = PaymentReference::new(reference);
        if !self
            .repository
            .settle_transaction(&reference, TransactionStatus::Failed)
            .await?
        {
            debug!("Payment {} already settled, fail ignored", reference);
        }
        self.stored_transaction(&reference).await
    }

    /// Look up a payment by reference.
    ///
    /// # Errors
    ///
    /// Returns `Err` on store failure.
    pub async fn transaction(&self, reference: &str) -> Result<Option<Transaction>> {
        self.repository
            .find_transaction(&PaymentReference::new(reference))
            .await
    }

    async fn stored_transaction(&self, reference: &PaymentReference) -> Result<Transaction> {
        self.repository
            .find_transaction(reference)
            .await?
            .ok_or_else(|| Error::TransactionNotFound(reference.to_string()))
    }

    // ========================================================================
    // Issue
    // ========================================================================

    /// Issue a voucher for a confirmed payment.
    ///
    /// # Errors
    ///
    /// See [`VoucherLedger::issue`].
    pub async fn issue_voucher(
        &self,
        raw_account: &str,
        package_id: &str,
        reference: &str,
    ) -> Result<Voucher> {
        self.issue(IssueRequest::payment(raw_account, package_id, reference))
            .await
    }

    /// Issue a voucher.
    ///
    /// Payment sources are idempotent on their reference; demo sources hand
    /// back an account's still-active demo voucher instead of a second one.
    /// The account is registered and the voucher email sent only after the
    /// voucher is stored; failures of either do not undo issuance.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidIdentifier`: Identifier does not normalize
    /// - `Error::PackageNotFound` / `Error::PackageInactive`: Package not on sale
    /// - `Error::DuplicateIssuance`: Payment reference already produced a voucher
    /// - `Error::PaymentFailed`: Payment was reported failed
    /// - `Error::AccountMismatch`: Payment was recorded for another account
    /// - `Error::CodeSpaceExhausted`: No free code within the attempt budget
    /// - `Error::StorageConflict`: A concurrent demo request won and its voucher is already gone
    /// - `Error::RepositoryError`: Store failure
    pub async fn issue(&self, request: IssueRequest) -> Result<Voucher> {
        let timer = Instant::now();
        let account = self.account_id(&request.account)?;
        let package = self.package_for_sale(&request.package_id).await?;

        let pending = match &request.source {
            IssueSource::Payment { reference } => self.check_payment(reference, &account).await?,
            IssueSource::Demo => {
                if let Some(existing) = self.active_demo_voucher(&account).await? {
                    info!(
                        "Account {} already holds demo voucher {}",
                        account, existing.code
                    );
                    return Ok(existing);
                }
                // A closed demo window still holds the demo claim until it is stored as Expired.
                self.expire_account(&account).await?;
                None
            }
            IssueSource::Admin => None,
        };

        let now = self.clock.now();

        for attempt in 1..=self.config.max_code_attempts {
            let code = self.codes.generate();
            if self.repository.find_voucher(&code).await?.is_some() {
                debug!("Code collision on attempt {}, regenerating", attempt);
                continue;
            }

            let voucher = Voucher {
                id: Uuid::now_v7(),
                code: code.clone(),
                account: account.clone(),
                package_id: package.id.clone(),
                duration_minutes: package.duration_minutes,
                data_limit_mb: package.data_limit_mb,
                status: VoucherStatus::Active,
                source: request.source.clone(),
                issued_at: now,
                activated_at: None,
                expires_at: self
                    .config
                    .expiry_policy
                    .expiry_at_issue(now, package.duration_minutes),
                remaining_data_mb: package.data_limit_mb,
                revision: 0,
            };

            let completed = request.source.reference().map(|reference| match &pending {
                Some(recorded) => Transaction {
                    status: TransactionStatus::Completed,
                    voucher_code: Some(code.clone()),
                    ..recorded.clone()
                },
                None => Transaction {
                    reference: reference.clone(),
                    account: account.clone(),
                    amount_cents: package.price_cents,
                    currency: package.currency.clone(),
                    status: TransactionStatus::Completed,
                    voucher_code: Some(code.clone()),
                    created_at: now,
                },
            });

            match self
                .repository
                .save_voucher(&voucher, completed.as_ref())
                .await?
            {
                SaveOutcome::Saved => {
                    if let Err(e) = self.ensure_account(&account, None).await {
                        warn!(
                            "Voucher {} issued but account {} was not registered: {}",
                            voucher.code, account, e
                        );
                    }
                    info!(
                        "Issued voucher {} to {} ({}, {})",
                        voucher.code,
                        account,
                        package.summary(),
                        self.config.expiry_policy
                    );
                    self.metrics
                        .record_issued(voucher.code.as_str(), timer.elapsed());
                    self.send_email(&voucher, &package);
                    return Ok(voucher);
                }
                SaveOutcome::CodeTaken => {
                    debug!("Code taken concurrently on attempt {}, regenerating", attempt);
                }
                SaveOutcome::ReferenceTaken => {
                    let reference = request
                        .source
                        .reference()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    warn!("Duplicate issuance for payment {}", reference);
                    return Err(Error::DuplicateIssuance { reference });
                }
                SaveOutcome::DemoTaken => {
                    return match self.active_demo_voucher(&account).await? {
                        Some(existing) => {
                            info!(
                                "Concurrent demo request for {} resolved to voucher {}",
                                account, existing.code
                            );
                            Ok(existing)
                        }
                        None => Err(Error::StorageConflict(format!(
                            "demo voucher of {} changed concurrently",
                            account
                        ))),
                    };
                }
            }
        }

        Err(Error::CodeSpaceExhausted {
            attempts: self.config.max_code_attempts,
        })
    }

    /// Early checks on the payment behind an issuance.
    ///
    /// Returns the stored transaction if the collaborator recorded one first.
    async fn check_payment(
        &self,
        reference: &PaymentReference,
        account: &AccountId,
    ) -> Result<Option<Transaction>> {
        let Some(existing) = self.repository.find_transaction(reference).await? else {
            return Ok(None);
        };

        if existing.voucher_code.is_some() {
            warn!("Duplicate issuance for payment {}", reference);
            return Err(Error::DuplicateIssuance {
                reference: reference.to_string(),
            });
        }
        if existing.status == TransactionStatus::Failed {
            return Err(Error::PaymentFailed(reference.to_string()));
        }
        if &existing.account != account {
            warn!(
                "Payment {} recorded for {}, issuance requested for {}",
                reference, existing.account, account
            );
            return Err(Error::AccountMismatch);
        }
        Ok(Some(existing))
    }

    async fn active_demo_voucher(&self, account: &AccountId) -> Result<Option<Voucher>> {
        let now = self.clock.now();
        Ok(self
            .repository
            .vouchers_for_account(account)
            .await?
            .into_iter()
            .find(|v| v.source == IssueSource::Demo && v.check_usable(now).is_ok()))
    }

    fn send_email(&self, voucher: &Voucher, package: &Package) {
        let email = VoucherEmail {
            to: voucher.account.clone(),
            code: voucher.code.clone(),
            package_name: package.name.clone(),
            package_summary: package.summary(),
            source: voucher.source.clone(),
        };
        if let Err(e) = self.mailer.send_voucher_email(&email) {
            warn!(
                "Voucher {} issued but email to {} failed: {}",
                voucher.code, voucher.account, e
            );
            self.metrics.record_error(voucher.code.as_str(), &e.to_string());
        }
    }

    // ========================================================================
    // Validate / redeem
    // ========================================================================

    async fn load_owned(&self, account: &AccountId, code: &VoucherCode) -> Result<Voucher> {
        let voucher = self
            .repository
            .find_voucher(code)
            .await?
            .ok_or(Error::NotFound)?;
        if &voucher.account != account {
            return Err(Error::AccountMismatch);
        }
        Ok(voucher)
    }

    fn reject<T>(&self, code: &VoucherCode, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            match e.rejection() {
                Some(_) => {
                    warn!("Voucher {} rejected: {}", code, e);
                    self.metrics.record_rejected(code.as_str(), &e.to_string());
                }
                None => self.metrics.record_error(code.as_str(), &e.to_string()),
            }
        }
        result
    }

    /// Check a voucher without consuming it.
    ///
    /// Never writes: a voucher whose window has closed is reported `Expired`
    /// here and moved to Expired by the next redeem or [`VoucherLedger::expire_due`].
    ///
    /// # Errors
    ///
    /// - `Error::NotFound`: Unknown code
    /// - `Error::AccountMismatch`: Code belongs to another account
    /// - `Error::Expired`: Window closed or data exhausted
    /// - `Error::AlreadyUsedTerminal`: Voucher fully used
    pub async fn validate(&self, raw_account: &str, raw_code: &str) -> Result<Entitlement> {
        let account = self.account_id(raw_account)?;
        let code = VoucherCode::from_input(raw_code);

        let result = async {
            let voucher = self.load_owned(&account, &code).await?;
            let now = self.clock.now();
            voucher.check_usable(now)?;
            Ok(voucher.entitlement(now))
        }
        .await;

        self.reject(&code, result)
    }

    /// Redeem a voucher for a login without data usage.
    ///
    /// # Errors
    ///
    /// See [`VoucherLedger::redeem_with_usage`].
    pub async fn redeem(&self, raw_account: &str, raw_code: &str) -> Result<AccessGrant> {
        self.redeem_with_usage(raw_account, raw_code, 0).await
    }

    /// Redeem a voucher and charge `data_used_mb` against its allowance.
    ///
    /// The first redemption starts the clock. When the data allowance reaches
    /// zero the voucher becomes Used in the same write. On success exactly
    /// one grant signal is emitted.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound`: Unknown code
    /// - `Error::AccountMismatch`: Code belongs to another account
    /// - `Error::Expired`: Window closed (the voucher is moved to Expired)
    /// - `Error::AlreadyUsedTerminal`: Voucher fully used
    /// - `Error::StorageConflict`: Another redeem won the write race, or the
    ///   write kept failing after every retry
    /// - `Error::DeliveryError`: State was written but the grant sink refused
    pub async fn redeem_with_usage(
        &self,
        raw_account: &str,
        raw_code: &str,
        data_used_mb: u64,
    ) -> Result<AccessGrant> {
        let account = self.account_id(raw_account)?;
        let code = VoucherCode::from_input(raw_code);
        let result = self.redeem_inner(&account, &code, data_used_mb).await;
        self.reject(&code, result)
    }

    async fn redeem_inner(
        &self,
        account: &AccountId,
        code: &VoucherCode,
        data_used_mb: u64,
    ) -> Result<AccessGrant> {
        let timer = Instant::now();
        let max_attempts = self.config.conflict_retries + 1;
        let mut lost_at: Option<u64> = None;

        for attempt in 1..=max_attempts {
            let current = self.load_owned(account, code).await?;
            let now = self.clock.now();

            if let Err(e) = current.check_usable(now) {
                if current.status == VoucherStatus::Active {
                    self.persist_expiry(&current).await?;
                }
                return Err(e);
            }

            // A competing redeem moved the revision and already granted access.
            if lost_at.is_some_and(|revision| revision != current.revision) {
                return Err(Error::StorageConflict(format!(
                    "voucher {} was redeemed concurrently",
                    code
                )));
            }

            let mut next = current.clone();
            next.activate(now);
            next.consume_data(data_used_mb);

            if !self
                .repository
                .compare_and_swap(current.revision, &next)
                .await?
            {
                self.metrics.record_conflict(code.as_str());
                warn!(
                    "Redeem of {} lost a write race (attempt {}/{})",
                    code, attempt, max_attempts
                );
                lost_at = Some(current.revision);
                continue;
            }
            next.revision = current.revision + 1;

            let entitlement = next.entitlement(now);
            let grant = AccessGrant {
                account: account.clone(),
                code: code.clone(),
                session_minutes: entitlement.remaining_minutes,
                remaining_data_mb: entitlement.remaining_data_mb,
                expires_at: entitlement.expires_at,
                grant_url: self
                    .grant_urls
                    .build(account, entitlement.remaining_minutes),
            };

            if let Err(e) = self.grants.grant(&grant) {
                error!("Voucher {} redeemed but grant failed: {}", code, e);
                return Err(e);
            }

            info!(
                "Redeemed voucher {} for {} (status {}, {:?} min, {:?} MB left)",
                code, account, next.status, grant.session_minutes, grant.remaining_data_mb
            );
            self.metrics.record_redeemed(code.as_str(), timer.elapsed());
            return Ok(grant);
        }

        Err(Error::StorageConflict(format!(
            "voucher {} changed concurrently {} times",
            code, max_attempts
        )))
    }

    /// Move an Active voucher whose window closed to Expired.
    ///
    /// A lost race is fine: whoever won wrote a state at least as final.
    async fn persist_expiry(&self, current: &Voucher) -> Result<bool> {
        let mut expired = current.clone();
        expired.status = VoucherStatus::Expired;
        let swapped = self
            .repository
            .compare_and_swap(current.revision, &expired)
            .await?;
        if swapped {
            info!("Voucher {} expired", current.code);
        }
        Ok(swapped)
    }

    // ========================================================================
    // Account views
    // ========================================================================

    /// All vouchers of an account, oldest first (dashboard retrieval).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentifier` or a store failure.
    pub async fn vouchers_for(&self, raw_account: &str) -> Result<Vec<Voucher>> {
        let account = self.account_id(raw_account)?;
        self.repository.vouchers_for_account(&account).await
    }

    /// Persist Expired on every Active voucher of the account whose window
    /// has closed. Returns how many were moved.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentifier` or a store failure.
    pub async fn expire_due(&self, raw_account: &str) -> Result<usize> {
        let account = self.account_id(raw_account)?;
        self.expire_account(&account).await
    }

    async fn expire_account(&self, account: &AccountId) -> Result<usize> {
        let now = self.clock.now();
        let mut moved = 0;

        for voucher in self.repository.vouchers_for_account(account).await? {
            if voucher.status == VoucherStatus::Active
                && voucher.check_usable(now) == Err(Error::Expired)
                && self.persist_expiry(&voucher).await?
            {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Voucher, account, transaction and revenue totals.
    ///
    /// # Errors
    ///
    /// Returns `Error::RepositoryError` if the store cannot report totals.
    pub async fn stats(&self) -> Result<LedgerStats> {
        let stats = self.repository.stats().await?;
        debug!(
            "Ledger stats: {} vouchers, {} accounts, {} transactions",
            stats.vouchers_total(),
            stats.accounts,
            stats.transactions
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SmtpConfig;
    use crate::error::Rejection;
    use crate::notify::{ChannelGrantSink, OutboxMailer};
    use crate::repository::InMemoryRepository;
    use crate::strategy::ExpiryPolicy;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    const PHONE: &str = "0712345678";
    const OTHER_PHONE: &str = "0755000111";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn basic() -> Package {
        Package {
            id: "basic".to_string(),
            name: "Basic Access".to_string(),
            duration_minutes: Some(60),
            data_limit_mb: None,
            price_cents: 100_000,
            currency: "TZS".to_string(),
            active: true,
        }
    }

    fn data_pack() -> Package {
        Package {
            id: "data_500mb".to_string(),
            name: "500MB Data Pack".to_string(),
            duration_minutes: None,
            data_limit_mb: Some(500),
            price_cents: 150_000,
            currency: "TZS".to_string(),
            active: true,
        }
    }

    fn demo() -> Package {
        Package {
            id: "demo".to_string(),
            name: "Demo Access".to_string(),
            duration_minutes: Some(15),
            data_limit_mb: None,
            price_cents: 0,
            currency: "TZS".to_string(),
            active: true,
        }
    }

    async fn ledger_with(settings: Settings) -> (VoucherLedger<InMemoryRepository>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let ledger = VoucherLedger::new(InMemoryRepository::new(), &settings)
            .unwrap()
            .with_clock(clock.clone());
        for package in [basic(), data_pack(), demo()] {
            ledger.save_package(&package).await.unwrap();
        }
        (ledger, clock)
    }

    async fn ledger() -> (VoucherLedger<InMemoryRepository>, Arc<ManualClock>) {
        ledger_with(Settings::default()).await
    }

    /// How [`ContendedRepository`] treats voucher writes.
    enum Contention {
        /// A rival redeem commits the same write just before the first one.
        RivalFirst,
        /// Every compare-and-swap reports a stale revision.
        AlwaysStale,
    }

    /// In-memory store that loses voucher write races on demand.
    struct ContendedRepository {
        inner: InMemoryRepository,
        contention: Contention,
        rival_done: AtomicBool,
    }

    impl LedgerRepository for ContendedRepository {
        async fn find_voucher(&self, code: &VoucherCode) -> Result<Option<Voucher>> {
            self.inner.find_voucher(code).await
        }

        async fn save_voucher(
            &self,
            voucher: &Voucher,
            payment: Option<&Transaction>,
        ) -> Result<SaveOutcome> {
            self.inner.save_voucher(voucher, payment).await
        }

        async fn compare_and_swap(&self, expected_revision: u64, updated: &Voucher) -> Result<bool> {
            match self.contention {
                Contention::AlwaysStale => Ok(false),
                Contention::RivalFirst => {
                    if !self.rival_done.swap(true, Ordering::SeqCst) {
                        assert!(self.inner.compare_and_swap(expected_revision, updated).await?);
                    }
                    self.inner.compare_and_swap(expected_revision, updated).await
                }
            }
        }

        async fn vouchers_for_account(&self, account: &AccountId) -> Result<Vec<Voucher>> {
            self.inner.vouchers_for_account(account).await
        }

        async fn find_transaction(&self, reference: &PaymentReference) -> Result<Option<Transaction>> {
            self.inner.find_transaction(reference).await
        }

        async fn record_transaction(&self, transaction: &Transaction) -> Result<bool> {
            self.inner.record_transaction(transaction).await
        }

        async fn settle_transaction(
            &self,
            reference: &PaymentReference,
            status: TransactionStatus,
        ) -> Result<bool> {
            self.inner.settle_transaction(reference, status).await
        }

        async fn find_account(&self, id: &AccountId) -> Result<Option<Account>> {
            self.inner.find_account(id).await
        }

        async fn save_account(&self, account: &Account) -> Result<bool> {
            self.inner.save_account(account).await
        }

        async fn find_package(&self, id: &str) -> Result<Option<Package>> {
            self.inner.find_package(id).await
        }

        async fn save_package(&self, package: &Package) -> Result<()> {
            self.inner.save_package(package).await
        }
    }

    async fn contended_ledger(contention: Contention) -> VoucherLedger<ContendedRepository> {
        let repository = ContendedRepository {
            inner: InMemoryRepository::new(),
            contention,
            rival_done: AtomicBool::new(false),
        };
        let ledger = VoucherLedger::new(repository, &Settings::default())
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(t0())));
        ledger.save_package(&basic()).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_issue_creates_active_voucher_and_account() {
        let (ledger, _) = ledger().await;

        let voucher = ledger.issue_voucher(PHONE, "basic", "WIFI_0001").await.unwrap();

        assert_eq!(voucher.status, VoucherStatus::Active);
        assert_eq!(voucher.account.as_str(), "+255712345678");
        assert_eq!(voucher.expires_at, None);
        assert_eq!(voucher.issued_at, t0());
        assert!(ledger.codes.is_well_formed(&voucher.code));

        let account = ledger.repository().find_account(&voucher.account).await.unwrap();
        assert!(account.is_some());

        let txn = ledger.transaction("WIFI_0001").await.unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Completed);
        assert_eq!(txn.voucher_code, Some(voucher.code));
        assert_eq!(txn.amount_cents, 100_000);
    }

    #[tokio::test]
    async fn test_issue_twice_same_reference_is_duplicate() {
        let (ledger, _) = ledger().await;
        ledger.issue_voucher(PHONE, "basic", "WIFI_0001").await.unwrap();

        let err = ledger
            .issue_voucher(PHONE, "basic", "WIFI_0001")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateIssuance {
                reference: "WIFI_0001".to_string()
            }
        );
        assert_eq!(ledger.vouchers_for(PHONE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_issue_completes_recorded_payment() {
        let (ledger, _) = ledger().await;
        let pending = ledger.record_payment(PHONE, "basic", "WIFI_0002").await.unwrap();
        assert_eq!(pending.status, TransactionStatus::Pending);

        let voucher = ledger.issue_voucher(PHONE, "basic", "WIFI_0002").await.unwrap();
        let txn = ledger.transaction("WIFI_0002").await.unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Completed);
        assert_eq!(txn.voucher_code, Some(voucher.code));
        assert_eq!(txn.created_at, pending.created_at);
    }

    #[tokio::test]
    async fn test_failed_payment_does_not_issue() {
        let (ledger, _) = ledger().await;
        ledger.record_payment(PHONE, "basic", "WIFI_0003").await.unwrap();
        let failed = ledger.fail_payment("WIFI_0003").await.unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);

        let err = ledger
            .issue_voucher(PHONE, "basic", "WIFI_0003")
            .await
            .unwrap_err();
        assert_eq!(err, Error::PaymentFailed("WIFI_0003".to_string()));
    }

    #[tokio::test]
    async fn test_payment_for_other_account_is_mismatch() {
        let (ledger, _) = ledger().await;
        ledger.record_payment(PHONE, "basic", "WIFI_0004").await.unwrap();

        let err = ledger
            .issue_voucher(OTHER_PHONE, "basic", "WIFI_0004")
            .await
            .unwrap_err();
        assert_eq!(err, Error::AccountMismatch);
    }

    #[tokio::test]
    async fn test_issue_rejects_unknown_and_inactive_packages() {
        let (ledger, _) = ledger().await;
        let mut retired = basic();
        retired.id = "retired".to_string();
        retired.active = false;
        ledger.save_package(&retired).await.unwrap();

        assert_eq!(
            ledger.issue_voucher(PHONE, "gold", "WIFI_0005").await,
            Err(Error::PackageNotFound("gold".to_string()))
        );
        assert_eq!(
            ledger.issue_voucher(PHONE, "retired", "WIFI_0005").await,
            Err(Error::PackageInactive("retired".to_string()))
        );
        assert!(ledger.transaction("WIFI_0005").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_issue_rejects_bad_identifier() {
        let (ledger, _) = ledger().await;
        let err = ledger
            .issue_voucher("alice@example.com", "basic", "WIFI_0006")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn test_demo_voucher_not_duplicated_while_active() {
        let (ledger, clock) = ledger().await;

        let first = ledger.issue(IssueRequest::demo(PHONE, "demo")).await.unwrap();
        let again = ledger.issue(IssueRequest::demo(PHONE, "demo")).await.unwrap();
        assert_eq!(first.code, again.code);

        ledger.redeem(PHONE, first.code.as_str()).await.unwrap();
        clock.advance(Duration::minutes(16));

        let fresh = ledger.issue(IssueRequest::demo(PHONE, "demo")).await.unwrap();
        assert_ne!(fresh.code, first.code);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_demo_requests_share_one_voucher() {
        let (ledger, _) = ledger().await;
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.issue(IssueRequest::demo(PHONE, "demo")).await })
            })
            .collect();
        let codes: Vec<VoucherCode> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().code)
            .collect();

        assert!(codes.iter().all(|code| code == &codes[0]));
        let demos: Vec<_> = ledger
            .vouchers_for(PHONE)
            .await
            .unwrap()
            .into_iter()
            .filter(|v| v.source == IssueSource::Demo)
            .collect();
        assert_eq!(demos.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_code_space_registers_no_account() {
        let settings = Settings {
            ledger: LedgerConfig {
                code_alphabet: "AB".to_string(),
                code_length: 1,
                max_code_attempts: 64,
                ..LedgerConfig::default()
            },
            ..Settings::default()
        };
        let (ledger, _) = ledger_with(settings).await;
        ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();
        ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();

        let err = ledger
            .issue(IssueRequest::admin(OTHER_PHONE, "basic"))
            .await
            .unwrap_err();
        assert_eq!(err, Error::CodeSpaceExhausted { attempts: 64 });

        let other = ledger.config().identifier.normalize(OTHER_PHONE).unwrap();
        assert!(ledger.repository().find_account(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_on_issue_policy_sets_expiry_at_issue() {
        let settings = Settings {
            ledger: LedgerConfig::default().with_expiry_policy(ExpiryPolicy::OnIssue),
            ..Settings::default()
        };
        let (ledger, clock) = ledger_with(settings).await;

        let voucher = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();
        assert_eq!(voucher.expires_at, Some(t0() + Duration::minutes(60)));

        clock.advance(Duration::minutes(30));
        let grant = ledger.redeem(PHONE, voucher.code.as_str()).await.unwrap();
        assert_eq!(grant.session_minutes, Some(30));
        assert_eq!(grant.expires_at, Some(t0() + Duration::minutes(60)));
    }

    #[tokio::test]
    async fn test_validate_is_read_only() {
        let (ledger, clock) = ledger().await;
        let voucher = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();

        clock.advance(Duration::minutes(10));
        let entitlement = ledger.validate(PHONE, voucher.code.as_str()).await.unwrap();
        assert_eq!(entitlement.remaining_minutes, Some(60));
        assert_eq!(entitlement.status, VoucherStatus::Active);

        let stored = ledger
            .repository()
            .find_voucher(&voucher.code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, voucher);
    }

    #[tokio::test]
    async fn test_validate_reports_distinct_reasons() {
        let (ledger, _) = ledger().await;
        let voucher = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();

        let unknown = ledger.validate(PHONE, "ZZZZZZZZZZ").await.unwrap_err();
        assert_eq!(unknown.rejection(), Some(Rejection::UnknownCode));

        let wrong = ledger
            .validate(OTHER_PHONE, voucher.code.as_str())
            .await
            .unwrap_err();
        assert_eq!(wrong.rejection(), Some(Rejection::WrongAccount));
    }

    #[tokio::test]
    async fn test_code_input_is_canonicalized() {
        let (ledger, _) = ledger().await;
        let voucher = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();
        let typed = voucher.code.as_str().to_lowercase();

        assert!(ledger.validate("+255 712 345 678", &typed).await.is_ok());
    }

    #[tokio::test]
    async fn test_redeem_data_voucher_to_zero_then_terminal() {
        let (ledger, _) = ledger().await;
        let voucher = ledger.issue(IssueRequest::admin(PHONE, "data_500mb")).await.unwrap();

        let grant = ledger
            .redeem_with_usage(PHONE, voucher.code.as_str(), 200)
            .await
            .unwrap();
        assert_eq!(grant.remaining_data_mb, Some(300));
        assert_eq!(grant.session_minutes, None);

        let grant = ledger
            .redeem_with_usage(PHONE, voucher.code.as_str(), 300)
            .await
            .unwrap();
        assert_eq!(grant.remaining_data_mb, Some(0));

        let stored = ledger
            .repository()
            .find_voucher(&voucher.code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, VoucherStatus::Used);

        assert_eq!(
            ledger.redeem(PHONE, voucher.code.as_str()).await,
            Err(Error::AlreadyUsedTerminal)
        );
        assert_eq!(
            ledger.validate(PHONE, voucher.code.as_str()).await,
            Err(Error::AlreadyUsedTerminal)
        );
    }

    #[tokio::test]
    async fn test_last_partial_minute_still_granted() {
        let (sink, mut gateway) = ChannelGrantSink::channel();
        let (ledger, clock) = ledger().await;
        let ledger = ledger.with_grant_sink(Box::new(sink));
        let voucher = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();
        ledger.redeem(PHONE, voucher.code.as_str()).await.unwrap();
        gateway.recv().await.unwrap();

        clock.advance(Duration::seconds(59 * 60 + 30));
        let grant = ledger.redeem(PHONE, voucher.code.as_str()).await.unwrap();
        assert_eq!(grant.session_minutes, Some(1));
        assert!(gateway.recv().await.unwrap().grant_url.contains("session_duration=1"));
    }

    #[tokio::test]
    async fn test_redeem_losing_to_rival_grants_nothing() {
        let (sink, mut gateway) = ChannelGrantSink::channel();
        let ledger = contended_ledger(Contention::RivalFirst)
            .await
            .with_grant_sink(Box::new(sink));
        let voucher = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();

        let err = ledger.redeem(PHONE, voucher.code.as_str()).await.unwrap_err();
        assert!(matches!(err, Error::StorageConflict(_)));
        assert!(gateway.try_recv().is_err());

        // The rival's activation is the only one stored
        let stored = ledger.repository().find_voucher(&voucher.code).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.activated_at, Some(t0()));
        assert_eq!(stored.expires_at, Some(t0() + Duration::minutes(60)));
    }

    #[tokio::test]
    async fn test_redeem_gives_up_when_writes_keep_failing() {
        let (sink, mut gateway) = ChannelGrantSink::channel();
        let ledger = contended_ledger(Contention::AlwaysStale)
            .await
            .with_grant_sink(Box::new(sink));
        let voucher = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();

        let err = ledger.redeem(PHONE, voucher.code.as_str()).await.unwrap_err();
        assert!(matches!(err, Error::StorageConflict(_)));
        assert!(gateway.try_recv().is_err());

        let stored = ledger.repository().find_voucher(&voucher.code).await.unwrap().unwrap();
        assert_eq!(stored.revision, 0);
        assert_eq!(stored.activated_at, None);
    }

    #[tokio::test]
    async fn test_redeem_after_window_persists_expired() {
        let (ledger, clock) = ledger().await;
        let voucher = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();
        ledger.redeem(PHONE, voucher.code.as_str()).await.unwrap();

        clock.advance(Duration::minutes(61));
        assert_eq!(
            ledger.validate(PHONE, voucher.code.as_str()).await,
            Err(Error::Expired)
        );
        let stored = ledger.repository().find_voucher(&voucher.code).await.unwrap().unwrap();
        assert_eq!(stored.status, VoucherStatus::Active);

        assert_eq!(
            ledger.redeem(PHONE, voucher.code.as_str()).await,
            Err(Error::Expired)
        );
        let stored = ledger.repository().find_voucher(&voucher.code).await.unwrap().unwrap();
        assert_eq!(stored.status, VoucherStatus::Expired);
    }

    #[tokio::test]
    async fn test_expire_due_moves_only_closed_windows() {
        let (ledger, clock) = ledger().await;
        let used = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();
        let _unused = ledger.issue(IssueRequest::admin(PHONE, "basic")).await.unwrap();
        ledger.redeem(PHONE, used.code.as_str()).await.unwrap();

        clock.advance(Duration::minutes(90));
        assert_eq!(ledger.expire_due(PHONE).await.unwrap(), 1);
        assert_eq!(ledger.expire_due(PHONE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_grant_and_email_reach_collaborators() {
        let (mailer, mut outbox) = OutboxMailer::channel(SmtpConfig::default());
        let (sink, mut gateway) = ChannelGrantSink::channel();
        let (ledger, _) = ledger().await;
        let ledger = ledger
            .with_mailer(Box::new(mailer))
            .with_grant_sink(Box::new(sink));

        let voucher = ledger.issue_voucher(PHONE, "basic", "WIFI_0007").await.unwrap();
        let mail = outbox.recv().await.unwrap();
        assert_eq!(mail.to, "+255712345678");
        assert!(mail.body.contains(voucher.code.as_str()));

        ledger.redeem(PHONE, voucher.code.as_str()).await.unwrap();
        let grant = gateway.recv().await.unwrap();
        assert_eq!(grant.session_minutes, Some(60));
        assert!(grant.grant_url.contains("session_duration=60"));
    }

    #[tokio::test]
    async fn test_mail_failure_keeps_voucher() {
        let (mailer, outbox) = OutboxMailer::channel(SmtpConfig::default());
        drop(outbox);
        let (ledger, _) = ledger().await;
        let ledger = ledger.with_mailer(Box::new(mailer));

        let voucher = ledger.issue_voucher(PHONE, "basic", "WIFI_0008").await.unwrap();
        assert!(ledger
            .repository()
            .find_voucher(&voucher.code)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_register_account_is_idempotent() {
        let (ledger, clock) = ledger().await;
        let first = ledger
            .register_account(PHONE, Some("hash".to_string()))
            .await
            .unwrap();
        clock.advance(Duration::minutes(1));
        let second = ledger.register_account("+255712345678", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.credential_hash.as_deref(), Some("hash"));
    }

    #[tokio::test]
    async fn test_packages_lists_active_catalog() {
        let (ledger, _) = ledger().await;
        let ids: Vec<_> = ledger
            .packages()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["demo", "basic", "data_500mb"]);
    }

    #[tokio::test]
    async fn test_stats_totals() {
        let (ledger, clock) = ledger().await;
        ledger.issue_voucher(PHONE, "basic", "WIFI_0001").await.unwrap();
        ledger.record_payment(OTHER_PHONE, "basic", "WIFI_0002").await.unwrap();
        ledger.fail_payment("WIFI_0002").await.unwrap();

        let data = ledger.issue(IssueRequest::admin(PHONE, "data_500mb")).await.unwrap();
        ledger.redeem_with_usage(PHONE, data.code.as_str(), 500).await.unwrap();

        let timed = ledger.issue(IssueRequest::admin(OTHER_PHONE, "basic")).await.unwrap();
        ledger.redeem(OTHER_PHONE, timed.code.as_str()).await.unwrap();
        clock.advance(Duration::minutes(61));
        ledger.expire_due(OTHER_PHONE).await.unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.accounts, 2);
        assert_eq!(stats.vouchers_active, 1);
        assert_eq!(stats.vouchers_used, 1);
        assert_eq!(stats.vouchers_expired, 1);
        assert_eq!(stats.vouchers_total(), 3);
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.revenue_cents.get("TZS"), Some(&100_000));
    }
}
