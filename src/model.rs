//! Ledger records: accounts, packages, vouchers and payment transactions.

use crate::entity::Record;
use crate::error::{Error, Result};
use crate::identifier::AccountId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Voucher code as printed in the email and typed on the splash page.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoucherCode(String);

impl VoucherCode {
    pub fn new(code: impl Into<String>) -> Self {
        VoucherCode(code.into())
    }

    /// Canonicalize user input: trimmed, uppercased, inner spaces removed.
    pub fn from_input(raw: &str) -> Self {
        VoucherCode(
            raw.chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_uppercase(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoucherCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payment gateway reference; unique per payment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentReference(String);

impl PaymentReference {
    pub fn new(reference: impl Into<String>) -> Self {
        PaymentReference(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Account
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub credential_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record for Account {
    type Key = AccountId;

    fn record_key(&self) -> Self::Key {
        self.id.clone()
    }

    fn record_prefix() -> &'static str {
        "account"
    }
}

// ============================================================================
// Package
// ============================================================================

/// Purchasable bundle of time and/or data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    /// `None` for pure data bundles.
    pub duration_minutes: Option<u32>,
    /// `None` for pure time bundles.
    pub data_limit_mb: Option<u64>,
    pub price_cents: u64,
    pub currency: String,
    pub active: bool,
}

impl Package {
    /// Human summary used in the voucher email, e.g. `"60 minutes and 1024MB of data"`.
    pub fn summary(&self) -> String {
        match (self.duration_minutes, self.data_limit_mb) {
            (Some(minutes), Some(mb)) => format!("{} minutes and {}MB of data", minutes, mb),
            (Some(minutes), None) => format!("{} minutes, unlimited data", minutes),
            (None, Some(mb)) => format!("{}MB of data", mb),
            (None, None) => "no allowance".to_string(),
        }
    }
}

impl Record for Package {
    type Key = String;

    fn record_key(&self) -> Self::Key {
        self.id.clone()
    }

    fn record_prefix() -> &'static str {
        "package"
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidPackage("package id is empty".to_string()));
        }
        match (self.duration_minutes, self.data_limit_mb) {
            (None, None) => Err(Error::InvalidPackage(format!(
                "package {} has neither duration nor data limit",
                self.id
            ))),
            (Some(0), _) => Err(Error::InvalidPackage(format!(
                "package {} has zero duration",
                self.id
            ))),
            (_, Some(0)) => Err(Error::InvalidPackage(format!(
                "package {} has zero data limit",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Voucher
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoucherStatus {
    Active,
    Used,
    Expired,
}

impl VoucherStatus {
    /// Used and Expired never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VoucherStatus::Active)
    }
}

impl fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoucherStatus::Active => write!(f, "active"),
            VoucherStatus::Used => write!(f, "used"),
            VoucherStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Why a voucher was issued.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSource {
    /// Confirmed payment; the reference guards against duplicate webhooks.
    Payment { reference: PaymentReference },
    /// Free trial grant.
    Demo,
    /// Manual grant by an administrator.
    Admin,
}

impl IssueSource {
    pub fn reference(&self) -> Option<&PaymentReference> {
        match self {
            IssueSource::Payment { reference } => Some(reference),
            _ => None,
        }
    }
}

/// Access voucher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: Uuid,
    pub code: VoucherCode,
    pub account: AccountId,
    pub package_id: String,
    pub duration_minutes: Option<u32>,
    pub data_limit_mb: Option<u64>,
    pub status: VoucherStatus,
    pub source: IssueSource,
    pub issued_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_data_mb: Option<u64>,
    /// Bumped by the repository on every compare-and-swap.
    pub revision: u64,
}

impl Voucher {
    /// Whether the time window closed at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn data_exhausted(&self) -> bool {
        self.remaining_data_mb == Some(0)
    }

    /// Classify the voucher for a login attempt at `now`.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyUsedTerminal`: status is Used
    /// - `Error::Expired`: status is Expired, the window closed, or no data is left
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            VoucherStatus::Used => Err(Error::AlreadyUsedTerminal),
            VoucherStatus::Expired => Err(Error::Expired),
            VoucherStatus::Active if self.is_due(now) || self.data_exhausted() => {
                Err(Error::Expired)
            }
            VoucherStatus::Active => Ok(()),
        }
    }

    /// Start the clock on first use. No-op once activated.
    pub fn activate(&mut self, now: DateTime<Utc>) {
        if self.activated_at.is_some() {
            return;
        }
        self.activated_at = Some(now);
        if self.expires_at.is_none() {
            self.expires_at = self
                .duration_minutes
                .map(|minutes| now + Duration::minutes(i64::from(minutes)));
        }
    }

    /// Subtract used data; flips to Used when the allowance reaches zero.
    pub fn consume_data(&mut self, used_mb: u64) {
        if let Some(remaining) = self.remaining_data_mb {
            let left = remaining.saturating_sub(used_mb);
            self.remaining_data_mb = Some(left);
            if left == 0 {
                self.status = VoucherStatus::Used;
            }
        }
    }

    /// Remaining allowance at `now`, without changing anything.
    pub fn entitlement(&self, now: DateTime<Utc>) -> Entitlement {
        let remaining_minutes = match (self.expires_at, self.duration_minutes) {
            // Partial minutes round up: a voucher that is still open never grants 0.
            (Some(at), _) => {
                let seconds = (at - now).num_seconds().max(0) as u64;
                Some(seconds.div_ceil(60))
            }
            (None, Some(minutes)) => Some(u64::from(minutes)),
            (None, None) => None,
        };

        Entitlement {
            code: self.code.clone(),
            status: self.status,
            remaining_minutes,
            remaining_data_mb: self.remaining_data_mb,
            expires_at: self.expires_at,
        }
    }

    #[cfg(test)]
    pub(crate) fn sample(code: VoucherCode, issued_at: DateTime<Utc>) -> Self {
        Voucher {
            id: Uuid::now_v7(),
            code,
            account: crate::identifier::IdentifierKind::Email
                .normalize("sample@example.com")
                .expect("valid email"),
            package_id: "basic".to_string(),
            duration_minutes: Some(60),
            data_limit_mb: None,
            status: VoucherStatus::Active,
            source: IssueSource::Admin,
            issued_at,
            activated_at: None,
            expires_at: None,
            remaining_data_mb: None,
            revision: 0,
        }
    }
}

impl Record for Voucher {
    type Key = VoucherCode;

    fn record_key(&self) -> Self::Key {
        self.code.clone()
    }

    fn record_prefix() -> &'static str {
        "voucher"
    }

    fn validate(&self) -> Result<()> {
        if self.duration_minutes.is_none() && self.data_limit_mb.is_none() {
            return Err(Error::InvalidRecord(format!(
                "voucher {} carries no allowance",
                self.code
            )));
        }
        if self.remaining_data_mb > self.data_limit_mb {
            return Err(Error::InvalidRecord(format!(
                "voucher {} has more data left than its limit",
                self.code
            )));
        }
        Ok(())
    }
}

/// What a voucher still grants. Returned by validate and redeem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub code: VoucherCode,
    pub status: VoucherStatus,
    /// `None` for pure data vouchers.
    pub remaining_minutes: Option<u64>,
    /// `None` for pure time vouchers.
    pub remaining_data_mb: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Payment record owned by the payment collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub reference: PaymentReference,
    pub account: AccountId,
    pub amount_cents: u64,
    pub currency: String,
    pub status: TransactionStatus,
    /// Set exactly once, when the voucher for this payment is stored.
    pub voucher_code: Option<VoucherCode>,
    pub created_at: DateTime<Utc>,
}

impl Record for Transaction {
    type Key = PaymentReference;

    fn record_key(&self) -> Self::Key {
        self.reference.clone()
    }

    fn record_prefix() -> &'static str {
        "txn"
    }

    fn validate(&self) -> Result<()> {
        if self.voucher_code.is_some() && self.status != TransactionStatus::Completed {
            return Err(Error::InvalidRecord(format!(
                "transaction {} links a voucher but is not completed",
                self.reference
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Ledger totals for the administrator dashboard.
///
/// Voucher counts are by stored status: an Active voucher whose window closed
/// but was never swept still counts as Active.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub accounts: u64,
    pub vouchers_active: u64,
    pub vouchers_used: u64,
    pub vouchers_expired: u64,
    pub transactions: u64,
    /// Sum of Completed transaction amounts, keyed by currency.
    pub revenue_cents: BTreeMap<String, u64>,
}

impl LedgerStats {
    pub fn vouchers_total(&self) -> u64 {
        self.vouchers_active + self.vouchers_used + self.vouchers_expired
    }

    pub(crate) fn count_voucher(&mut self, status: VoucherStatus) {
        match status {
            VoucherStatus::Active => self.vouchers_active += 1,
            VoucherStatus::Used => self.vouchers_used += 1,
            VoucherStatus::Expired => self.vouchers_expired += 1,
        }
    }

    pub(crate) fn count_transaction(&mut self, transaction: &Transaction) {
        self.transactions += 1;
        if transaction.status == TransactionStatus::Completed {
            *self
                .revenue_cents
                .entry(transaction.currency.clone())
                .or_default() += transaction.amount_cents;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_code_from_input_canonicalizes() {
        assert_eq!(VoucherCode::from_input(" abcd efgh23 ").as_str(), "ABCDEFGH23");
    }

    #[test]
    fn test_activate_sets_expiry_once() {
        let mut voucher = Voucher::sample(VoucherCode::new("ABCDEFGH23"), t0());

        voucher.activate(t0() + Duration::minutes(5));
        assert_eq!(voucher.expires_at, Some(t0() + Duration::minutes(65)));

        voucher.activate(t0() + Duration::minutes(30));
        assert_eq!(voucher.activated_at, Some(t0() + Duration::minutes(5)));
        assert_eq!(voucher.expires_at, Some(t0() + Duration::minutes(65)));
    }

    #[test]
    fn test_activate_keeps_expiry_set_at_issue() {
        let mut voucher = Voucher::sample(VoucherCode::new("ABCDEFGH23"), t0());
        voucher.expires_at = Some(t0() + Duration::minutes(60));

        voucher.activate(t0() + Duration::minutes(10));
        assert_eq!(voucher.expires_at, Some(t0() + Duration::minutes(60)));
    }

    #[test]
    fn test_consume_data_to_zero_marks_used() {
        let mut voucher = Voucher::sample(VoucherCode::new("ABCDEFGH23"), t0());
        voucher.data_limit_mb = Some(500);
        voucher.remaining_data_mb = Some(500);

        voucher.consume_data(200);
        assert_eq!(voucher.remaining_data_mb, Some(300));
        assert_eq!(voucher.status, VoucherStatus::Active);

        voucher.consume_data(1000);
        assert_eq!(voucher.remaining_data_mb, Some(0));
        assert_eq!(voucher.status, VoucherStatus::Used);
    }

    #[test]
    fn test_check_usable_classifies() {
        let mut voucher = Voucher::sample(VoucherCode::new("ABCDEFGH23"), t0());
        assert!(voucher.check_usable(t0()).is_ok());

        voucher.expires_at = Some(t0() + Duration::minutes(60));
        assert_eq!(
            voucher.check_usable(t0() + Duration::minutes(60)),
            Err(Error::Expired)
        );

        voucher.status = VoucherStatus::Used;
        assert_eq!(voucher.check_usable(t0()), Err(Error::AlreadyUsedTerminal));
    }

    #[test]
    fn test_entitlement_before_and_after_activation() {
        let mut voucher = Voucher::sample(VoucherCode::new("ABCDEFGH23"), t0());
        assert_eq!(voucher.entitlement(t0()).remaining_minutes, Some(60));

        voucher.activate(t0());
        let later = voucher.entitlement(t0() + Duration::minutes(45));
        assert_eq!(later.remaining_minutes, Some(15));

        let last_minute = voucher.entitlement(t0() + Duration::seconds(59 * 60 + 30));
        assert_eq!(last_minute.remaining_minutes, Some(1));
        assert_eq!(voucher.entitlement(t0() + Duration::minutes(61)).remaining_minutes, Some(0));
        assert_eq!(later.remaining_data_mb, None);
    }

    #[test]
    fn test_package_validation() {
        let mut package = Package {
            id: "basic".to_string(),
            name: "Basic Access".to_string(),
            duration_minutes: Some(60),
            data_limit_mb: None,
            price_cents: 100_000,
            currency: "TZS".to_string(),
            active: true,
        };
        assert!(package.validate().is_ok());
        assert_eq!(package.summary(), "60 minutes, unlimited data");

        package.duration_minutes = None;
        assert!(matches!(package.validate(), Err(Error::InvalidPackage(_))));

        package.data_limit_mb = Some(1024);
        assert_eq!(package.summary(), "1024MB of data");
    }
}
