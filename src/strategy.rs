//! Expiry policies: when a voucher's clock starts.
//!
//! | Policy | `expires_at` set at | Use Case |
//! |--------|---------------------|----------|
//! | **OnFirstUse** | first redemption | Default; buyers do not lose time between purchase and login |
//! | **OnIssue** | issuance | Promotional grants that must be used within a window |
//!
//! Pure data vouchers (no duration) never get an `expires_at` under either policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Policy controlling when `expires_at` is computed.
///
/// # Examples
///
/// ```
/// use voucher_ledger::strategy::ExpiryPolicy;
///
/// assert_eq!(ExpiryPolicy::default(), ExpiryPolicy::OnFirstUse);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Clock starts at the first redemption.
    #[default]
    OnFirstUse,

    /// Clock starts at issuance.
    OnIssue,
}

impl ExpiryPolicy {
    /// Expiry to store on a freshly issued voucher.
    pub fn expiry_at_issue(
        &self,
        issued_at: DateTime<Utc>,
        duration_minutes: Option<u32>,
    ) -> Option<DateTime<Utc>> {
        match self {
            ExpiryPolicy::OnFirstUse => None,
            ExpiryPolicy::OnIssue => {
                duration_minutes.map(|m| issued_at + Duration::minutes(i64::from(m)))
            }
        }
    }
}

impl std::fmt::Display for ExpiryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpiryPolicy::OnFirstUse => write!(f, "OnFirstUse"),
            ExpiryPolicy::OnIssue => write!(f, "OnIssue"),
        }
    }
}
