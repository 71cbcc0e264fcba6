//! Outbound collaborators: voucher email and access grant.
//!
//! The ledger only knows the two traits below. Real SMTP delivery and the
//! captive-portal gateway call live outside the crate; the provided
//! implementations hand messages to them over tokio channels, or just log.

use crate::error::Result;
use crate::identifier::AccountId;
use crate::model::{IssueSource, VoucherCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod grant;
pub mod mailer;

pub use grant::{ChannelGrantSink, GrantUrlBuilder, LogGrantSink};
pub use mailer::{EmailMessage, LogMailer, OutboxMailer};

/// Everything needed to tell an account about its new voucher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoucherEmail {
    pub to: AccountId,
    pub code: VoucherCode,
    pub package_name: String,
    /// E.g. `"60 minutes, unlimited data"`.
    pub package_summary: String,
    pub source: IssueSource,
}

/// Authorization handed to the network gateway after a successful redeem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub account: AccountId,
    pub code: VoucherCode,
    /// Session length to authorize; `None` for pure data vouchers.
    pub session_minutes: Option<u64>,
    pub remaining_data_mb: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Where the splash page sends the client next.
    pub grant_url: String,
}

/// Sends the voucher email.
///
/// Fire-and-forget from the ledger's point of view: an `Err` is logged and
/// counted, and the voucher stays issued.
pub trait Mailer: Send + Sync {
    /// # Errors
    /// Returns `Error::DeliveryError` if the message could not be handed off
    fn send_voucher_email(&self, email: &VoucherEmail) -> Result<()>;
}

/// Receives the grant signal of a successful redeem.
pub trait GrantSink: Send + Sync {
    /// # Errors
    /// Returns `Error::DeliveryError` if the gateway side is gone
    fn grant(&self, grant: &AccessGrant) -> Result<()>;
}
