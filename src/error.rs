//! Error types for the voucher ledger.

use std::fmt;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the voucher ledger.
///
/// Validation failures (`NotFound`, `AccountMismatch`, `Expired`,
/// `AlreadyUsedTerminal`, `DuplicateIssuance`) are reported as distinct
/// variants so the splash page can show an actionable message. Use
/// [`Error::rejection`] to map them to user-facing reasons.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The payment reference already produced a voucher.
    ///
    /// Returned when a payment webhook is delivered more than once.
    /// **Recovery:** None needed - the first delivery already issued the voucher.
    DuplicateIssuance {
        /// Payment reference that was already claimed
        reference: String,
    },

    /// No voucher with the given code exists.
    NotFound,

    /// The voucher exists but belongs to a different account.
    AccountMismatch,

    /// The voucher's time window has passed or its data allowance is gone.
    Expired,

    /// The voucher was fully consumed by earlier redemptions.
    AlreadyUsedTerminal,

    /// A concurrent write changed the voucher between read and write.
    ///
    /// The ledger re-reads and retries once before surfacing this.
    StorageConflict(String),

    /// Account identifier could not be normalized.
    ///
    /// Common causes:
    /// - Phone number with the wrong digit count or country code
    /// - Email address without a domain
    InvalidIdentifier(String),

    /// Requested package does not exist.
    PackageNotFound(String),

    /// Requested package exists but is not on sale.
    PackageInactive(String),

    /// Package definition is malformed (no duration and no data limit).
    InvalidPackage(String),

    /// Code generation kept colliding with stored codes.
    ///
    /// **Recovery:** Increase `code_length` in `LedgerConfig`.
    CodeSpaceExhausted {
        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// No transaction recorded under the given payment reference.
    TransactionNotFound(String),

    /// The payment collaborator already reported this payment as failed.
    PaymentFailed(String),

    /// Record could not be encoded for storage.
    SerializationError(String),

    /// Stored bytes could not be decoded into a record.
    DeserializationError(String),

    /// Stored record has a bad magic header.
    InvalidRecord(String),

    /// Stored record was written with a different schema version.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from stored record)
        found: u32,
    },

    /// Storage backend failure.
    ///
    /// Propagated as a generic service failure; never retried.
    RepositoryError(String),

    /// Invalid settings.
    ConfigError(String),

    /// Outbound collaborator (mail outbox, grant channel) refused the message.
    DeliveryError(String),
}

/// User-facing reason a splash-page login was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnknownCode,
    WrongAccount,
    Expired,
    UsedUp,
    AlreadyIssued,
}

impl Rejection {
    /// Message suitable for display on the captive-portal splash page.
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::UnknownCode => "Invalid voucher code. Please check the code and try again.",
            Rejection::WrongAccount => "Invalid voucher code for this account.",
            Rejection::Expired => "Voucher has expired. Please purchase a new voucher.",
            Rejection::UsedUp => "Voucher has been fully used. Please purchase a new voucher.",
            Rejection::AlreadyIssued => "A voucher was already issued for this payment.",
        }
    }
}

impl Error {
    /// Map a validation error to its user-facing reason.
    ///
    /// Returns `None` for infrastructure errors, which callers should report
    /// as a generic service failure.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Error::NotFound => Some(Rejection::UnknownCode),
            Error::AccountMismatch => Some(Rejection::WrongAccount),
            Error::Expired => Some(Rejection::Expired),
            Error::AlreadyUsedTerminal => Some(Rejection::UsedUp),
            Error::DuplicateIssuance { .. } => Some(Rejection::AlreadyIssued),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateIssuance { reference } => {
                write!(f, "Duplicate issuance for payment reference {}", reference)
            }
            Error::NotFound => write!(f, "Voucher not found"),
            Error::AccountMismatch => write!(f, "Voucher belongs to another account"),
            Error::Expired => write!(f, "Voucher expired"),
            Error::AlreadyUsedTerminal => write!(f, "Voucher already used"),
            Error::StorageConflict(msg) => write!(f, "Storage conflict: {}", msg),
            Error::InvalidIdentifier(msg) => write!(f, "Invalid identifier: {}", msg),
            Error::PackageNotFound(id) => write!(f, "Package not found: {}", id),
            Error::PackageInactive(id) => write!(f, "Package inactive: {}", id),
            Error::InvalidPackage(msg) => write!(f, "Invalid package: {}", msg),
            Error::CodeSpaceExhausted { attempts } => {
                write!(f, "No free voucher code after {} attempts", attempts)
            }
            Error::TransactionNotFound(reference) => {
                write!(f, "Transaction not found: {}", reference)
            }
            Error::PaymentFailed(reference) => write!(f, "Payment failed: {}", reference),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidRecord(msg) => write!(f, "Invalid record: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Record version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::RepositoryError(msg) => write!(f, "Repository error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::DeliveryError(msg) => write!(f, "Delivery error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ConfigError(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::ConfigError(format!("invalid grant URL: {}", e))
    }
}
