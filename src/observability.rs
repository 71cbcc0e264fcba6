//! Metrics hooks for ledger operations.
//!
//! Implement [`LedgerMetrics`] to feed counters and histograms into your
//! monitoring system:
//!
//! ```ignore
//! use voucher_ledger::observability::LedgerMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl LedgerMetrics for PrometheusMetrics {
//!     fn record_redeemed(&self, _code: &str, _duration: Duration) {
//!         // counter!("vouchers_redeemed").inc();
//!     }
//!     // ... implement other methods
//! }
//!
//! // let ledger = VoucherLedger::new(repo, &settings)?
//! //     .with_metrics(Box::new(PrometheusMetrics));
//! ```
//!
//! The ledger defaults to [`NoOpMetrics`]. [`LogMetrics`] keeps the default
//! method bodies, which write through the `log` crate.

use std::time::Duration;

/// Trait for ledger metrics collection.
pub trait LedgerMetrics: Send + Sync {
    /// Record a newly issued voucher.
    fn record_issued(&self, code: &str, duration: Duration) {
        debug!("Ledger ISSUE: {} took {:?}", code, duration);
    }

    /// Record a successful redemption (one grant signal).
    fn record_redeemed(&self, code: &str, duration: Duration) {
        debug!("Ledger REDEEM: {} took {:?}", code, duration);
    }

    /// Record a refused validate/redeem with its reason.
    fn record_rejected(&self, code: &str, reason: &str) {
        debug!("Ledger REJECT: {} ({})", code, reason);
    }

    /// Record a lost compare-and-swap race.
    fn record_conflict(&self, code: &str) {
        warn!("Ledger CONFLICT on {}", code);
    }

    /// Record an infrastructure or collaborator failure.
    fn record_error(&self, subject: &str, error: &str) {
        warn!("Ledger ERROR for {}: {}", subject, error);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl LedgerMetrics for NoOpMetrics {
    fn record_issued(&self, _code: &str, _duration: Duration) {}
    fn record_redeemed(&self, _code: &str, _duration: Duration) {}
    fn record_rejected(&self, _code: &str, _reason: &str) {}
    fn record_conflict(&self, _code: &str) {}
    fn record_error(&self, _subject: &str, _error: &str) {}
}

/// Metrics written to the `log` facade.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl LedgerMetrics for LogMetrics {}
