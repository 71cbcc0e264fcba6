//! # voucher-ledger
//!
//! Voucher ledger for a pay-per-use Wi-Fi hotspot: issues vouchers against
//! confirmed payments, validates them at the captive portal and redeems them
//! into network access grants.
//!
//! ## Features
//!
//! - **Idempotent issuance:** one voucher per payment reference, however often the webhook fires
//! - **Race-free redemption:** revision-checked compare-and-swap, exactly one grant per redeem
//! - **Injectable time:** every expiry decision reads a [`clock::Clock`]
//! - **Pluggable storage:** implement [`LedgerRepository`] for your database
//! - **Side effects at the edge:** mail and grant delivery behind [`notify::Mailer`] and [`notify::GrantSink`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use voucher_ledger::{
//!     LedgerService, VoucherLedger, InMemoryRepository,
//!     config::Settings, model::Package,
//! };
//!
//! let ledger = VoucherLedger::new(InMemoryRepository::new(), &Settings::default())?;
//! ledger.save_package(&Package {
//!     id: "basic".to_string(),
//!     name: "Basic Access".to_string(),
//!     duration_minutes: Some(60),
//!     data_limit_mb: None,
//!     price_cents: 100_000,
//!     currency: "TZS".to_string(),
//!     active: true,
//! }).await?;
//!
//! let service = LedgerService::new(ledger);
//!
//! // payment confirmed
//! let voucher = service.issue_voucher("0712345678", "basic", "WIFI_1A2B3C4D").await?;
//!
//! // customer logs in on the splash page
//! let grant = service.redeem("0712345678", voucher.code.as_str()).await?;
//! println!("redirect to {}", grant.grant_url);
//! ```

#[macro_use]
extern crate log;

pub mod clock;
pub mod code;
pub mod config;
pub mod entity;
pub mod error;
pub mod identifier;
pub mod key;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod observability;
pub mod repository;
pub mod serialization;
pub mod service;
pub mod strategy;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use entity::Record;
pub use error::{Error, Rejection, Result};
pub use identifier::{AccountId, IdentifierKind};
pub use ledger::{IssueRequest, VoucherLedger};
pub use model::{Entitlement, LedgerStats, Package, Voucher, VoucherCode, VoucherStatus};
pub use notify::{AccessGrant, GrantSink, Mailer};
pub use repository::{InMemoryRepository, LedgerRepository};
pub use service::LedgerService;
pub use strategy::ExpiryPolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
