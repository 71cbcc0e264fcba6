//! Account identifier normalization.
//!
//! Accounts are keyed by either a mobile number or an email address. A
//! deployment picks exactly one [`IdentifierKind`]; every identifier passes
//! through [`IdentifierKind::normalize`] before any lookup or comparison, so
//! `"0712 345 678"` and `"+255712345678"` reach the ledger as the same
//! [`AccountId`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Digits in a national mobile number after the country code.
const NATIONAL_DIGITS: usize = 9;

/// Which identifier a deployment uses for accounts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentifierKind {
    /// E.164 mobile numbers under a single country code (e.g. `"255"`).
    Phone { country_code: String },
    /// Case-insensitive email addresses.
    Email,
}

impl Default for IdentifierKind {
    fn default() -> Self {
        IdentifierKind::Phone {
            country_code: "255".to_string(),
        }
    }
}

/// Normalized account identifier.
///
/// Only constructed through [`IdentifierKind::normalize`], so two equal
/// `AccountId`s always denote the same account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl IdentifierKind {
    /// Normalize a raw identifier into an [`AccountId`].
    ///
    /// Pure: returns a new value and never mutates the input.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentifier` when the input cannot be a valid
    /// identifier of this kind.
    pub fn normalize(&self, raw: &str) -> Result<AccountId> {
        match self {
            IdentifierKind::Phone { country_code } => normalize_phone(raw, country_code),
            IdentifierKind::Email => normalize_email(raw),
        }
    }
}

/// Normalize a mobile number to `+<country><national>`.
///
/// Accepts `+255712345678`, `255712345678`, `0712345678` and `712345678`,
/// with spaces, dashes, dots or parentheses anywhere.
pub fn normalize_phone(raw: &str, country_code: &str) -> Result<AccountId> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let mut digits = String::with_capacity(trimmed.len());

    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            '+' if i == 0 => {}
            other => {
                return Err(Error::InvalidIdentifier(format!(
                    "unexpected character {:?} in phone number",
                    other
                )))
            }
        }
    }

    let national = if let Some(rest) = digits.strip_prefix(country_code) {
        if rest.len() == NATIONAL_DIGITS {
            rest
        } else if has_plus {
            return Err(Error::InvalidIdentifier(format!(
                "expected {} digits after +{}",
                NATIONAL_DIGITS, country_code
            )));
        } else {
            digits.strip_prefix('0').unwrap_or(&digits)
        }
    } else if has_plus {
        return Err(Error::InvalidIdentifier(format!(
            "country code must be +{}",
            country_code
        )));
    } else {
        digits.strip_prefix('0').unwrap_or(&digits)
    };

    if national.len() != NATIONAL_DIGITS || national.starts_with('0') {
        return Err(Error::InvalidIdentifier(format!(
            "phone number must have {} national digits",
            NATIONAL_DIGITS
        )));
    }

    Ok(AccountId(format!("+{}{}", country_code, national)))
}

/// Normalize an email address: trimmed and lowercased, `local@domain.tld`.
pub fn normalize_email(raw: &str) -> Result<AccountId> {
    let email = raw.trim().to_lowercase();

    let (local, domain) = email
        .split_once('@')
        .ok_or_else(|| Error::InvalidIdentifier("email must contain '@'".to_string()))?;

    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return Err(Error::InvalidIdentifier(format!(
            "malformed email address {:?}",
            raw.trim()
        )));
    }

    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() => Ok(AccountId(email)),
        _ => Err(Error::InvalidIdentifier(format!(
            "email domain {:?} has no top-level domain",
            domain
        ))),
    }
}
