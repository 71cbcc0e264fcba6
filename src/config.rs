//! Explicit settings passed into the ledger and its collaborators.
//!
//! Nothing here reads process-wide state. Callers load [`Settings`] however
//! they like (the JSON helper covers the common case) and hand it over.
//!
//! ```
//! use voucher_ledger::config::Settings;
//!
//! let settings = Settings::from_json(r#"{
//!     "ledger": { "identifier": { "kind": "email" }, "code_length": 12 },
//!     "grant": { "base_grant_url": "https://portal.example.net/guest/s/default/" }
//! }"#).unwrap();
//!
//! assert_eq!(settings.ledger.code_length, 12);
//! assert_eq!(settings.smtp.port, 587);
//! ```

use crate::code::{CodeGenerator, DEFAULT_ALPHABET, DEFAULT_CODE_LENGTH};
use crate::error::{Error, Result};
use crate::identifier::IdentifierKind;
use crate::strategy::ExpiryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// All settings for one deployment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ledger: LedgerConfig,
    pub smtp: SmtpConfig,
    pub grant: GrantConfig,
}

impl Settings {
    /// Parse and validate settings from JSON. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for malformed JSON or invalid values.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.ledger.validate()?;
        self.smtp.validate()?;
        self.grant.validate()
    }
}

/// Ledger behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Identifier kind for accounts. One per deployment.
    pub identifier: IdentifierKind,
    pub code_length: usize,
    pub code_alphabet: String,
    /// Collision retries before `Error::CodeSpaceExhausted`.
    pub max_code_attempts: u32,
    pub expiry_policy: ExpiryPolicy,
    /// Re-reads after a lost compare-and-swap before `Error::StorageConflict`.
    pub conflict_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            identifier: IdentifierKind::default(),
            code_length: DEFAULT_CODE_LENGTH,
            code_alphabet: DEFAULT_ALPHABET.to_string(),
            max_code_attempts: 8,
            expiry_policy: ExpiryPolicy::default(),
            conflict_retries: 1,
        }
    }
}

impl LedgerConfig {
    pub fn with_identifier(mut self, identifier: IdentifierKind) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_expiry_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.expiry_policy = policy;
        self
    }

    pub fn with_code_length(mut self, length: usize) -> Self {
        self.code_length = length;
        self
    }

    /// Code generator described by this config.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an unusable alphabet or length.
    pub fn code_generator(&self) -> Result<CodeGenerator> {
        CodeGenerator::new(&self.code_alphabet, self.code_length)
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` for invalid values.
    pub fn validate(&self) -> Result<()> {
        self.code_generator()?;
        if self.max_code_attempts == 0 {
            return Err(Error::ConfigError(
                "max_code_attempts must be positive".to_string(),
            ));
        }
        if let IdentifierKind::Phone { country_code } = &self.identifier {
            if country_code.is_empty() || !country_code.chars().all(|c| c.is_ascii_digit()) {
                return Err(Error::ConfigError(format!(
                    "country code {:?} must be digits",
                    country_code
                )));
            }
        }
        Ok(())
    }
}

/// Outgoing mail settings for the voucher email.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender_email: String,
    /// Closing line of every email.
    pub signature: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            server: "smtp.gmail.com".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            sender_email: "no-reply@localhost".to_string(),
            signature: "Wi-Fi Support Team".to_string(),
        }
    }
}

impl SmtpConfig {
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for a missing server or sender address.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::ConfigError("smtp.server is empty".to_string()));
        }
        if !self.sender_email.contains('@') {
            return Err(Error::ConfigError(format!(
                "smtp.sender_email {:?} is not an address",
                self.sender_email
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("sender_email", &self.sender_email)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Captive-portal grant URL settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantConfig {
    /// Base URL the splash page redirects to after a successful redeem.
    pub base_grant_url: String,
    pub user_param: String,
    pub duration_param: String,
}

impl Default for GrantConfig {
    fn default() -> Self {
        GrantConfig {
            base_grant_url: "http://localhost/guest/s/default/".to_string(),
            user_param: "user_id".to_string(),
            duration_param: "session_duration".to_string(),
        }
    }
}

impl GrantConfig {
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the base URL does not parse.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_grant_url)?;
        if url.cannot_be_a_base() {
            return Err(Error::ConfigError(format!(
                "grant URL {} cannot take query parameters",
                self.base_grant_url
            )));
        }
        Ok(())
    }
}
