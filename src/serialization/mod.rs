//! Postcard-based record encoding with versioned envelopes.
//!
//! Every stored ledger record follows this format:
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (4 bytes)│POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "VLDG"              u32              postcard::to_allocvec(T)
//! ```
//!
//! A record written by a different schema version is rejected with
//! `Error::VersionMismatch` instead of being silently misread.
//!
//! # Example
//!
//! ```rust
//! use voucher_ledger::serialization::{encode_record, decode_record};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Row {
//!     id: u64,
//!     name: String,
//! }
//!
//! # fn main() -> voucher_ledger::Result<()> {
//! let row = Row { id: 1, name: "basic".to_string() };
//! let bytes = encode_record(&row)?;
//! let decoded: Row = decode_record(&bytes)?;
//! assert_eq!(row, decoded);
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Magic header for ledger records: b"VLDG"
pub const RECORD_MAGIC: [u8; 4] = *b"VLDG";

/// Current schema version.
///
/// Increment when a stored record type changes shape (fields added, removed,
/// reordered, retyped, or enum variants changed).
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope around every stored record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordEnvelope<T> {
    /// Magic header: must be b"VLDG"
    pub magic: [u8; 4],
    /// Schema version: must match CURRENT_SCHEMA_VERSION
    pub version: u32,
    /// The record itself
    pub payload: T,
}

impl<T> RecordEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            magic: RECORD_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// Encode a record with envelope for storage.
///
/// # Errors
///
/// Returns `Error::SerializationError` if Postcard serialization fails.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let envelope = RecordEnvelope::new(value);
    postcard::to_allocvec(&envelope).map_err(|e| {
        error!("Record serialization failed: {}", e);
        Error::SerializationError(e.to_string())
    })
}

/// Decode a stored record, validating magic and version.
///
/// # Errors
///
/// - `Error::InvalidRecord`: Invalid magic header
/// - `Error::VersionMismatch`: Schema version mismatch
/// - `Error::DeserializationError`: Corrupted Postcard payload
pub fn decode_record<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    let envelope: RecordEnvelope<T> = postcard::from_bytes(bytes).map_err(|e| {
        error!("Record deserialization failed: {}", e);
        Error::DeserializationError(e.to_string())
    })?;

    if envelope.magic != RECORD_MAGIC {
        warn!(
            "Invalid record: expected magic {:?}, got {:?}",
            RECORD_MAGIC, envelope.magic
        );
        return Err(Error::InvalidRecord(format!(
            "Invalid magic: expected {:?}, got {:?}",
            RECORD_MAGIC, envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        warn!(
            "Record version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION, envelope.version
        );
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}
