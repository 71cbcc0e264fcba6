//! Core record trait that all stored ledger records implement.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Trait implemented by every record the repository stores.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use voucher_ledger::entity::Record;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// pub struct Note {
///     pub id: String,
///     pub body: String,
/// }
///
/// impl Record for Note {
///     type Key = String;
///
///     fn record_key(&self) -> Self::Key {
///         self.id.clone()
///     }
///
///     fn record_prefix() -> &'static str {
///         "note"
///     }
/// }
/// ```
pub trait Record: Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone {
    /// Type of the record's natural key.
    type Key: Display + Clone + Send + Sync;

    /// Return the record's unique key.
    fn record_key(&self) -> Self::Key;

    /// Namespace for this record type. Final storage key: `"{prefix}:{key}"`.
    fn record_prefix() -> &'static str;

    /// Encode for storage as a versioned postcard envelope.
    fn encode(&self) -> Result<Vec<u8>> {
        crate::serialization::encode_record(self)
    }

    /// Decode from storage, checking magic and schema version.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidRecord`: Bad magic or corrupted envelope
    /// - `Error::VersionMismatch`: Schema version changed
    /// - `Error::DeserializationError`: Corrupted payload
    fn decode(bytes: &[u8]) -> Result<Self> {
        let record: Self = crate::serialization::decode_record(bytes)?;
        record.validate()?;
        Ok(record)
    }

    /// Optional: check internal consistency after decoding or before saving.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Record for Note {
        type Key = String;

        fn record_key(&self) -> Self::Key {
            self.id.clone()
        }

        fn record_prefix() -> &'static str {
            "note"
        }

        fn validate(&self) -> Result<()> {
            if self.body.is_empty() {
                return Err(Error::InvalidRecord("empty note".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_encode_decode() {
        let note = Note {
            id: "n1".to_string(),
            body: "hello".to_string(),
        };

        let bytes = note.encode().unwrap();
        assert_eq!(Note::decode(&bytes).unwrap(), note);
    }

    #[test]
    fn test_decode_runs_validation() {
        let note = Note {
            id: "n1".to_string(),
            body: String::new(),
        };

        let bytes = note.encode().unwrap();
        assert!(Note::decode(&bytes).is_err());
    }
}
