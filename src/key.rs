//! Storage key utilities.

use crate::entity::Record;

/// Builder for storage keys.
pub struct RecordKey;

impl RecordKey {
    /// Build full storage key from record type and key.
    pub fn build<T: Record>(key: &T::Key) -> String {
        format!("{}:{}", T::record_prefix(), key)
    }

    /// Build the storage key of a record value.
    pub fn of<T: Record>(record: &T) -> String {
        Self::build::<T>(&record.record_key())
    }
}
