//! Key encoding utilities for `RocksDB`.

use z_metering_core::{JobId, TransactionId, UserId};

/// Create an account key from a user ID.
#[must_use]
pub fn account_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a job key from a job ID.
#[must_use]
pub fn job_key(job_id: &JobId) -> Vec<u8> {
    job_id.to_bytes().to_vec()
}

/// Create a user-scoped index key.
///
/// Format: `user_id (16 bytes) || id (16 bytes)`
///
/// Since ULIDs are time-ordered, entries for a user sort by creation time.
#[must_use]
pub fn user_scoped_key(user_id: &UserId, id: [u8; 16]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&id);
    key
}

/// Create a prefix for iterating all index entries of a user.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the trailing 16-byte id from a user-scoped index key.
///
/// Returns `None` if the key is not exactly 32 bytes.
#[must_use]
pub fn id_from_user_key(key: &[u8]) -> Option<[u8; 16]> {
    if key.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    Some(bytes)
}

/// Decode a 16-byte id key.
#[must_use]
pub fn id_from_key(key: &[u8]) -> Option<[u8; 16]> {
    <[u8; 16]>::try_from(key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_scoped_key_format() {
        let user_id = UserId::generate();
        let tx_id = TransactionId::generate();
        let key = user_scoped_key(&user_id, tx_id.to_bytes());

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], user_id.as_bytes());
        assert_eq!(id_from_user_key(&key), Some(tx_id.to_bytes()));
    }

    #[test]
    fn short_keys_are_rejected() {
        assert!(id_from_user_key(&[0u8; 16]).is_none());
        assert!(id_from_key(&[0u8; 15]).is_none());
    }

    #[test]
    fn job_key_decodes() {
        let job_id = JobId::generate();
        let key = job_key(&job_id);
        assert_eq!(id_from_key(&key).map(JobId::from_bytes), Some(job_id));
    }
}
