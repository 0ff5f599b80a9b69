//! Composite key layout: `[hash_key_len: u16 BE][hash_key][sort_key]`.
//!
//! The length prefix keeps all sort keys of one hash key contiguous in the
//! engine's byte order. The key with an empty hash key and an empty sort key
//! is reserved for the empty-write sentinel and is never a user record.

const HASH_KEY_LEN_BYTES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("hash key of {0} bytes exceeds the 65535 byte limit")]
    HashKeyTooLong(usize),
    #[error("raw key of {len} bytes is shorter than its hash key prefix")]
    Truncated { len: usize },
    #[error("hash key must not be empty")]
    EmptyHashKey,
}

pub fn generate_key(hash_key: &[u8], sort_key: &[u8]) -> Result<Vec<u8>, KeyError> {
    let hash_len =
        u16::try_from(hash_key.len()).map_err(|_| KeyError::HashKeyTooLong(hash_key.len()))?;
    let mut out = Vec::with_capacity(HASH_KEY_LEN_BYTES + hash_key.len() + sort_key.len());
    out.extend_from_slice(&hash_len.to_be_bytes());
    out.extend_from_slice(hash_key);
    out.extend_from_slice(sort_key);
    Ok(out)
}

/// Split a raw key back into `(hash_key, sort_key)`.
pub fn restore_key(raw: &[u8]) -> Result<(&[u8], &[u8]), KeyError> {
    if raw.len() < HASH_KEY_LEN_BYTES {
        return Err(KeyError::Truncated { len: raw.len() });
    }
    let hash_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    let rest = &raw[HASH_KEY_LEN_BYTES..];
    if rest.len() < hash_len {
        return Err(KeyError::Truncated { len: raw.len() });
    }
    Ok(rest.split_at(hash_len))
}

/// Validate a raw key supplied by a client for a user write.
pub fn check_user_key(raw: &[u8]) -> Result<(), KeyError> {
    let (hash_key, _) = restore_key(raw)?;
    if hash_key.is_empty() {
        return Err(KeyError::EmptyHashKey);
    }
    Ok(())
}

pub fn check_hash_key(hash_key: &[u8]) -> Result<(), KeyError> {
    if hash_key.is_empty() {
        return Err(KeyError::EmptyHashKey);
    }
    if hash_key.len() > u16::MAX as usize {
        return Err(KeyError::HashKeyTooLong(hash_key.len()));
    }
    Ok(())
}

/// Key of the empty-write sentinel record.
pub fn empty_write_key() -> Vec<u8> {
    vec![0; HASH_KEY_LEN_BYTES]
}

pub fn is_empty_write_key(raw: &[u8]) -> bool {
    raw.len() == HASH_KEY_LEN_BYTES && raw.iter().all(|b| *b == 0)
}
