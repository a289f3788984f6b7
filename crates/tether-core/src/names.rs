use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::CoreError;

/// Prefix of the storage slot used by the storage-event transport.
pub const STORAGE_KEY_PREFIX: &str = "tether.channel-";

/// Validates and trims an app-level channel name.
pub fn normalize_channel_name(name: &str) -> Result<String, CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidInput("channel name must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Computes BLAKE3 and returns the 32-byte digest.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Derives the persistent-store table for a channel:
/// `"bc_" || hex(H("tether-store" || name)[..8])`.
///
/// Hashing keeps arbitrary channel names out of SQL identifiers.
pub fn store_table_name(channel_name: &str) -> String {
    let mut buf = Vec::with_capacity(12 + channel_name.len());
    buf.extend_from_slice(b"tether-store");
    buf.extend_from_slice(channel_name.as_bytes());
    let digest = blake3_32(&buf);
    format!("bc_{}", hex::encode(&digest[..8]))
}

/// Well-known storage slot for a channel.
pub fn storage_key(channel_name: &str) -> String {
    format!("{STORAGE_KEY_PREFIX}{channel_name}")
}

/// Random alphanumeric token used to tag storage-event records.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{normalize_channel_name, random_token, storage_key, store_table_name};

    #[test]
    fn channel_name_normalization_trims_and_rejects_empty() {
        assert_eq!(
            normalize_channel_name("  tether ").expect("name should be valid"),
            "tether"
        );
        assert!(normalize_channel_name("   ").is_err());
    }

    #[test]
    fn table_names_are_stable_and_sql_safe() {
        let a = store_table_name("tabs\"; DROP TABLE x; --");
        assert_eq!(a, store_table_name("tabs\"; DROP TABLE x; --"));
        assert_eq!(a.len(), 3 + 16);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert_ne!(store_table_name("a"), store_table_name("b"));
    }

    #[test]
    fn storage_key_is_prefixed() {
        assert_eq!(storage_key("tabs"), "tether.channel-tabs");
    }

    #[test]
    fn tokens_are_random_alphanumerics() {
        let a = random_token();
        let b = random_token();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
