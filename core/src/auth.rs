use sha2::{Digest, Sha256};

/// Prefix of owner API keys.
pub const OWNER_KEY_PREFIX: &str = "twin_sk_";
/// Prefix of embeddable widget keys (visitor principals).
pub const WIDGET_KEY_PREFIX: &str = "twin_wk_";

/// Length of the share-token fingerprint kept for tracing.
const SHARE_FINGERPRINT_LEN: usize = 10;

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short, non-reversible fingerprint of a share token.
///
/// Derived from the digest rather than the token itself, so traces never hold
/// any usable prefix of the secret.
pub fn share_token_fingerprint(token: &str) -> String {
    let digest = hash_token(token.trim());
    format!("st_{}", &digest[..SHARE_FINGERPRINT_LEN])
}

/// Extract the first 8 chars after a known key prefix for display/identification.
pub fn key_prefix(full_key: &str) -> String {
    full_key
        .strip_prefix(OWNER_KEY_PREFIX)
        .or_else(|| full_key.strip_prefix(WIDGET_KEY_PREFIX))
        .map(|rest| rest.chars().take(8).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_token_is_deterministic() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
        assert_eq!(hash_token("abc").len(), 64);
    }

    #[test]
    fn share_fingerprint_does_not_contain_token_prefix() {
        let token = "share-secret-value-123";
        let fingerprint = share_token_fingerprint(token);
        assert!(fingerprint.starts_with("st_"));
        assert_eq!(fingerprint.len(), 3 + 10);
        assert!(!fingerprint.contains("share"));
        assert_eq!(fingerprint, share_token_fingerprint(" share-secret-value-123 "));
    }

    #[test]
    fn key_prefix_handles_both_key_kinds() {
        assert_eq!(key_prefix("twin_sk_0123456789abcdef"), "01234567");
        assert_eq!(key_prefix("twin_wk_fedcba9876543210"), "fedcba98");
        assert_eq!(key_prefix("unknown_key"), "");
    }
}
