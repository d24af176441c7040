//! Device API keys.
//!
//! A key is `API_KEY_LEN` alphanumeric characters. Its first `TOKEN_LEN`
//! characters are stored in plaintext as a lookup token; the full key is
//! only ever stored as `calculate_hash(key, salt)`.

use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

pub const API_KEY_LEN: usize = 32;
pub const TOKEN_LEN: usize = 8;
pub const SALT_LEN: usize = 16;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Salted SHA-256 of `secret`, as 64 lowercase hex characters.
pub fn calculate_hash(secret: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn generate_api_key() -> String {
    sample_alphabet(API_KEY_LEN)
}

pub fn generate_salt() -> String {
    sample_alphabet(SALT_LEN)
}

// Characters are drawn without replacement, so no character repeats within one sample.
fn sample_alphabet(len: usize) -> String {
    let mut rng = rand::thread_rng();
    ALPHABET
        .choose_multiple(&mut rng, len)
        .map(|&b| b as char)
        .collect()
}

/// Lookup token of a key. Callers check the length first.
pub fn token_of(api_key: &str) -> &str {
    &api_key[..TOKEN_LEN.min(api_key.len())]
}

pub fn is_well_formed(api_key: &str) -> bool {
    api_key.len() == API_KEY_LEN && api_key.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Compares two digests without exiting early on the first mismatch.
pub fn hashes_match(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn matches_device(api_key: &str, salt: &str, stored_hash: &str) -> bool {
    hashes_match(&calculate_hash(api_key, salt), stored_hash)
}

/// What the owner sees after creation: the token followed by a mask.
pub fn masked_api_key(token: &str) -> String {
    format!("{}{}", token, "*".repeat(API_KEY_LEN - TOKEN_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_hash_is_deterministic() {
        let a = calculate_hash("key", "salt");
        assert_eq!(a, calculate_hash("key", "salt"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, calculate_hash("key", "pepper"));
        assert_ne!(a, calculate_hash("kez", "salt"));
    }

    #[test]
    fn test_known_digest() {
        // sha256("")
        assert_eq!(
            calculate_hash("", ""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_generated_key_shape() {
        let key = generate_api_key();
        assert_eq!(key.len(), API_KEY_LEN);
        assert!(is_well_formed(&key));

        let distinct: HashSet<char> = key.chars().collect();
        assert_eq!(distinct.len(), API_KEY_LEN);

        assert_eq!(generate_salt().len(), SALT_LEN);
    }

    #[test]
    fn test_token_and_mask() {
        let key = "ABCDEFGHijklmnopqrstuvwxyz012345";
        assert_eq!(token_of(key), "ABCDEFGH");
        let masked = masked_api_key(token_of(key));
        assert_eq!(masked.len(), API_KEY_LEN);
        assert!(masked.starts_with("ABCDEFGH*"));
    }

    #[test]
    fn test_wrong_length_is_malformed() {
        let key = generate_api_key();
        assert!(!is_well_formed(&key[1..]));
        assert!(!is_well_formed(&format!("{}x", key)));
        assert!(!is_well_formed(&format!("{}-", &key[1..])));
    }

    #[test]
    fn test_matches_device() {
        let key = generate_api_key();
        let salt = generate_salt();
        let stored = calculate_hash(&key, &salt);
        assert!(matches_device(&key, &salt, &stored));

        let mut other = key.clone();
        other.replace_range(31..32, if key.ends_with('a') { "b" } else { "a" });
        assert!(!matches_device(&other, &salt, &stored));
        assert!(!hashes_match(&stored, &stored[1..]));
    }
}
