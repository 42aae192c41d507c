//! The client-side authentication cache.
//!
//! bcrypt verification is deliberately slow; once a password has passed it,
//! subsequent checks compare a salted SHA-512 digest instead. Entries are
//! invalidated when a poll tick observes the user gone or their bcrypt hash
//! changed.

use rand::RngCore;
use sha2::{Digest, Sha512};

const SALT_LEN: usize = 32;

/// A cached credential: a fresh random salt, the SHA-512 of the salted
/// password, and the bcrypt hash it was validated against.
#[derive(Debug, Clone)]
pub(crate) struct AuthUser {
    pub salt: Vec<u8>,
    pub hash: Vec<u8>,
    pub bhash: String,
}

pub(crate) fn hash_with_salt(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Generate a salt and the salted hash of `password` for caching.
pub(crate) fn salted_hash(password: &str) -> (Vec<u8>, Vec<u8>) {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = hash_with_salt(&salt, password);
    (salt, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salted_hash_matches_recomputation() {
        let (salt, hash) = salted_hash("hunter2");
        assert_eq!(hash_with_salt(&salt, "hunter2"), hash);
        assert_ne!(hash_with_salt(&salt, "hunter3"), hash);
    }

    #[test]
    fn salts_are_unique_per_entry() {
        let (a, _) = salted_hash("pw");
        let (b, _) = salted_hash("pw");
        assert_ne!(a, b);
    }
}
