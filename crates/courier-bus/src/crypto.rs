//! Content encryption seam for direct messages.
//!
//! The bus encrypts and decrypts DM content through the [`CryptoCodec`]
//! trait so tests can substitute a transparent codec. The default
//! implementation is the standard encrypted-DM content scheme from the
//! nostr crate.

use crate::error::{Error, Result};
use nostr::nips::nip04;
use nostr::{PublicKey, SecretKey};

/// Encrypts and decrypts DM content between two key pairs.
pub trait CryptoCodec: Send + Sync {
    /// Encrypt `plaintext` from our secret key to `peer`.
    fn encrypt(&self, secret_key: &SecretKey, peer: &PublicKey, plaintext: &str) -> Result<String>;

    /// Decrypt `ciphertext` sent to our secret key by `peer`.
    fn decrypt(&self, secret_key: &SecretKey, peer: &PublicKey, ciphertext: &str)
        -> Result<String>;
}

/// The standard encrypted-DM content scheme (NIP-04).
pub struct Nip04Codec;

impl CryptoCodec for Nip04Codec {
    fn encrypt(&self, secret_key: &SecretKey, peer: &PublicKey, plaintext: &str) -> Result<String> {
        nip04::encrypt(secret_key, peer, plaintext).map_err(|e| Error::Crypto(e.to_string()))
    }

    fn decrypt(
        &self,
        secret_key: &SecretKey,
        peer: &PublicKey,
        ciphertext: &str,
    ) -> Result<String> {
        nip04::decrypt(secret_key, peer, ciphertext).map_err(|e| Error::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let codec = Nip04Codec;

        let ciphertext = codec
            .encrypt(alice.secret_key(), &bob.public_key(), "hello bob")
            .unwrap();
        assert_ne!(ciphertext, "hello bob");

        let plaintext = codec
            .decrypt(bob.secret_key(), &alice.public_key(), &ciphertext)
            .unwrap();
        assert_eq!(plaintext, "hello bob");
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let mallory = Keys::generate();
        let codec = Nip04Codec;

        let ciphertext = codec
            .encrypt(alice.secret_key(), &bob.public_key(), "secret")
            .unwrap();

        let result = codec.decrypt(mallory.secret_key(), &alice.public_key(), &ciphertext);
        match result {
            Err(Error::Crypto(_)) => {}
            Ok(decrypted) => assert_ne!(decrypted, "secret"),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
