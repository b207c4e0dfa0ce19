//! Cache of parsed identity keys.

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;

use crate::keys::{AuthorId, CryptoError};

/// Caches the ed25519 verifying key per identity so repeated verification of
/// the same author only pays the point decompression once.
#[derive(Debug, Default)]
pub struct Keychain {
    keys: HashMap<AuthorId, VerifyingKey>,
}

impl Keychain {
    pub fn verifying_key(&mut self, identity: &AuthorId) -> Result<&VerifyingKey, CryptoError> {
        if !self.keys.contains_key(identity) {
            let key = identity.verifying_key()?;
            self.keys.insert(*identity, key);
        }
        Ok(&self.keys[identity])
    }

    /// Verifies `signature` over `msg` against `identity`.
    pub fn verify(
        &mut self,
        identity: &AuthorId,
        msg: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        self.verifying_key(identity)?
            .verify_strict(msg, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Author;

    #[test]
    fn caches_and_verifies() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng);
        let sig = author.sign(b"hello").unwrap().to_bytes();

        let mut kch = Keychain::default();
        kch.verify(&author.id(), b"hello", &sig).unwrap();
        // second verification hits the cache
        kch.verify(&author.id(), b"hello", &sig).unwrap();
        assert!(kch.verify(&author.id(), b"tampered", &sig).is_err());
    }
}
