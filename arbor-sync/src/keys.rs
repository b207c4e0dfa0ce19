//! Key material: signing identities, symmetric read keys, and asymmetric
//! sealing of read keys to users.
//!
//! Change payloads are encrypted under a [`ReadKey`], the ACL's current
//! symmetric key. Read keys travel between users sealed to their
//! [`EncryptionPublicKey`]; every user signs with an ed25519 [`Author`] key
//! whose public half is their [`AuthorId`] identity.

use std::fmt::{self, Debug, Display};
use std::hash::Hasher;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use multihash::{Code, MultihashDigest};
use fnv::FnvHasher;
use rand::RngCore;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Nonce length for ChaCha20-Poly1305.
const NONCE_LEN: usize = 12;

/// Errors from key handling and payload crypto.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A signature did not verify against the claimed identity.
    #[error("signature is invalid")]
    InvalidSignature,
    /// An identity's public key could not be parsed.
    #[error("unknown identity")]
    UnknownIdentity,
    /// Sealed or encrypted data could not be decrypted.
    #[error("failed to decrypt")]
    FailedToDecrypt,
    /// Signing failed.
    #[error("failed to sign")]
    SignFailed,
    /// Key material had the wrong length or shape.
    #[error("bad key material")]
    InvalidKey,
}

/// An author keypair used to sign changes and ACL records.
#[derive(Clone)]
pub struct Author {
    signing_key: SigningKey,
}

impl Author {
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        Author {
            signing_key: SigningKey::generate(rng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Author {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The public identity of this author.
    pub fn id(&self) -> AuthorId {
        AuthorId(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Signature, CryptoError> {
        self.signing_key
            .try_sign(msg)
            .map_err(|_| CryptoError::SignFailed)
    }
}

impl Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", self.id())
    }
}

/// The public half of an [`Author`]: the identity carried in every change.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuthorId([u8; 32]);

impl AuthorId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        AuthorId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses the ed25519 verifying key. Callers that verify repeatedly
    /// should go through the [`Keychain`](crate::keychain::Keychain) instead.
    pub fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::UnknownIdentity)
    }

    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        self.verifying_key()?
            .verify_strict(msg, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", self.fmt_short())
    }
}

/// A symmetric key under which change payloads are encrypted.
///
/// Rotated by the ACL on user removal; identified on the wire by its 64-bit
/// fnv hash so payload headers never carry key material.
#[derive(Clone, PartialEq, Eq)]
pub struct ReadKey([u8; 32]);

impl ReadKey {
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        ReadKey(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ReadKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(ReadKey(bytes))
    }

    /// Deterministically derives the genesis read key from the creator's
    /// identity and encryption public key.
    pub fn derive(identity: &[u8], encryption_key: &[u8]) -> Self {
        let mut data = Vec::with_capacity(identity.len() + encryption_key.len());
        data.extend_from_slice(identity);
        data.extend_from_slice(encryption_key);
        let digest = Code::Sha2_256.digest(&data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(digest.digest());
        ReadKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The 64-bit hash identifying this key on the wire.
    pub fn hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.0);
        hasher.finish()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::FailedToDecrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::FailedToDecrypt);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::FailedToDecrypt)
    }
}

impl Debug for ReadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadKey(hash={:016x})", self.hash())
    }
}

/// An x25519 secret used to unseal read keys addressed to this user.
#[derive(Clone)]
pub struct EncryptionKey {
    secret: StaticSecret,
}

impl EncryptionKey {
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        EncryptionKey {
            secret: StaticSecret::random_from_rng(&mut *rng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EncryptionKey {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public(&self) -> EncryptionPublicKey {
        EncryptionPublicKey(PublicKey::from(&self.secret).to_bytes())
    }

    /// Opens a payload sealed to this key with [`EncryptionPublicKey::seal`].
    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < 32 + NONCE_LEN {
            return Err(CryptoError::FailedToDecrypt);
        }
        let (eph, rest) = sealed.split_at(32);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let eph: [u8; 32] = eph.try_into().map_err(|_| CryptoError::FailedToDecrypt)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(eph));
        let cipher = ChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::FailedToDecrypt)
    }
}

impl Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey({})", self.public())
    }
}

/// The public half of an [`EncryptionKey`]; read keys are sealed to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionPublicKey([u8; 32]);

impl EncryptionPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EncryptionPublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Seals a payload to this key: an ephemeral x25519 exchange followed by
    /// ChaCha20-Poly1305, `ephemeral_pub || nonce || ciphertext`.
    pub fn seal<R: CryptoRngCore + ?Sized>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let eph = EphemeralSecret::random_from_rng(&mut *rng);
        let eph_pub = PublicKey::from(&eph);
        let shared = eph.diffie_hellman(&PublicKey::from(self.0));
        let cipher = ChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()));
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::FailedToDecrypt)?;
        let mut out = Vec::with_capacity(32 + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(eph_pub.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl Display for EncryptionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for EncryptionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionPublicKey({})", hex::encode(&self.0[..5]))
    }
}

/// The key pair a participating account holds: a signing identity plus the
/// encryption secret read keys get sealed to.
#[derive(Debug, Clone)]
pub struct AccountKeys {
    pub signing: Author,
    pub encryption: EncryptionKey,
}

impl AccountKeys {
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        AccountKeys {
            signing: Author::new(rng),
            encryption: EncryptionKey::new(rng),
        }
    }

    pub fn identity(&self) -> AuthorId {
        self.signing.id()
    }
}
