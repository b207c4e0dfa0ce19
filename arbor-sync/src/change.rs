//! The immutable change record and its raw wire envelope.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::keychain::Keychain;
use crate::keys::{AuthorId, CryptoError};

/// Multicodec code for raw bytes; change ids are CIDv1 raw/sha2-256.
const RAW_CODEC: u64 = 0x55;

/// Errors from parsing and verifying raw changes.
#[derive(Debug, thiserror::Error)]
pub enum ChangeError {
    /// The envelope id does not match the content hash of the payload.
    #[error("change id does not match payload hash")]
    IdMismatch,
    /// The payload bytes could not be unmarshalled.
    #[error("malformed change payload: {0}")]
    Payload(#[from] postcard::Error),
    /// Signature or identity failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Content-hash identifier of a change: CIDv1 over the marshalled payload
/// bytes, excluding the signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(Cid);

impl ChangeId {
    /// Computes the id for marshalled payload bytes.
    pub fn for_payload(payload: &[u8]) -> Self {
        ChangeId(Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(payload)))
    }

    pub fn fmt_short(&self) -> String {
        let s = self.0.to_string();
        s[s.len().saturating_sub(8)..].to_string()
    }
}

impl Ord for ChangeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.to_bytes().cmp(&other.0.to_bytes())
    }
}

impl PartialOrd for ChangeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeId({})", self.fmt_short())
    }
}

impl FromStr for ChangeId {
    type Err = cid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ChangeId(Cid::try_from(s)?))
    }
}

/// The marshalled shell of a change. Identities are opaque key bytes; the
/// inner document data is symmetrically encrypted and never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    /// Parent change ids; empty only for the root.
    pub tree_head_ids: Vec<ChangeId>,
    /// The ACL record that was current when this change was authored.
    pub acl_head_id: ChangeId,
    /// The snapshot this change descends from; `None` only for the root.
    pub snapshot_base_id: Option<ChangeId>,
    /// Hash of the read key the payload is encrypted under.
    pub current_read_key_hash: u64,
    /// Author-supplied timestamp, unix nanoseconds.
    pub timestamp: i64,
    /// Author public key bytes.
    pub identity: AuthorId,
    /// Whether this change is self-contained.
    pub is_snapshot: bool,
    /// Encrypted document data.
    pub changes_data: Bytes,
}

/// The raw wire envelope of a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub payload: Bytes,
    pub signature: Bytes,
    pub id: ChangeId,
}

/// A parsed change. Immutable after construction and shared freely between
/// threads; only the tree's membership maps mutate.
#[derive(Debug, Clone)]
pub struct Change {
    id: ChangeId,
    payload: ChangePayload,
    payload_bytes: Bytes,
    signature: Bytes,
    verified: bool,
}

impl Change {
    /// Parses the payload shell and recomputes the content hash. The
    /// signature is left unverified.
    pub fn from_raw(raw: &RawChange) -> Result<Self, ChangeError> {
        let payload: ChangePayload = postcard::from_bytes(&raw.payload)?;
        let id = ChangeId::for_payload(&raw.payload);
        if id != raw.id {
            return Err(ChangeError::IdMismatch);
        }
        Ok(Change {
            id,
            payload,
            payload_bytes: raw.payload.clone(),
            signature: raw.signature.clone(),
            verified: false,
        })
    }

    /// [`Self::from_raw`] plus signature verification against the author
    /// identity, with the key cached in `keychain`.
    pub fn from_raw_verified(raw: &RawChange, keychain: &mut Keychain) -> Result<Self, ChangeError> {
        let mut change = Self::from_raw(raw)?;
        keychain.verify(
            &change.payload.identity,
            &change.payload_bytes,
            &change.signature,
        )?;
        change.verified = true;
        Ok(change)
    }

    /// Wraps a locally authored change; the signature is trusted.
    pub(crate) fn new_local(
        id: ChangeId,
        payload: ChangePayload,
        payload_bytes: Bytes,
        signature: Bytes,
    ) -> Self {
        Change {
            id,
            payload,
            payload_bytes,
            signature,
            verified: true,
        }
    }

    pub fn id(&self) -> ChangeId {
        self.id
    }

    pub fn prev_ids(&self) -> &[ChangeId] {
        &self.payload.tree_head_ids
    }

    pub fn acl_head_id(&self) -> ChangeId {
        self.payload.acl_head_id
    }

    pub fn snapshot_base_id(&self) -> Option<ChangeId> {
        self.payload.snapshot_base_id
    }

    pub fn read_key_hash(&self) -> u64 {
        self.payload.current_read_key_hash
    }

    pub fn timestamp(&self) -> i64 {
        self.payload.timestamp
    }

    pub fn identity(&self) -> AuthorId {
        self.payload.identity
    }

    pub fn is_snapshot(&self) -> bool {
        self.payload.is_snapshot
    }

    /// The encrypted document data.
    pub fn data(&self) -> &Bytes {
        &self.payload.changes_data
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn payload_bytes(&self) -> &Bytes {
        &self.payload_bytes
    }

    /// Rebuilds the wire envelope from the stored marshalled bytes.
    pub fn to_raw(&self) -> RawChange {
        RawChange {
            payload: self.payload_bytes.clone(),
            signature: self.signature.clone(),
            id: self.id,
        }
    }
}

/// Current time as unix nanoseconds, for change timestamps.
pub(crate) fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Author;

    fn sample_payload(author: &Author) -> (Bytes, ChangePayload) {
        let acl_head = ChangeId::for_payload(b"acl-root");
        let payload = ChangePayload {
            tree_head_ids: vec![ChangeId::for_payload(b"parent")],
            acl_head_id: acl_head,
            snapshot_base_id: Some(ChangeId::for_payload(b"base")),
            current_read_key_hash: 42,
            timestamp: unix_nanos(),
            identity: author.id(),
            is_snapshot: false,
            changes_data: Bytes::from_static(b"opaque"),
        };
        let bytes = Bytes::from(postcard::to_allocvec(&payload).unwrap());
        (bytes, payload)
    }

    #[test]
    fn raw_roundtrip_and_id_check() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng);
        let (bytes, payload) = sample_payload(&author);
        let signature = Bytes::copy_from_slice(&author.sign(&bytes).unwrap().to_bytes());
        let raw = RawChange {
            id: ChangeId::for_payload(&bytes),
            payload: bytes,
            signature,
        };

        let change = Change::from_raw(&raw).unwrap();
        assert_eq!(change.prev_ids(), payload.tree_head_ids.as_slice());
        assert!(!change.is_verified());
        assert_eq!(change.to_raw(), raw);

        let mut kch = Keychain::default();
        let verified = Change::from_raw_verified(&raw, &mut kch).unwrap();
        assert!(verified.is_verified());
    }

    #[test]
    fn id_mismatch_is_rejected() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng);
        let (bytes, _) = sample_payload(&author);
        let raw = RawChange {
            id: ChangeId::for_payload(b"not the payload"),
            payload: bytes.clone(),
            signature: Bytes::new(),
        };
        assert!(matches!(
            Change::from_raw(&raw),
            Err(ChangeError::IdMismatch)
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng);
        let (bytes, _) = sample_payload(&author);
        let mut sig = author.sign(&bytes).unwrap().to_bytes().to_vec();
        sig[0] ^= 0xff;
        let raw = RawChange {
            id: ChangeId::for_payload(&bytes),
            payload: bytes,
            signature: sig.into(),
        };
        let mut kch = Keychain::default();
        assert!(Change::from_raw_verified(&raw, &mut kch).is_err());
    }
}
