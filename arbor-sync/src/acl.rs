//! The access-control list: records, and the replayable state machine over
//! them.
//!
//! The ACL is an ordered list of records rooted at a genesis record. Replaying
//! the list yields an [`AclState`]: who is in the space, with what permission,
//! and under which symmetric read key new changes must be encrypted. The
//! state is never rolled back in place; on divergence callers rebuild a fresh
//! state from storage.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::change::ChangeId;
use crate::keys::{AccountKeys, AuthorId, CryptoError, EncryptionPublicKey, ReadKey};

/// Errors from applying ACL records.
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("no such user")]
    NoSuchUser,
    #[error("failed to decrypt key")]
    FailedToDecrypt,
    #[error("user was removed from the document")]
    UserRemoved,
    #[error("user was forbidden access to the document")]
    DocumentForbidden,
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("no such record")]
    NoSuchRecord,
    #[error("no such invite")]
    NoSuchInvite,
    #[error("invite is too old")]
    OldInvite,
    #[error("insufficient permissions")]
    InsufficientPermissions,
    #[error("acl state doesn't have a read key")]
    NoReadKey,
    #[error("signature is invalid")]
    InvalidSignature,
    #[error("incorrect root")]
    IncorrectRoot,
    #[error("user remove must seal the new read key to every remaining user")]
    IncompleteKeyRotation,
    #[error("malformed acl record: {0}")]
    MalformedRecord(&'static str),
}

impl From<CryptoError> for AclError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature | CryptoError::UnknownIdentity => {
                AclError::InvalidSignature
            }
            _ => AclError::FailedToDecrypt,
        }
    }
}

/// Permission levels, ordered: `Revoked < Reader < Writer < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    Revoked,
    Reader,
    Writer,
    Admin,
}

impl Permission {
    pub fn can_write(&self) -> bool {
        *self >= Permission::Writer
    }

    pub fn is_admin(&self) -> bool {
        *self == Permission::Admin
    }
}

/// The genesis record content: the creator becomes sole admin and the first
/// read key is either sealed to the creator's encryption key or derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRoot {
    pub identity: AuthorId,
    pub encryption_key: EncryptionPublicKey,
    /// First read key sealed to `encryption_key`; absent when derived.
    pub encrypted_read_key: Option<Bytes>,
    /// Name of the derivation scheme, when the first key is derived from the
    /// creator's identity and encryption key.
    pub derivation_scheme: Option<String>,
    pub current_read_key_hash: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAdd {
    pub identity: AuthorId,
    pub encryption_key: EncryptionPublicKey,
    /// Read-key history sealed to the added user.
    pub encrypted_read_keys: Vec<Bytes>,
    pub permission: Permission,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInvite {
    /// The key the join signature must verify under.
    pub accept_public_key: AuthorId,
    /// Read-key history sealed to the invite.
    pub encrypted_read_keys: Vec<Bytes>,
    pub permission: Permission,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserJoin {
    pub identity: AuthorId,
    pub encryption_key: EncryptionPublicKey,
    pub accept_public_key: AuthorId,
    /// Signature over the joiner identity, under the invite's accept key.
    pub accept_signature: Bytes,
    /// Read-key history re-sealed to the joiner.
    pub encrypted_read_keys: Vec<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadKeyReplace {
    pub identity: AuthorId,
    /// The new current read key sealed to that user.
    pub encrypted_read_key: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRemove {
    pub identity: AuthorId,
    /// One entry per remaining user, sealing the new read key to them.
    pub read_key_replaces: Vec<ReadKeyReplace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPermissionChange {
    pub identity: AuthorId,
    pub permission: Permission,
}

/// One content item of a non-root record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AclContentValue {
    UserAdd(UserAdd),
    UserRemove(UserRemove),
    UserInvite(UserInvite),
    UserJoin(UserJoin),
    UserPermissionChange(UserPermissionChange),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclData {
    pub contents: Vec<AclContentValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AclRecordData {
    Root(AclRoot),
    Data(AclData),
}

/// A record in the ACL list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRecord {
    pub id: ChangeId,
    pub prev_id: Option<ChangeId>,
    pub identity: AuthorId,
    /// Read-key hash current after this record.
    pub current_read_key_hash: u64,
    pub timestamp: i64,
    pub data: AclRecordData,
}

/// A user known to the ACL.
#[derive(Debug, Clone)]
pub struct UserState {
    pub identity: AuthorId,
    pub encryption_key: EncryptionPublicKey,
    pub permission: Permission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPermissionPair {
    pub identity: AuthorId,
    pub permission: Permission,
}

/// The permission table and read-key hash as of one record, kept so document
/// changes authored at that record can be authorized in O(users).
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub read_key_hash: u64,
    pub permissions: Vec<UserPermissionPair>,
}

impl RecordSnapshot {
    pub fn permission_of(&self, identity: &AuthorId) -> Option<Permission> {
        self.permissions
            .iter()
            .find(|p| p.identity == *identity)
            .map(|p| p.permission)
    }
}

/// Replayable state over ACL records. Not thread-safe; owners access it under
/// their own lock.
#[derive(Debug)]
pub struct AclState {
    id: ChangeId,
    identity: Option<AuthorId>,
    account: Option<AccountKeys>,
    current_read_key_hash: u64,
    user_read_keys: HashMap<u64, ReadKey>,
    user_states: HashMap<AuthorId, UserState>,
    user_invites: HashMap<AuthorId, UserInvite>,
    permissions_at_record: HashMap<ChangeId, RecordSnapshot>,
    total_read_keys: usize,
}

impl AclState {
    /// A state for a non-participating observer (a node): it tracks users and
    /// key hashes but holds no key material.
    pub fn new(id: ChangeId) -> Self {
        Self::with_account(id, None)
    }

    /// A state for a participating account; read keys addressed to the
    /// account are unsealed and retained.
    pub fn with_account(id: ChangeId, account: Option<AccountKeys>) -> Self {
        AclState {
            id,
            identity: account.as_ref().map(|a| a.identity()),
            account,
            current_read_key_hash: 0,
            user_read_keys: HashMap::new(),
            user_states: HashMap::new(),
            user_invites: HashMap::new(),
            permissions_at_record: HashMap::new(),
            total_read_keys: 0,
        }
    }

    pub fn id(&self) -> ChangeId {
        self.id
    }

    pub fn identity(&self) -> Option<AuthorId> {
        self.identity
    }

    pub fn current_read_key_hash(&self) -> u64 {
        self.current_read_key_hash
    }

    pub fn current_read_key(&self) -> Result<&ReadKey, AclError> {
        self.user_read_keys
            .get(&self.current_read_key_hash)
            .ok_or(AclError::NoReadKey)
    }

    pub fn user_read_keys(&self) -> &HashMap<u64, ReadKey> {
        &self.user_read_keys
    }

    pub fn user_states(&self) -> &HashMap<AuthorId, UserState> {
        &self.user_states
    }

    pub fn total_read_keys(&self) -> usize {
        self.total_read_keys
    }

    pub fn permission_of(&self, identity: &AuthorId) -> Option<Permission> {
        self.user_states.get(identity).map(|u| u.permission)
    }

    /// The permission table snapshot taken after `record_id` was applied.
    pub fn record_snapshot(&self, record_id: &ChangeId) -> Option<&RecordSnapshot> {
        self.permissions_at_record.get(record_id)
    }

    /// Answers a historical authorization query at one record.
    pub fn permissions_at_record(
        &self,
        record_id: &ChangeId,
        identity: &AuthorId,
    ) -> Result<UserPermissionPair, AclError> {
        let snapshot = self
            .permissions_at_record
            .get(record_id)
            .ok_or(AclError::NoSuchRecord)?;
        snapshot
            .permissions
            .iter()
            .find(|p| p.identity == *identity)
            .cloned()
            .ok_or(AclError::NoSuchUser)
    }

    /// Looks up an invite by accept key, failing if its sealed key history is
    /// no longer complete.
    pub fn invite(&self, accept_public_key: &AuthorId) -> Result<&UserInvite, AclError> {
        let invite = self
            .user_invites
            .get(accept_public_key)
            .ok_or(AclError::NoSuchInvite)?;
        if invite.encrypted_read_keys.len() != self.total_read_keys {
            return Err(AclError::OldInvite);
        }
        Ok(invite)
    }

    /// Applies one record. The only mutation entry point.
    pub fn apply_record(&mut self, record: &AclRecord) -> Result<(), AclError> {
        if record.id == self.id {
            let AclRecordData::Root(root) = &record.data else {
                return Err(AclError::IncorrectRoot);
            };
            self.apply_root(root)?;
        } else {
            let AclRecordData::Data(data) = &record.data else {
                return Err(AclError::IncorrectRoot);
            };
            self.apply_change_data(data, record.current_read_key_hash, &record.identity)?;
        }
        self.snapshot_record(record.id);
        Ok(())
    }

    fn snapshot_record(&mut self, record_id: ChangeId) {
        let mut permissions: Vec<UserPermissionPair> = self
            .user_states
            .values()
            .map(|state| UserPermissionPair {
                identity: state.identity,
                permission: state.permission,
            })
            .collect();
        permissions.sort_by(|a, b| a.identity.cmp(&b.identity));
        self.permissions_at_record.insert(
            record_id,
            RecordSnapshot {
                read_key_hash: self.current_read_key_hash,
                permissions,
            },
        );
    }

    fn apply_root(&mut self, root: &AclRoot) -> Result<(), AclError> {
        if self.identity == Some(root.identity) {
            self.save_read_key_from_root(root)?;
        }
        self.current_read_key_hash = root.current_read_key_hash;
        self.total_read_keys = 1;
        self.user_states.insert(
            root.identity,
            UserState {
                identity: root.identity,
                encryption_key: root.encryption_key,
                permission: Permission::Admin,
            },
        );
        Ok(())
    }

    fn save_read_key_from_root(&mut self, root: &AclRoot) -> Result<(), AclError> {
        let account = self.account.as_ref().ok_or(AclError::NoReadKey)?;
        let read_key = if root.derivation_scheme.is_some() {
            ReadKey::derive(
                account.identity().as_bytes(),
                account.encryption.public().as_bytes(),
            )
        } else {
            let sealed = root
                .encrypted_read_key
                .as_ref()
                .ok_or(AclError::IncorrectRoot)?;
            let bytes = account.encryption.unseal(sealed)?;
            ReadKey::from_slice(&bytes)?
        };
        if read_key.hash() != root.current_read_key_hash {
            return Err(AclError::IncorrectRoot);
        }
        self.user_read_keys.insert(read_key.hash(), read_key);
        Ok(())
    }

    fn apply_change_data(
        &mut self,
        data: &AclData,
        record_read_key_hash: u64,
        author: &AuthorId,
    ) -> Result<(), AclError> {
        let has_join = data
            .contents
            .iter()
            .any(|c| matches!(c, AclContentValue::UserJoin(_)));
        if has_join && data.contents.len() != 1 {
            return Err(AclError::MalformedRecord(
                "user join must be the sole item in its record",
            ));
        }
        if !has_join {
            let author_state = self.user_states.get(author).ok_or(AclError::NoSuchUser)?;
            if !author_state.permission.is_admin() {
                debug!(author = %author.fmt_short(), "acl record author lacks admin");
                return Err(AclError::InsufficientPermissions);
            }
        }

        for content in &data.contents {
            self.apply_content(content, author)?;
        }

        if record_read_key_hash != self.current_read_key_hash {
            self.current_read_key_hash = record_read_key_hash;
            self.total_read_keys += 1;
        }
        Ok(())
    }

    fn apply_content(
        &mut self,
        content: &AclContentValue,
        author: &AuthorId,
    ) -> Result<(), AclError> {
        match content {
            AclContentValue::UserAdd(add) => self.apply_user_add(add),
            AclContentValue::UserRemove(remove) => self.apply_user_remove(remove, author),
            AclContentValue::UserInvite(invite) => self.apply_user_invite(invite),
            AclContentValue::UserJoin(join) => self.apply_user_join(join),
            AclContentValue::UserPermissionChange(change) => {
                self.apply_user_permission_change(change)
            }
        }
    }

    fn apply_user_add(&mut self, add: &UserAdd) -> Result<(), AclError> {
        if self.user_states.contains_key(&add.identity) {
            return Err(AclError::UserAlreadyExists);
        }
        self.user_states.insert(
            add.identity,
            UserState {
                identity: add.identity,
                encryption_key: add.encryption_key,
                permission: add.permission,
            },
        );
        if self.identity == Some(add.identity) {
            self.unseal_read_keys(&add.encrypted_read_keys)?;
        }
        Ok(())
    }

    fn apply_user_invite(&mut self, invite: &UserInvite) -> Result<(), AclError> {
        self.user_invites
            .insert(invite.accept_public_key, invite.clone());
        Ok(())
    }

    fn apply_user_join(&mut self, join: &UserJoin) -> Result<(), AclError> {
        let invite = self
            .user_invites
            .get(&join.accept_public_key)
            .cloned()
            .ok_or(AclError::NoSuchInvite)?;
        if self.user_states.contains_key(&join.identity) {
            return Err(AclError::UserAlreadyExists);
        }
        invite
            .accept_public_key
            .verify(join.identity.as_bytes(), &join.accept_signature)
            .map_err(|_| AclError::InvalidSignature)?;

        if self.identity == Some(join.identity) {
            self.unseal_read_keys(&join.encrypted_read_keys)?;
        }
        self.user_states.insert(
            join.identity,
            UserState {
                identity: join.identity,
                encryption_key: join.encryption_key,
                permission: invite.permission,
            },
        );
        Ok(())
    }

    fn apply_user_remove(&mut self, remove: &UserRemove, author: &AuthorId) -> Result<(), AclError> {
        if remove.identity == *author {
            return Err(AclError::InsufficientPermissions);
        }
        if self.identity == Some(remove.identity) {
            return Err(AclError::DocumentForbidden);
        }
        if !self.user_states.contains_key(&remove.identity) {
            return Err(AclError::NoSuchUser);
        }
        self.user_states.remove(&remove.identity);

        // the new read key must reach every user left in the space
        for state in self.user_states.values() {
            if !remove
                .read_key_replaces
                .iter()
                .any(|r| r.identity == state.identity)
            {
                return Err(AclError::IncompleteKeyRotation);
            }
        }

        if let Some(identity) = self.identity {
            for replace in &remove.read_key_replaces {
                if replace.identity == identity {
                    let (key, hash) = self.decrypt_read_key_and_hash(&replace.encrypted_read_key)?;
                    self.user_read_keys.insert(hash, key);
                    break;
                }
            }
        }
        Ok(())
    }

    fn apply_user_permission_change(
        &mut self,
        change: &UserPermissionChange,
    ) -> Result<(), AclError> {
        let current = self
            .user_states
            .get(&change.identity)
            .ok_or(AclError::NoSuchUser)?
            .permission;
        if current.is_admin() && !change.permission.is_admin() {
            let admins = self
                .user_states
                .values()
                .filter(|u| u.permission.is_admin())
                .count();
            if admins == 1 {
                return Err(AclError::InsufficientPermissions);
            }
        }
        if let Some(state) = self.user_states.get_mut(&change.identity) {
            state.permission = change.permission;
        }
        Ok(())
    }

    fn unseal_read_keys(&mut self, sealed_keys: &[Bytes]) -> Result<(), AclError> {
        for sealed in sealed_keys {
            let (key, hash) = self.decrypt_read_key_and_hash(sealed)?;
            self.user_read_keys.insert(hash, key);
        }
        Ok(())
    }

    fn decrypt_read_key_and_hash(&self, sealed: &[u8]) -> Result<(ReadKey, u64), AclError> {
        let account = self.account.as_ref().ok_or(AclError::FailedToDecrypt)?;
        let bytes = account
            .encryption
            .unseal(sealed)
            .map_err(|_| AclError::FailedToDecrypt)?;
        let key = ReadKey::from_slice(&bytes).map_err(|_| AclError::FailedToDecrypt)?;
        let hash = key.hash();
        Ok((key, hash))
    }
}

/// The ordered ACL list plus the state replayed over it.
#[derive(Debug)]
pub struct AclList {
    id: ChangeId,
    records: Vec<AclRecord>,
    index: HashMap<ChangeId, usize>,
    state: AclState,
}

impl AclList {
    /// Replays `records` in order; the first record is the root.
    pub fn build(account: Option<AccountKeys>, records: Vec<AclRecord>) -> Result<Self, AclError> {
        let first = records.first().ok_or(AclError::IncorrectRoot)?;
        let id = first.id;
        let mut state = AclState::with_account(id, account);
        let mut index = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            state.apply_record(record)?;
            index.insert(record.id, i);
        }
        Ok(AclList {
            id,
            records,
            index,
            state,
        })
    }

    pub fn id(&self) -> ChangeId {
        self.id
    }

    pub fn head(&self) -> &AclRecord {
        // non-empty by construction
        &self.records[self.records.len() - 1]
    }

    pub fn records(&self) -> &[AclRecord] {
        &self.records
    }

    pub fn state(&self) -> &AclState {
        &self.state
    }

    pub fn has_record(&self, id: &ChangeId) -> bool {
        self.index.contains_key(id)
    }

    /// Appends and applies a new record.
    pub fn add_record(&mut self, record: AclRecord) -> Result<(), AclError> {
        if self.index.contains_key(&record.id) {
            return Ok(());
        }
        self.state.apply_record(&record)?;
        self.index.insert(record.id, self.records.len());
        self.records.push(record);
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testutil {
    use super::*;
    use crate::change::ChangeId;

    /// Record ids for tests are content hashes of the serialized record data.
    pub fn record_id(data: &AclRecordData, salt: u64) -> ChangeId {
        let mut bytes = postcard::to_allocvec(data).unwrap();
        bytes.extend_from_slice(&salt.to_le_bytes());
        ChangeId::for_payload(&bytes)
    }

    /// A genesis list for `account` using the derived first read key.
    pub fn genesis(account: &AccountKeys) -> AclList {
        let read_key = ReadKey::derive(
            account.identity().as_bytes(),
            account.encryption.public().as_bytes(),
        );
        let root = AclRoot {
            identity: account.identity(),
            encryption_key: account.encryption.public(),
            encrypted_read_key: None,
            derivation_scheme: Some("identity.v1".to_string()),
            current_read_key_hash: read_key.hash(),
        };
        let data = AclRecordData::Root(root);
        let record = AclRecord {
            id: record_id(&data, 0),
            prev_id: None,
            identity: account.identity(),
            current_read_key_hash: read_key.hash(),
            timestamp: 0,
            data,
        };
        AclList::build(Some(account.clone()), vec![record]).unwrap()
    }

    /// Appends a data record authored by `author_keys`, returning its id.
    pub fn append_record(
        list: &mut AclList,
        author: AuthorId,
        read_key_hash: u64,
        contents: Vec<AclContentValue>,
    ) -> Result<ChangeId, AclError> {
        let data = AclRecordData::Data(AclData { contents });
        let record = AclRecord {
            id: record_id(&data, list.records().len() as u64),
            prev_id: Some(list.head().id),
            identity: author,
            current_read_key_hash: read_key_hash,
            timestamp: 0,
            data,
        };
        let id = record.id;
        list.add_record(record)?;
        Ok(id)
    }
}
