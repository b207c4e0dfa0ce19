//! Validation of a tree against the ACL.
//!
//! Walks the attached set in causal order and checks, for every change, that
//! its author was allowed to write at the ACL record the change was authored
//! under, that it is encrypted under the read key current at that record, and
//! that its signature verifies.

use tracing::debug;

use crate::acl::AclList;
use crate::change::Change;
use crate::keychain::Keychain;
use crate::tree::Tree;

/// Why a tree failed validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("change signature is invalid")]
    InvalidSignature,
    #[error("no such acl record")]
    NoSuchRecord,
    #[error("no such user at record")]
    NoSuchUser,
    #[error("author lacks write permission")]
    InsufficientPermissions,
    #[error("change is encrypted under a stale read key")]
    StaleReadKey,
}

#[derive(Debug, Default)]
pub(crate) struct TreeValidator;

impl TreeValidator {
    pub fn validate(
        &self,
        tree: &Tree,
        acl: &AclList,
        keychain: &mut Keychain,
    ) -> Result<(), ValidationError> {
        let mut result = Ok(());
        tree.iterate_from_root(|change| match self.validate_change(change, acl, keychain) {
            Ok(()) => true,
            Err(err) => {
                debug!(id = %change.id().fmt_short(), %err, "change failed validation");
                result = Err(err);
                false
            }
        });
        result
    }

    fn validate_change(
        &self,
        change: &Change,
        acl: &AclList,
        keychain: &mut Keychain,
    ) -> Result<(), ValidationError> {
        let snapshot = acl
            .state()
            .record_snapshot(&change.acl_head_id())
            .ok_or(ValidationError::NoSuchRecord)?;

        let permission = snapshot
            .permission_of(&change.identity())
            .ok_or(ValidationError::NoSuchUser)?;
        if !permission.can_write() {
            return Err(ValidationError::InsufficientPermissions);
        }

        if change.read_key_hash() != snapshot.read_key_hash {
            return Err(ValidationError::StaleReadKey);
        }

        if !change.is_verified() {
            keychain
                .verify(
                    &change.identity(),
                    change.payload_bytes(),
                    change.signature(),
                )
                .map_err(|_| ValidationError::InvalidSignature)?;
        }
        Ok(())
    }
}
