//! Abstraction over the storage backing object trees.
//!
//! The engine treats storage as a sorted key/value facility it never waits on
//! for long: implementations must keep writes bounded (no network). Heads are
//! replaced atomically; change writes are append-only and idempotent by id.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::change::{ChangeId, RawChange};

pub mod memory;

/// Descriptor of one tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeHeader {
    /// Root change id.
    pub first_id: ChangeId,
    /// The ACL list governing this tree.
    pub acl_id: ChangeId,
    /// The space this tree belongs to.
    pub space_id: String,
}

/// Everything needed to create the storage of a fresh tree.
#[derive(Debug, Clone)]
pub struct TreeStorageCreatePayload {
    pub header: TreeHeader,
    pub root: RawChange,
}

/// Storage for a single tree's changes and heads.
pub trait TreeStorage: Send + Sync + 'static {
    /// The tree id, equal to the root change id.
    fn id(&self) -> ChangeId;

    fn header(&self) -> Result<TreeHeader>;

    fn heads(&self) -> Result<Vec<ChangeId>>;

    /// Atomically replaces the head set.
    fn set_heads(&self, heads: &[ChangeId]) -> Result<()>;

    /// Appends a change; idempotent by id.
    fn add_raw_change(&self, change: &RawChange) -> Result<()>;

    fn get_raw_change(&self, id: &ChangeId) -> Result<RawChange>;

    fn has_change(&self, id: &ChangeId) -> Result<bool>;

    /// Length of the largest stored change, when the backend tracks it.
    fn max_change_len(&self) -> Option<usize> {
        None
    }
}

impl<T: TreeStorage + ?Sized> TreeStorage for std::sync::Arc<T> {
    fn id(&self) -> ChangeId {
        (**self).id()
    }

    fn header(&self) -> Result<TreeHeader> {
        (**self).header()
    }

    fn heads(&self) -> Result<Vec<ChangeId>> {
        (**self).heads()
    }

    fn set_heads(&self, heads: &[ChangeId]) -> Result<()> {
        (**self).set_heads(heads)
    }

    fn add_raw_change(&self, change: &RawChange) -> Result<()> {
        (**self).add_raw_change(change)
    }

    fn get_raw_change(&self, id: &ChangeId) -> Result<RawChange> {
        (**self).get_raw_change(id)
    }

    fn has_change(&self, id: &ChangeId) -> Result<bool> {
        (**self).has_change(id)
    }

    fn max_change_len(&self) -> Option<usize> {
        (**self).max_change_len()
    }
}
