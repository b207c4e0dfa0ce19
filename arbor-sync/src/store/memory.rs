//! In-memory tree storage.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;

use crate::change::{ChangeId, RawChange};
use crate::store::{TreeHeader, TreeStorage, TreeStorageCreatePayload};

/// Tree storage backed by maps under a lock. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryTreeStorage {
    id: ChangeId,
    inner: Arc<RwLock<State>>,
}

#[derive(Debug)]
struct State {
    header: TreeHeader,
    heads: Vec<ChangeId>,
    changes: HashMap<ChangeId, RawChange>,
    max_change_len: usize,
}

impl MemoryTreeStorage {
    pub fn create(payload: TreeStorageCreatePayload) -> Self {
        let id = payload.root.id;
        let max_change_len = payload.root.payload.len();
        let mut changes = HashMap::new();
        changes.insert(id, payload.root);
        MemoryTreeStorage {
            id,
            inner: Arc::new(RwLock::new(State {
                header: payload.header,
                heads: vec![id],
                changes,
                max_change_len,
            })),
        }
    }
}

impl TreeStorage for MemoryTreeStorage {
    fn id(&self) -> ChangeId {
        self.id
    }

    fn header(&self) -> Result<TreeHeader> {
        Ok(self.inner.read().header.clone())
    }

    fn heads(&self) -> Result<Vec<ChangeId>> {
        Ok(self.inner.read().heads.clone())
    }

    fn set_heads(&self, heads: &[ChangeId]) -> Result<()> {
        self.inner.write().heads = heads.to_vec();
        Ok(())
    }

    fn add_raw_change(&self, change: &RawChange) -> Result<()> {
        let mut inner = self.inner.write();
        inner.max_change_len = inner.max_change_len.max(change.payload.len());
        inner.changes.insert(change.id, change.clone());
        Ok(())
    }

    fn get_raw_change(&self, id: &ChangeId) -> Result<RawChange> {
        self.inner
            .read()
            .changes
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown change {id}"))
    }

    fn has_change(&self, id: &ChangeId) -> Result<bool> {
        Ok(self.inner.read().changes.contains_key(id))
    }

    fn max_change_len(&self) -> Option<usize> {
        Some(self.inner.read().max_change_len)
    }
}
