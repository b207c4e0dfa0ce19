//! The public façade over one document tree: storage, DAG, validation, and
//! the mutation API.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::acl::{AclError, AclList};
use crate::builder;
use crate::change::{unix_nanos, Change, ChangeError, ChangeId, ChangePayload, RawChange};
use crate::keychain::Keychain;
use crate::keys::{Author, CryptoError};
use crate::store::{TreeHeader, TreeStorage, TreeStorageCreatePayload};
use crate::tree::{Mode, Tree};
use crate::validator::TreeValidator;

/// Errors surfaced by [`ObjectTree`] operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// The tree on disk or in a batch fails validation.
    #[error("tree contains invalid changes")]
    HasInvalidChanges,
    /// No snapshot is shared with the peer's snapshot path.
    #[error("trees don't have a common snapshot")]
    NoCommonSnapshot,
    /// More than one parentless root emerged while rebuilding.
    #[error("multiple possible roots")]
    MultipleRoots,
    /// Storage yielded nothing to root the tree at.
    #[error("tree has no root")]
    NoRoot,
    #[error(transparent)]
    Change(#[from] ChangeError),
    #[error(transparent)]
    Acl(#[from] AclError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("storage: {0}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for TreeError {
    fn from(err: anyhow::Error) -> Self {
        TreeError::Storage(err)
    }
}

/// What a batch did to the tree. An invalid batch is a named outcome, not an
/// error: the batch was rolled back and the tree is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Nothing attached; everything was known or is still missing parents.
    Nothing,
    /// The batch extended the current frontier.
    Append,
    /// The tree was restructured; listeners should re-read it.
    Rebuild,
    /// The batch failed validation and was rolled back.
    InvalidBatch,
}

/// Result of [`ObjectTree::add_raw_changes`].
#[derive(Debug)]
pub struct AddResult {
    pub old_heads: Vec<ChangeId>,
    pub heads: Vec<ChangeId>,
    /// The raw changes that ended up attached, in input order.
    pub added: Vec<RawChange>,
    pub outcome: AddOutcome,
}

/// A locally authored payload to be turned into a signed change.
#[derive(Debug, Clone)]
pub struct SignableContent {
    pub author: Author,
    pub data: Bytes,
    pub is_snapshot: bool,
}

/// Notifications the tree emits after committing a batch. The listener holds
/// no back-pointer to the tree; implementations read through their own
/// surfaces.
pub trait TreeUpdateListener: Send + Sync + 'static {
    fn update(&self, id: &ChangeId, heads: &[ChangeId]);
    fn rebuild(&self, id: &ChangeId, heads: &[ChangeId]);
}

enum Notify {
    Update,
    Rebuild,
}

/// One document's history: a content-addressed DAG of encrypted changes,
/// converged against the space ACL and persisted change-by-change.
///
/// Writers serialize on the internal lock; readers observe either the pre- or
/// post-batch state, never an intermediate.
pub struct ObjectTree<S: TreeStorage> {
    inner: RwLock<Inner<S>>,
}

struct Inner<S: TreeStorage> {
    id: ChangeId,
    header: TreeHeader,
    storage: S,
    tree: Tree,
    keychain: Keychain,
    acl: Arc<RwLock<AclList>>,
    validator: TreeValidator,
    listener: Option<Arc<dyn TreeUpdateListener>>,
    snapshot_path: Vec<ChangeId>,
}

impl<S: TreeStorage> ObjectTree<S> {
    /// Rebuilds the tree from storage and validates it. If the rebuilt heads
    /// differ from the stored ones (a crash between persisting changes and
    /// heads), the stored heads are repaired.
    pub fn build(
        storage: S,
        acl: Arc<RwLock<AclList>>,
        listener: Option<Arc<dyn TreeUpdateListener>>,
    ) -> Result<Self, TreeError> {
        let mut keychain = Keychain::default();
        let mut tree = builder::build_tree(&storage, &mut keychain, &[])?;
        tree.clear_possible_roots();
        {
            let acl_guard = acl.read();
            TreeValidator
                .validate(&tree, &acl_guard, &mut keychain)
                .map_err(|err| {
                    debug!(%err, "stored tree failed validation");
                    TreeError::HasInvalidChanges
                })?;
        }

        let mut storage_heads = storage.heads()?;
        storage_heads.sort();
        if storage_heads != tree.heads() {
            warn!(
                stored = ?storage_heads,
                rebuilt = ?tree.heads(),
                "heads in storage and rebuilt tree differ, repairing"
            );
            storage.set_heads(tree.heads())?;
        }

        let id = storage.id();
        let header = storage.header()?;
        let heads = tree.heads().to_vec();
        let object = ObjectTree {
            inner: RwLock::new(Inner {
                id,
                header,
                storage,
                tree,
                keychain,
                acl,
                validator: TreeValidator,
                listener: listener.clone(),
                snapshot_path: Vec::new(),
            }),
        };
        if let Some(listener) = listener {
            listener.rebuild(&id, &heads);
        }
        Ok(object)
    }

    /// Creates, signs, persists, and attaches a locally authored change,
    /// returning its wire envelope.
    pub fn add_content(&self, content: SignableContent) -> Result<RawChange, TreeError> {
        let mut inner = self.inner.write();
        let result = inner.add_content(content);
        let (id, heads, listener) = (
            inner.id,
            inner.tree.heads().to_vec(),
            inner.listener.clone(),
        );
        drop(inner);
        if let Some(listener) = listener {
            listener.update(&id, &heads);
        }
        result
    }

    /// Ingests a batch of raw changes: verify, attach or park, validate,
    /// compact, persist. Batches are atomic: on an invalid batch the tree and
    /// storage stay at the prior heads.
    pub fn add_raw_changes(&self, raws: Vec<RawChange>) -> Result<AddResult, TreeError> {
        let mut inner = self.inner.write();
        let (result, notify) = inner.add_raw_changes(raws)?;
        let (id, heads, listener) = (
            inner.id,
            inner.tree.heads().to_vec(),
            inner.listener.clone(),
        );
        drop(inner);
        if let Some(listener) = listener {
            match notify {
                Some(Notify::Update) => listener.update(&id, &heads),
                Some(Notify::Rebuild) => listener.rebuild(&id, &heads),
                None => {}
            }
        }
        Ok(result)
    }

    /// The ordered changes a peer at `their_path` is missing. An empty path
    /// means the peer lacks the document entirely and receives everything,
    /// including the common snapshot itself.
    pub fn changes_after_common_snapshot(
        &self,
        their_path: &[ChangeId],
    ) -> Result<Vec<RawChange>, TreeError> {
        let mut inner = self.inner.write();
        inner.changes_after_common_snapshot(their_path)
    }

    /// Snapshot ids from the current root back to genesis. Memoized while the
    /// root is stable.
    pub fn snapshot_path(&self) -> Result<Vec<ChangeId>, TreeError> {
        let mut inner = self.inner.write();
        inner.snapshot_path()
    }

    pub fn id(&self) -> ChangeId {
        self.inner.read().id
    }

    pub fn header(&self) -> TreeHeader {
        self.inner.read().header.clone()
    }

    pub fn heads(&self) -> Vec<ChangeId> {
        self.inner.read().tree.heads().to_vec()
    }

    pub fn root_id(&self) -> Option<ChangeId> {
        self.inner.read().tree.root_id()
    }

    pub fn root(&self) -> Option<Arc<Change>> {
        self.inner.read().tree.root().cloned()
    }

    pub fn has_change(&self, id: &ChangeId) -> bool {
        self.inner.read().tree.has_change(id)
    }

    /// Causal traversal over the attached set.
    pub fn iterate<F>(&self, visit: F)
    where
        F: FnMut(&Change) -> bool,
    {
        self.inner.read().tree.iterate_from_root(visit);
    }

    pub fn iterate_from<F>(&self, from: &ChangeId, visit: F)
    where
        F: FnMut(&Change) -> bool,
    {
        self.inner.read().tree.iterate(from, visit);
    }

    /// An opaque description of the attached DAG. No stability guarantee.
    pub fn debug_dump(&self) -> String {
        let inner = self.inner.read();
        let mut out = String::new();
        inner.tree.iterate_from_root(|change| {
            let prevs: Vec<String> = change.prev_ids().iter().map(|p| p.fmt_short()).collect();
            out.push_str(&format!(
                "{} <- [{}]{}\n",
                change.id().fmt_short(),
                prevs.join(", "),
                if change.is_snapshot() { " snapshot" } else { "" },
            ));
            true
        });
        out
    }

    /// Releases the storage handle.
    pub fn close(&self) -> Result<(), TreeError> {
        Ok(())
    }
}

impl<S: TreeStorage> Inner<S> {
    fn add_content(&mut self, content: SignableContent) -> Result<RawChange, TreeError> {
        let (acl_head_id, read_key_hash, read_key) = {
            let acl = self.acl.read();
            let state = acl.state();
            (
                acl.head().id,
                state.current_read_key_hash(),
                state.current_read_key()?.clone(),
            )
        };

        let encrypted = read_key.encrypt(&content.data)?;
        let payload = ChangePayload {
            tree_head_ids: self.tree.heads().to_vec(),
            acl_head_id,
            snapshot_base_id: self.tree.root_id(),
            current_read_key_hash: read_key_hash,
            timestamp: unix_nanos(),
            identity: content.author.id(),
            is_snapshot: content.is_snapshot,
            changes_data: encrypted.into(),
        };
        let payload_bytes = Bytes::from(
            postcard::to_allocvec(&payload).map_err(ChangeError::Payload)?,
        );
        let signature = Bytes::copy_from_slice(&content.author.sign(&payload_bytes)?.to_bytes());
        let id = ChangeId::for_payload(&payload_bytes);
        let change = Arc::new(Change::new_local(
            id,
            payload,
            payload_bytes.clone(),
            signature.clone(),
        ));

        if content.is_snapshot {
            // everything up to here is fixed in the new snapshot
            self.tree = Tree::new();
            self.snapshot_path.clear();
        }
        self.tree.add_merged_head(change);

        let raw = RawChange {
            payload: payload_bytes,
            signature,
            id,
        };
        self.storage.add_raw_change(&raw)?;
        self.storage.set_heads(&[id])?;
        Ok(raw)
    }

    fn add_raw_changes(
        &mut self,
        raws: Vec<RawChange>,
    ) -> Result<(AddResult, Option<Notify>), TreeError> {
        // TODO: populate old_heads from the pre-batch frontier; it is
        // returned empty today and no caller reads it yet.
        let old_heads: Vec<ChangeId> = Vec::new();
        let prev_heads = self.tree.heads().to_vec();

        let mut candidates: Vec<Arc<Change>> = Vec::new();
        let mut candidate_raws: Vec<RawChange> = Vec::new();
        let mut new_snapshots: HashSet<ChangeId> = HashSet::new();
        for raw in &raws {
            if self.tree.has_change(&raw.id) {
                continue;
            }
            let change = match Change::from_raw_verified(raw, &mut self.keychain) {
                Ok(change) => Arc::new(change),
                Err(err) => {
                    debug!(id = %raw.id.fmt_short(), %err, "rejecting unverifiable change");
                    return Ok((
                        AddResult {
                            old_heads,
                            heads: prev_heads,
                            added: Vec::new(),
                            outcome: AddOutcome::InvalidBatch,
                        },
                        None,
                    ));
                }
            };
            if change.is_snapshot() {
                new_snapshots.insert(change.id());
            }
            candidates.push(change);
            candidate_raws.push(raw.clone());
        }

        if candidates.is_empty() {
            return Ok((
                AddResult {
                    old_heads,
                    heads: prev_heads,
                    added: Vec::new(),
                    outcome: AddOutcome::Nothing,
                },
                None,
            ));
        }

        // a candidate descending from a snapshot that is neither our root nor
        // part of this batch means the batch reaches behind the compacted
        // history: restart from storage
        let root_id = self.tree.root_id();
        let from_old_snapshot = candidates.iter().any(|ch| match ch.snapshot_base_id() {
            None => false,
            Some(base) => Some(base) != root_id && !new_snapshots.contains(&base),
        });
        if from_old_snapshot {
            return self.rebuild_with(candidates, candidate_raws, old_heads);
        }

        let (mode, trace) = self.tree.add_traced(candidates.iter().cloned());
        if mode == Mode::Nothing {
            // parked candidates stay unattached; persist them so a restart
            // rebuilds the same picture
            for (change, raw) in candidates.iter().zip(&candidate_raws) {
                if self.tree.has_change(&change.id()) {
                    self.storage.add_raw_change(raw)?;
                }
            }
            return Ok((
                AddResult {
                    old_heads,
                    heads: prev_heads,
                    added: Vec::new(),
                    outcome: AddOutcome::Nothing,
                },
                None,
            ));
        }

        {
            let acl = Arc::clone(&self.acl);
            let acl_guard = acl.read();
            if let Err(err) =
                self.validator
                    .validate(&self.tree, &acl_guard, &mut self.keychain)
            {
                drop(acl_guard);
                debug!(%err, "batch failed validation, rolling back");
                let candidate_ids: HashSet<ChangeId> =
                    candidates.iter().map(|ch| ch.id()).collect();
                self.tree.rollback(&trace, &candidate_ids, prev_heads);
                return Ok((
                    AddResult {
                        old_heads,
                        heads: self.tree.heads().to_vec(),
                        added: Vec::new(),
                        outcome: AddOutcome::InvalidBatch,
                    },
                    None,
                ));
            }
        }

        let candidate_ids: HashSet<ChangeId> = candidates.iter().map(|ch| ch.id()).collect();
        let added: Vec<RawChange> = candidates
            .iter()
            .zip(&candidate_raws)
            .filter(|(ch, _)| self.tree.get(&ch.id()).is_some())
            .map(|(_, raw)| raw.clone())
            .collect();
        // changes drained from the unattached partition were delivered in an
        // earlier batch and may not be persisted yet
        let drained: Vec<RawChange> = trace
            .attached
            .iter()
            .filter(|id| !candidate_ids.contains(id))
            .filter_map(|id| self.tree.get(id).map(|ch| ch.to_raw()))
            .collect();

        if self.tree.reduce() {
            self.snapshot_path.clear();
        }

        for raw in added.iter().chain(&drained) {
            self.storage.add_raw_change(raw)?;
        }
        // parked candidates survive restarts too
        for (change, raw) in candidates.iter().zip(&candidate_raws) {
            if self.tree.get(&change.id()).is_none() && self.tree.has_change(&change.id()) {
                self.storage.add_raw_change(raw)?;
            }
        }
        self.storage.set_heads(self.tree.heads())?;

        let (outcome, notify) = match mode {
            Mode::Append => (AddOutcome::Append, Notify::Update),
            Mode::Rebuild => (AddOutcome::Rebuild, Notify::Rebuild),
            Mode::Nothing => unreachable!("mode nothing handled above"),
        };
        Ok((
            AddResult {
                old_heads,
                heads: self.tree.heads().to_vec(),
                added,
                outcome,
            },
            Some(notify),
        ))
    }

    /// The authoritative path: rebuild from storage merged with the batch.
    fn rebuild_with(
        &mut self,
        candidates: Vec<Arc<Change>>,
        candidate_raws: Vec<RawChange>,
        old_heads: Vec<ChangeId>,
    ) -> Result<(AddResult, Option<Notify>), TreeError> {
        let mut tree = match builder::build_tree(&self.storage, &mut self.keychain, &candidates) {
            Ok(tree) => tree,
            Err(err) => {
                // restore a consistent state without the batch and surface
                // the original error
                if let Err(restore_err) = self.rebuild_from_storage() {
                    warn!(%restore_err, "restoring tree after failed rebuild also failed");
                }
                return Err(err);
            }
        };
        tree.clear_possible_roots();

        let validation = {
            let acl = Arc::clone(&self.acl);
            let acl_guard = acl.read();
            self.validator
                .validate(&tree, &acl_guard, &mut self.keychain)
        };
        if let Err(err) = validation {
            debug!(%err, "rebuilt tree failed validation, dropping batch");
            self.rebuild_from_storage()?;
            return Ok((
                AddResult {
                    old_heads,
                    heads: self.tree.heads().to_vec(),
                    added: Vec::new(),
                    outcome: AddOutcome::InvalidBatch,
                },
                None,
            ));
        }

        self.tree = tree;
        self.snapshot_path.clear();
        let added: Vec<RawChange> = candidates
            .iter()
            .zip(&candidate_raws)
            .filter(|(ch, _)| self.tree.get(&ch.id()).is_some())
            .map(|(_, raw)| raw.clone())
            .collect();

        if self.tree.reduce() {
            self.snapshot_path.clear();
        }
        for raw in &added {
            self.storage.add_raw_change(raw)?;
        }
        self.storage.set_heads(self.tree.heads())?;

        Ok((
            AddResult {
                old_heads,
                heads: self.tree.heads().to_vec(),
                added,
                outcome: AddOutcome::Rebuild,
            },
            Some(Notify::Rebuild),
        ))
    }

    fn rebuild_from_storage(&mut self) -> Result<(), TreeError> {
        let mut tree = builder::build_tree(&self.storage, &mut self.keychain, &[])?;
        tree.clear_possible_roots();
        {
            let acl = Arc::clone(&self.acl);
            let acl_guard = acl.read();
            self.validator
                .validate(&tree, &acl_guard, &mut self.keychain)
                .map_err(|_| TreeError::HasInvalidChanges)?;
        }
        self.tree = tree;
        self.snapshot_path.clear();
        Ok(())
    }

    fn snapshot_path(&mut self) -> Result<Vec<ChangeId>, TreeError> {
        let root_id = self.tree.root_id().ok_or(TreeError::NoRoot)?;
        if self.snapshot_path.first() == Some(&root_id) {
            return Ok(self.snapshot_path.clone());
        }

        let mut path = Vec::new();
        let mut current = Some(root_id);
        while let Some(id) = current {
            path.push(id);
            let change = match self.tree.get(&id) {
                Some(change) => change.clone(),
                None => match builder::load_change(&self.storage, &id) {
                    Ok(change) => change,
                    // the tail of the path may predate what we hold locally
                    Err(_) => break,
                },
            };
            current = change.snapshot_base_id();
        }
        self.snapshot_path = path.clone();
        Ok(path)
    }

    fn changes_after_common_snapshot(
        &mut self,
        their_path: &[ChangeId],
    ) -> Result<Vec<RawChange>, TreeError> {
        let our_path = self.snapshot_path()?;
        let need_full = their_path.is_empty();
        let common = if need_full {
            *our_path.last().ok_or(TreeError::NoRoot)?
        } else {
            *our_path
                .iter()
                .find(|id| their_path.contains(id))
                .ok_or(TreeError::NoCommonSnapshot)?
        };

        debug!(
            heads = ?self.tree.heads(),
            breakpoint = %common.fmt_short(),
            id = %self.id.fmt_short(),
            "collecting changes from common snapshot"
        );

        if Some(common) == self.tree.root_id() {
            Ok(self.changes_from_tree())
        } else {
            self.changes_from_storage(common, need_full)
        }
    }

    fn changes_from_tree(&self) -> Vec<RawChange> {
        let mut raws = Vec::new();
        let heads = self.tree.heads().to_vec();
        self.tree.dfs_prev(&heads, |change| {
            raws.push(change.to_raw());
            true
        });
        raws
    }

    fn changes_from_storage(
        &self,
        common: ChangeId,
        need_start_snapshot: bool,
    ) -> Result<Vec<RawChange>, TreeError> {
        let mut raws = Vec::new();
        let mut visited: HashSet<ChangeId> = [common].into_iter().collect();
        let mut stack: Vec<ChangeId> = self.tree.heads().to_vec();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let raw = self.storage.get_raw_change(&id)?;
            let change = Change::from_raw(&raw)?;
            raws.push(raw);
            for prev in change.prev_ids() {
                if !visited.contains(prev) {
                    stack.push(*prev);
                }
            }
        }
        if need_start_snapshot {
            raws.push(self.storage.get_raw_change(&common)?);
        }
        Ok(raws)
    }
}

/// Builds the signed root change of a fresh tree, encrypted under the ACL's
/// current read key.
pub fn create_tree_root(
    author: &Author,
    acl: &AclList,
    data: Bytes,
    space_id: &str,
) -> Result<TreeStorageCreatePayload, TreeError> {
    let state = acl.state();
    let read_key = state.current_read_key()?;
    let encrypted = read_key.encrypt(&data)?;
    let payload = ChangePayload {
        tree_head_ids: Vec::new(),
        acl_head_id: acl.head().id,
        snapshot_base_id: None,
        current_read_key_hash: state.current_read_key_hash(),
        timestamp: unix_nanos(),
        identity: author.id(),
        is_snapshot: true,
        changes_data: encrypted.into(),
    };
    let payload_bytes = Bytes::from(postcard::to_allocvec(&payload).map_err(ChangeError::Payload)?);
    let signature = Bytes::copy_from_slice(&author.sign(&payload_bytes)?.to_bytes());
    let id = ChangeId::for_payload(&payload_bytes);
    Ok(TreeStorageCreatePayload {
        header: TreeHeader {
            first_id: id,
            acl_id: acl.id(),
            space_id: space_id.to_string(),
        },
        root: RawChange {
            payload: payload_bytes,
            signature,
            id,
        },
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::acl::testutil::genesis;
    use crate::keys::AccountKeys;
    use crate::store::memory::MemoryTreeStorage;

    struct Fixture {
        account: AccountKeys,
        acl: Arc<RwLock<AclList>>,
        root: TreeStorageCreatePayload,
    }

    fn fixture() -> Fixture {
        let mut rng = StdRng::seed_from_u64(7);
        let account = AccountKeys::generate(&mut rng);
        let acl = genesis(&account);
        let root = create_tree_root(
            &account.signing,
            &acl,
            Bytes::from_static(b"genesis"),
            "space",
        )
        .unwrap();
        Fixture {
            account,
            acl: Arc::new(RwLock::new(acl)),
            root,
        }
    }

    impl Fixture {
        fn storage(&self) -> MemoryTreeStorage {
            MemoryTreeStorage::create(self.root.clone())
        }

        fn tree(&self) -> ObjectTree<MemoryTreeStorage> {
            ObjectTree::build(self.storage(), self.acl.clone(), None).unwrap()
        }

        fn tree_on(&self, storage: MemoryTreeStorage) -> ObjectTree<MemoryTreeStorage> {
            ObjectTree::build(storage, self.acl.clone(), None).unwrap()
        }

        fn content(&self, data: &str) -> SignableContent {
            SignableContent {
                author: self.account.signing.clone(),
                data: Bytes::copy_from_slice(data.as_bytes()),
                is_snapshot: false,
            }
        }

        fn snapshot(&self, data: &str) -> SignableContent {
            SignableContent {
                is_snapshot: true,
                ..self.content(data)
            }
        }
    }

    #[derive(Default)]
    struct CountingListener {
        updates: AtomicUsize,
        rebuilds: AtomicUsize,
    }

    impl TreeUpdateListener for CountingListener {
        fn update(&self, _id: &ChangeId, _heads: &[ChangeId]) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn rebuild(&self, _id: &ChangeId, _heads: &[ChangeId]) {
            self.rebuilds.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn linear_append() {
        let fx = fixture();
        let author = fx.tree();
        let c1 = author.add_content(fx.content("one")).unwrap();
        let c2 = author.add_content(fx.content("two")).unwrap();
        assert_eq!(author.heads(), vec![c2.id]);

        let receiver = fx.tree();
        let result = receiver
            .add_raw_changes(vec![c1.clone(), c2.clone()])
            .unwrap();
        assert_eq!(result.outcome, AddOutcome::Append);
        assert_eq!(result.heads, vec![c2.id]);
        assert_eq!(
            result.added.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![c1.id, c2.id]
        );
        assert!(result.old_heads.is_empty());
    }

    #[test]
    fn fork_and_merge() {
        let fx = fixture();
        let left = fx.tree();
        let right = fx.tree();
        let c1 = left.add_content(fx.content("left")).unwrap();
        let c2 = right.add_content(fx.content("right")).unwrap();

        let receiver = fx.tree();
        let result = receiver
            .add_raw_changes(vec![c1.clone(), c2.clone()])
            .unwrap();
        assert_eq!(result.outcome, AddOutcome::Append);
        let mut expected = vec![c1.id, c2.id];
        expected.sort();
        assert_eq!(result.heads, expected);

        // a merge change authored on top of both heads
        right.add_raw_changes(vec![c1.clone()]).unwrap();
        let merge = right.add_content(fx.content("merge")).unwrap();
        let merged = Change::from_raw(&merge).unwrap();
        assert_eq!(merged.prev_ids().len(), 2);

        let result = receiver.add_raw_changes(vec![merge.clone()]).unwrap();
        assert_eq!(result.outcome, AddOutcome::Append);
        assert_eq!(result.heads, vec![merge.id]);
    }

    #[test]
    fn out_of_order_arrival() {
        let fx = fixture();
        let author = fx.tree();
        let root_id = author.root_id().unwrap();
        let c1 = author.add_content(fx.content("one")).unwrap();
        let c2 = author.add_content(fx.content("two")).unwrap();

        let receiver = fx.tree();
        let first = receiver.add_raw_changes(vec![c2.clone()]).unwrap();
        assert_eq!(first.outcome, AddOutcome::Nothing);
        assert_eq!(receiver.heads(), vec![root_id]);
        assert!(receiver.has_change(&c2.id));

        let second = receiver.add_raw_changes(vec![c1.clone()]).unwrap();
        assert_eq!(second.outcome, AddOutcome::Append);
        assert_eq!(receiver.heads(), vec![c2.id]);
    }

    #[test]
    fn tampered_signature_rolls_back() {
        let fx = fixture();
        let author = fx.tree();
        let mut c1 = author.add_content(fx.content("one")).unwrap();
        let mut sig = c1.signature.to_vec();
        sig[0] ^= 0xff;
        c1.signature = sig.into();

        let receiver = fx.tree();
        let prior_heads = receiver.heads();
        let result = receiver.add_raw_changes(vec![c1.clone()]).unwrap();
        assert_eq!(result.outcome, AddOutcome::InvalidBatch);
        assert_eq!(receiver.heads(), prior_heads);
        assert!(!receiver.has_change(&c1.id));
    }

    #[test]
    fn unauthorized_author_rolls_back() {
        let fx = fixture();
        let mut rng = StdRng::seed_from_u64(99);
        let stranger = Author::new(&mut rng);

        let author = fx.tree();
        let forged = author
            .add_content(SignableContent {
                author: stranger,
                data: Bytes::from_static(b"not allowed"),
                is_snapshot: false,
            })
            .unwrap();

        let receiver = fx.tree();
        let prior_heads = receiver.heads();
        let result = receiver.add_raw_changes(vec![forged.clone()]).unwrap();
        assert_eq!(result.outcome, AddOutcome::InvalidBatch);
        assert_eq!(receiver.heads(), prior_heads);
        assert!(!receiver.has_change(&forged.id));
    }

    #[test]
    fn snapshot_compaction_and_path() {
        let fx = fixture();
        let author = fx.tree();
        let genesis_id = author.root_id().unwrap();
        let mut raws = Vec::new();
        for i in 0..4 {
            raws.push(author.add_content(fx.content(&format!("c{i}"))).unwrap());
        }
        let snap = author.add_content(fx.snapshot("snap")).unwrap();
        raws.push(snap.clone());

        assert_eq!(author.root_id(), Some(snap.id));
        assert_eq!(author.snapshot_path().unwrap(), vec![snap.id, genesis_id]);

        let receiver = fx.tree();
        let result = receiver.add_raw_changes(raws).unwrap();
        assert_eq!(result.outcome, AddOutcome::Append);
        assert_eq!(receiver.heads(), vec![snap.id]);
        assert_eq!(receiver.root_id(), Some(snap.id));
        assert_eq!(receiver.snapshot_path().unwrap(), vec![snap.id, genesis_id]);
    }

    #[test]
    fn idempotent_ingest() {
        let fx = fixture();
        let author = fx.tree();
        let c1 = author.add_content(fx.content("one")).unwrap();
        let c2 = author.add_content(fx.content("two")).unwrap();

        let receiver = fx.tree();
        let first = receiver
            .add_raw_changes(vec![c1.clone(), c2.clone()])
            .unwrap();
        assert_eq!(first.outcome, AddOutcome::Append);

        let second = receiver.add_raw_changes(vec![c1, c2]).unwrap();
        assert_eq!(second.outcome, AddOutcome::Nothing);
        assert!(second.added.is_empty());
    }

    #[test]
    fn deterministic_iteration_across_load_orders() {
        let fx = fixture();
        let left = fx.tree();
        let right = fx.tree();
        let a = left.add_content(fx.content("a")).unwrap();
        let b = right.add_content(fx.content("b")).unwrap();

        let one = fx.tree();
        one.add_raw_changes(vec![a.clone(), b.clone()]).unwrap();
        let two = fx.tree();
        two.add_raw_changes(vec![b.clone()]).unwrap();
        two.add_raw_changes(vec![a.clone()]).unwrap();

        let collect = |tree: &ObjectTree<MemoryTreeStorage>| {
            let mut ids = Vec::new();
            tree.iterate(|ch| {
                ids.push(ch.id());
                true
            });
            ids
        };
        assert_eq!(collect(&one), collect(&two));

        // rebuilding from the same storage yields the same order again
        let rebuilt = fx.tree_on(one.inner.read().storage.clone());
        assert_eq!(collect(&one), collect(&rebuilt));
    }

    #[test]
    fn convergence_after_exchange() {
        let fx = fixture();
        let alice = fx.tree();
        let bob = fx.tree();
        alice.add_content(fx.content("a1")).unwrap();
        alice.add_content(fx.content("a2")).unwrap();
        bob.add_content(fx.content("b1")).unwrap();

        let from_alice = alice
            .changes_after_common_snapshot(&bob.snapshot_path().unwrap())
            .unwrap();
        let from_bob = bob
            .changes_after_common_snapshot(&alice.snapshot_path().unwrap())
            .unwrap();
        bob.add_raw_changes(from_alice).unwrap();
        alice.add_raw_changes(from_bob).unwrap();

        assert_eq!(alice.heads(), bob.heads());
        assert_eq!(alice.root_id(), bob.root_id());
    }

    #[test]
    fn empty_path_returns_full_document() {
        let fx = fixture();
        let author = fx.tree();
        let root_id = author.root_id().unwrap();
        author.add_content(fx.content("one")).unwrap();

        let raws = author.changes_after_common_snapshot(&[]).unwrap();
        let ids: Vec<ChangeId> = raws.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&root_id));

        // a fresh node can be seeded from the full document
        let receiver = fx.tree();
        let result = receiver.add_raw_changes(raws).unwrap();
        assert_eq!(result.heads, author.heads());
    }

    #[test]
    fn no_common_snapshot_is_an_error() {
        let fx = fixture();
        let author = fx.tree();
        let alien = ChangeId::for_payload(b"some other document");
        let err = author
            .changes_after_common_snapshot(&[alien])
            .unwrap_err();
        assert!(matches!(err, TreeError::NoCommonSnapshot));
    }

    #[test]
    fn batch_behind_snapshot_triggers_rebuild() {
        let fx = fixture();
        let author = fx.tree();
        // a fork authored before the snapshot existed
        let forker = fx.tree();
        let fork = forker.add_content(fx.content("fork")).unwrap();

        let c1 = author.add_content(fx.content("one")).unwrap();
        let snap = author.add_content(fx.snapshot("snap")).unwrap();
        assert_eq!(author.root_id(), Some(snap.id));

        let result = author.add_raw_changes(vec![fork.clone()]).unwrap();
        assert_eq!(result.outcome, AddOutcome::Rebuild);
        assert!(author.has_change(&fork.id));
        assert!(author.has_change(&c1.id));
        let mut expected = vec![snap.id, fork.id];
        expected.sort();
        assert_eq!(author.heads(), expected);
    }

    #[test]
    fn listener_sees_updates_and_rebuilds() {
        let fx = fixture();
        let listener = Arc::new(CountingListener::default());
        let tree = ObjectTree::build(
            fx.storage(),
            fx.acl.clone(),
            Some(listener.clone() as Arc<dyn TreeUpdateListener>),
        )
        .unwrap();
        assert_eq!(listener.rebuilds.load(Ordering::SeqCst), 1);

        let author = fx.tree();
        let c1 = author.add_content(fx.content("one")).unwrap();
        tree.add_raw_changes(vec![c1]).unwrap();
        assert_eq!(listener.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn storage_heads_are_repaired_on_build() {
        let fx = fixture();
        let storage = fx.storage();
        let author = fx.tree_on(storage.clone());
        let c1 = author.add_content(fx.content("one")).unwrap();
        // simulate a crash that left a head pointing at bytes that were
        // never written
        let phantom = ChangeId::for_payload(b"never persisted");
        storage.set_heads(&[c1.id, phantom]).unwrap();

        let reopened = fx.tree_on(storage.clone());
        assert_eq!(reopened.heads(), vec![c1.id]);
        assert_eq!(storage.heads().unwrap(), vec![c1.id]);
    }
}
