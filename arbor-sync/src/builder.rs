//! Rebuilding a [`Tree`] from storage.
//!
//! Starts at the storage head set, walks parent pointers depth-first with
//! verification and deduplication, and cuts each branch at the common
//! snapshot. Extra changes are ingested as if they had been loaded, which is
//! how a batch descending from an older snapshot gets merged back in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::change::{Change, ChangeId};
use crate::keychain::Keychain;
use crate::objecttree::TreeError;
use crate::store::TreeStorage;
use crate::tree::Tree;

/// Upper bound on snapshot-chain walks; a longer chain means a cycle.
const MAX_SNAPSHOT_DEPTH: usize = 10_000;

/// Loads a single change without verifying its signature.
pub(crate) fn load_change<S: TreeStorage>(
    storage: &S,
    id: &ChangeId,
) -> Result<Arc<Change>, TreeError> {
    let raw = storage.get_raw_change(id)?;
    Ok(Arc::new(Change::from_raw(&raw)?))
}

fn load_verified<S: TreeStorage>(
    storage: &S,
    keychain: &mut Keychain,
    id: &ChangeId,
) -> Result<Arc<Change>, TreeError> {
    let raw = storage.get_raw_change(id)?;
    Ok(Arc::new(Change::from_raw_verified(&raw, keychain)?))
}

/// The snapshot governing a change: itself when it is a snapshot, otherwise
/// the snapshot it descends from.
fn governing_base(change: &Change) -> ChangeId {
    if change.is_snapshot() {
        change.id()
    } else {
        change.snapshot_base_id().unwrap_or_else(|| change.id())
    }
}

/// Rebuilds a tree from `storage` merged with `extra` changes.
///
/// The root is the deepest snapshot common to every snapshot-base chain
/// reachable from the storage heads and the extras; distinct chains with no
/// common element fail with [`TreeError::MultipleRoots`]. Changes that fail
/// to load or verify are skipped, mirroring the append-only storage contract:
/// a partially written batch is reconciled, not fatal.
pub(crate) fn build_tree<S: TreeStorage>(
    storage: &S,
    keychain: &mut Keychain,
    extra: &[Arc<Change>],
) -> Result<Tree, TreeError> {
    let heads = storage.heads()?;
    let extras: HashMap<ChangeId, Arc<Change>> =
        extra.iter().map(|ch| (ch.id(), ch.clone())).collect();

    // entry points: head changes plus extras
    let mut entries: Vec<Arc<Change>> = extras.values().cloned().collect();
    for head in &heads {
        if extras.contains_key(head) {
            continue;
        }
        match load_verified(storage, keychain, head) {
            Ok(change) => entries.push(change),
            Err(err) => warn!(id = %head.fmt_short(), %err, "skipping unloadable head"),
        }
    }
    if entries.is_empty() {
        return Err(TreeError::NoRoot);
    }

    let root_id = find_root(storage, &extras, &entries)?;
    let root = match extras.get(&root_id) {
        Some(change) => change.clone(),
        None => load_verified(storage, keychain, &root_id)?,
    };

    let mut tree = Tree::with_root(root);
    let mut visited: HashSet<ChangeId> = [root_id].into_iter().collect();
    let mut stack: Vec<ChangeId> = entries.iter().map(|ch| ch.id()).collect();
    let mut collected: Vec<Arc<Change>> = Vec::new();

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let change = match extras.get(&id) {
            Some(change) => change.clone(),
            None => match load_verified(storage, keychain, &id) {
                Ok(change) => change,
                Err(err) => {
                    warn!(id = %id.fmt_short(), %err, "skipping unloadable change");
                    continue;
                }
            },
        };
        if change.prev_ids().is_empty() || change.is_snapshot() {
            tree.mark_possible_root(id);
        }
        for prev in change.prev_ids() {
            if !visited.contains(prev) {
                stack.push(*prev);
            }
        }
        collected.push(change);
    }

    tree.add(collected);
    Ok(tree)
}

/// Intersects the snapshot-base chains of all entry points.
fn find_root<S: TreeStorage>(
    storage: &S,
    extras: &HashMap<ChangeId, Arc<Change>>,
    entries: &[Arc<Change>],
) -> Result<ChangeId, TreeError> {
    let bases: Vec<ChangeId> = {
        let mut seen = HashSet::new();
        let mut bases = Vec::new();
        for change in entries {
            let base = governing_base(change);
            if seen.insert(base) {
                bases.push(base);
            }
        }
        bases
    };
    if bases.len() == 1 {
        return Ok(bases[0]);
    }

    let chains: Vec<Vec<ChangeId>> = bases
        .iter()
        .map(|base| snapshot_chain(storage, extras, *base))
        .collect();
    let (first, rest) = chains.split_first().ok_or(TreeError::NoRoot)?;
    first
        .iter()
        .find(|id| rest.iter().all(|chain| chain.contains(id)))
        .copied()
        .ok_or(TreeError::MultipleRoots)
}

/// Walks snapshot-base links from `base` back to genesis, as far as the
/// available changes allow.
fn snapshot_chain<S: TreeStorage>(
    storage: &S,
    extras: &HashMap<ChangeId, Arc<Change>>,
    base: ChangeId,
) -> Vec<ChangeId> {
    let mut chain = Vec::new();
    let mut current = Some(base);
    while let Some(id) = current {
        if chain.len() >= MAX_SNAPSHOT_DEPTH || chain.contains(&id) {
            break;
        }
        chain.push(id);
        let change = match extras.get(&id) {
            Some(change) => change.clone(),
            None => match load_change(storage, &id) {
                Ok(change) => change,
                Err(_) => break,
            },
        };
        current = change.snapshot_base_id();
    }
    chain
}
