//! The in-memory DAG of changes.
//!
//! Changes live in one of two partitions: `attached` (reachable from the
//! root, all parents present) or `unattached` (verified but waiting for
//! parents). The head set is the current frontier: attached changes no
//! attached change descends from. The root is the change whose ancestors have
//! been compacted away; it is always a snapshot or the initial change.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::change::{Change, ChangeId};

/// What a call to [`Tree::add`] did to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No change was attached.
    Nothing,
    /// Changes were attached, all of them on the current frontier.
    Append,
    /// A change attached behind the prior heads; listeners should re-read
    /// the whole tree.
    Rebuild,
}

/// Ids attached by a single [`Tree::add_traced`] call, in attach order.
#[derive(Debug, Default)]
pub(crate) struct AddTrace {
    pub attached: Vec<ChangeId>,
}

#[derive(Debug, Default)]
pub struct Tree {
    root_id: Option<ChangeId>,
    attached: HashMap<ChangeId, Arc<Change>>,
    unattached: HashMap<ChangeId, Arc<Change>>,
    /// Forward edges between attached changes.
    children: HashMap<ChangeId, Vec<ChangeId>>,
    /// Sorted frontier.
    heads: Vec<ChangeId>,
    possible_roots: Vec<ChangeId>,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    pub fn with_root(root: Arc<Change>) -> Self {
        let mut tree = Tree::default();
        let id = root.id();
        tree.root_id = Some(id);
        tree.attached.insert(id, root);
        tree.heads = vec![id];
        tree
    }

    pub fn root_id(&self) -> Option<ChangeId> {
        self.root_id
    }

    pub fn root(&self) -> Option<&Arc<Change>> {
        self.root_id.and_then(|id| self.attached.get(&id))
    }

    pub fn heads(&self) -> &[ChangeId] {
        &self.heads
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }

    pub fn attached_len(&self) -> usize {
        self.attached.len()
    }

    pub fn unattached_len(&self) -> usize {
        self.unattached.len()
    }

    /// Looks up an attached change.
    pub fn get(&self, id: &ChangeId) -> Option<&Arc<Change>> {
        self.attached.get(id)
    }

    /// Whether the id is known in either partition.
    pub fn has_change(&self, id: &ChangeId) -> bool {
        self.attached.contains_key(id) || self.unattached.contains_key(id)
    }

    /// Adds candidates, attaching every change whose parents are attached and
    /// draining any previously unattached changes this unblocks. Candidates
    /// whose parents are still missing are parked in the unattached
    /// partition.
    pub fn add<I>(&mut self, changes: I) -> Mode
    where
        I: IntoIterator<Item = Arc<Change>>,
    {
        self.add_traced(changes).0
    }

    pub(crate) fn add_traced<I>(&mut self, changes: I) -> (Mode, AddTrace)
    where
        I: IntoIterator<Item = Arc<Change>>,
    {
        let prev_heads: HashSet<ChangeId> = self.heads.iter().copied().collect();

        for change in changes {
            let id = change.id();
            if self.has_change(&id) || Some(id) == self.root_id {
                continue;
            }
            self.unattached.insert(id, change);
        }

        let mut trace = AddTrace::default();
        let mut attached_now: HashSet<ChangeId> = HashSet::new();
        let mut fork = false;

        loop {
            let mut ready: Vec<ChangeId> = self
                .unattached
                .values()
                .filter(|ch| self.can_attach(ch))
                .map(|ch| ch.id())
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort();
            for id in ready {
                let change = match self.unattached.remove(&id) {
                    Some(change) => change,
                    None => continue,
                };
                // a parent that was attached before this call but is not a
                // prior head means the batch forked behind the frontier
                fork |= change.prev_ids().iter().any(|p| {
                    self.attached.contains_key(p)
                        && !prev_heads.contains(p)
                        && !attached_now.contains(p)
                });
                self.attach(change);
                attached_now.insert(id);
                trace.attached.push(id);
            }
        }

        let mode = if trace.attached.is_empty() {
            Mode::Nothing
        } else {
            self.recompute_heads();
            if fork {
                Mode::Rebuild
            } else {
                Mode::Append
            }
        };
        (mode, trace)
    }

    /// Optimistically appends a locally authored change whose parents are the
    /// current heads. A local change failing to attach to the heads it was
    /// built from is a broken invariant, hence the panic.
    pub fn add_merged_head(&mut self, change: Arc<Change>) {
        let id = change.id();
        if self.attached.is_empty() {
            self.root_id = Some(id);
            self.attached.insert(id, change);
            self.heads = vec![id];
            return;
        }
        for prev in change.prev_ids() {
            assert!(
                self.attached.contains_key(prev),
                "locally authored change {id} references unattached parent {prev}",
            );
        }
        self.attach(change);
        self.heads = vec![id];
    }

    fn can_attach(&self, change: &Change) -> bool {
        !change.prev_ids().is_empty()
            && change
                .prev_ids()
                .iter()
                .all(|p| self.attached.contains_key(p))
    }

    fn attach(&mut self, change: Arc<Change>) {
        let id = change.id();
        for prev in change.prev_ids() {
            self.children.entry(*prev).or_default().push(id);
        }
        self.attached.insert(id, change);
    }

    fn recompute_heads(&mut self) {
        let mut heads: Vec<ChangeId> = self
            .attached
            .keys()
            .filter(|id| self.children.get(id).map_or(true, |c| c.is_empty()))
            .copied()
            .collect();
        heads.sort();
        self.heads = heads;
    }

    /// Undoes one `add_traced` call: candidates disappear entirely, drained
    /// non-candidates return to the unattached partition, and the head set is
    /// restored. Leaves the tree indistinguishable from its pre-call state.
    pub(crate) fn rollback(
        &mut self,
        trace: &AddTrace,
        candidates: &HashSet<ChangeId>,
        prev_heads: Vec<ChangeId>,
    ) {
        for id in trace.attached.iter().rev() {
            if let Some(change) = self.attached.remove(id) {
                for prev in change.prev_ids() {
                    if let Some(kids) = self.children.get_mut(prev) {
                        kids.retain(|k| k != id);
                    }
                }
                self.children.remove(id);
                if !candidates.contains(id) {
                    self.unattached.insert(*id, change);
                }
            }
        }
        for id in candidates {
            self.unattached.remove(id);
        }
        self.heads = prev_heads;
    }

    /// Compacts the tree: if all heads descend from a single snapshot other
    /// than the current root, advance the root to it and drop its ancestors
    /// from the attached partition. Returns whether the root advanced.
    pub fn reduce(&mut self) -> bool {
        let Some(root_id) = self.root_id else {
            return false;
        };
        if self.heads.is_empty() {
            return false;
        }

        let mut target: Option<ChangeId> = None;
        for head in &self.heads {
            let Some(change) = self.attached.get(head) else {
                return false;
            };
            let base = if change.is_snapshot() {
                change.id()
            } else {
                match change.snapshot_base_id() {
                    Some(base) => base,
                    None => return false,
                }
            };
            match target {
                None => target = Some(base),
                Some(t) if t == base => {}
                Some(_) => return false,
            }
        }
        let target = match target {
            Some(t) if t != root_id && self.attached.contains_key(&t) => t,
            _ => return false,
        };

        let mut keep = HashSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if keep.insert(id) {
                if let Some(kids) = self.children.get(&id) {
                    stack.extend(kids.iter().copied());
                }
            }
        }
        self.attached.retain(|id, _| keep.contains(id));
        self.children.retain(|id, _| keep.contains(id));
        self.possible_roots.retain(|id| keep.contains(id));
        self.root_id = Some(target);
        true
    }

    /// Causal traversal from `from`: every visited change is preceded by all
    /// of its visited parents, siblings ordered ascending by id. The order is
    /// a function of the attached set alone, independent of insertion order.
    pub fn iterate<F>(&self, from: &ChangeId, mut visit: F)
    where
        F: FnMut(&Change) -> bool,
    {
        if !self.attached.contains_key(from) {
            return;
        }

        let mut subtree = HashSet::new();
        let mut stack = vec![*from];
        while let Some(id) = stack.pop() {
            if subtree.insert(id) {
                if let Some(kids) = self.children.get(&id) {
                    stack.extend(kids.iter().copied());
                }
            }
        }

        let mut indegree: HashMap<ChangeId, usize> = HashMap::with_capacity(subtree.len());
        for id in &subtree {
            let Some(change) = self.attached.get(id) else {
                continue;
            };
            let n = change
                .prev_ids()
                .iter()
                .filter(|p| subtree.contains(p))
                .count();
            indegree.insert(*id, n);
        }

        let mut ready: BinaryHeap<Reverse<ChangeId>> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        while let Some(Reverse(id)) = ready.pop() {
            let Some(change) = self.attached.get(&id) else {
                continue;
            };
            if !visit(change) {
                return;
            }
            if let Some(kids) = self.children.get(&id) {
                for kid in kids {
                    if let Some(n) = indegree.get_mut(kid) {
                        *n -= 1;
                        if *n == 0 {
                            ready.push(Reverse(*kid));
                        }
                    }
                }
            }
        }
    }

    /// [`Self::iterate`] starting at the root.
    pub fn iterate_from_root<F>(&self, visit: F)
    where
        F: FnMut(&Change) -> bool,
    {
        if let Some(root) = self.root_id {
            self.iterate(&root, visit);
        }
    }

    /// Reverse traversal over attached changes, following parent links from
    /// `from` down to the root.
    pub fn dfs_prev<F>(&self, from: &[ChangeId], mut visit: F)
    where
        F: FnMut(&Change) -> bool,
    {
        let mut visited = HashSet::new();
        let mut stack: Vec<ChangeId> = from
            .iter()
            .filter(|id| self.attached.contains_key(id))
            .copied()
            .collect();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(change) = self.attached.get(&id) else {
                continue;
            };
            if !visit(change) {
                return;
            }
            for prev in change.prev_ids() {
                if self.attached.contains_key(prev) && !visited.contains(prev) {
                    stack.push(*prev);
                }
            }
        }
    }

    pub(crate) fn mark_possible_root(&mut self, id: ChangeId) {
        self.possible_roots.push(id);
    }

    /// Forgets root candidates recorded while building. Changes that looked
    /// parentless during the storage walk are not roots once the real root is
    /// known.
    pub fn clear_possible_roots(&mut self) {
        self.possible_roots.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::make_change;
    use super::*;

    fn root() -> Arc<Change> {
        make_change("root", &[], None, true)
    }

    #[test]
    fn linear_append() {
        let r = root();
        let rid = r.id();
        let mut tree = Tree::with_root(r);
        let c1 = make_change("c1", &[rid], Some(rid), false);
        let c2 = make_change("c2", &[c1.id()], Some(rid), false);
        let c2id = c2.id();

        let mode = tree.add(vec![c1, c2]);
        assert_eq!(mode, Mode::Append);
        assert_eq!(tree.heads(), &[c2id]);
        assert_eq!(tree.attached_len(), 3);
        assert_eq!(tree.unattached_len(), 0);
    }

    #[test]
    fn fork_and_merge() {
        let r = root();
        let rid = r.id();
        let mut tree = Tree::with_root(r);
        let c1 = make_change("c1", &[rid], Some(rid), false);
        let c2 = make_change("c2", &[rid], Some(rid), false);
        let mut expected = vec![c1.id(), c2.id()];
        expected.sort();

        assert_eq!(tree.add(vec![c1.clone(), c2.clone()]), Mode::Append);
        assert_eq!(tree.heads(), expected.as_slice());

        let c3 = make_change("c3", &[c1.id(), c2.id()], Some(rid), false);
        let c3id = c3.id();
        assert_eq!(tree.add(vec![c3]), Mode::Append);
        assert_eq!(tree.heads(), &[c3id]);
    }

    #[test]
    fn out_of_order_arrival() {
        let r = root();
        let rid = r.id();
        let mut tree = Tree::with_root(r);
        let c1 = make_change("c1", &[rid], Some(rid), false);
        let c2 = make_change("c2", &[c1.id()], Some(rid), false);
        let c2id = c2.id();

        assert_eq!(tree.add(vec![c2.clone()]), Mode::Nothing);
        assert_eq!(tree.heads(), &[rid]);
        assert_eq!(tree.unattached_len(), 1);
        assert!(tree.has_change(&c2id));

        assert_eq!(tree.add(vec![c1]), Mode::Append);
        assert_eq!(tree.heads(), &[c2id]);
        assert_eq!(tree.unattached_len(), 0);
    }

    #[test]
    fn fork_behind_frontier_is_rebuild() {
        let r = root();
        let rid = r.id();
        let mut tree = Tree::with_root(r);
        let c1 = make_change("c1", &[rid], Some(rid), false);
        let c2 = make_change("c2", &[c1.id()], Some(rid), false);
        tree.add(vec![c1.clone(), c2.clone()]);

        // forks off c1, which is attached but no longer a head
        let fork = make_change("fork", &[c1.id()], Some(rid), false);
        assert_eq!(tree.add(vec![fork.clone()]), Mode::Rebuild);
        let mut expected = vec![c2.id(), fork.id()];
        expected.sort();
        assert_eq!(tree.heads(), expected.as_slice());
    }

    #[test]
    fn rollback_restores_pre_call_state() {
        let r = root();
        let rid = r.id();
        let mut tree = Tree::with_root(r);
        let c1 = make_change("c1", &[rid], Some(rid), false);
        let c2 = make_change("c2", &[c1.id()], Some(rid), false);
        // c2 arrives early and parks unattached
        tree.add(vec![c2.clone()]);
        let prev_heads = tree.heads().to_vec();

        let (mode, trace) = tree.add_traced(vec![c1.clone()]);
        assert_eq!(mode, Mode::Append);
        let candidates: HashSet<ChangeId> = [c1.id()].into_iter().collect();
        tree.rollback(&trace, &candidates, prev_heads.clone());

        assert_eq!(tree.heads(), prev_heads.as_slice());
        assert!(!tree.has_change(&c1.id()));
        assert!(tree.has_change(&c2.id()));
        assert_eq!(tree.unattached_len(), 1);
        assert_eq!(tree.attached_len(), 1);
    }

    #[test]
    fn reduce_advances_root_to_snapshot() {
        let r = root();
        let rid = r.id();
        let mut tree = Tree::with_root(r);
        let c1 = make_change("c1", &[rid], Some(rid), false);
        let snap = make_change("snap", &[c1.id()], Some(rid), true);
        let c2 = make_change("c2", &[snap.id()], Some(snap.id()), false);
        tree.add(vec![c1.clone(), snap.clone(), c2.clone()]);

        assert!(tree.reduce());
        assert_eq!(tree.root_id(), Some(snap.id()));
        assert_eq!(tree.heads(), &[c2.id()]);
        assert!(tree.get(&c1.id()).is_none());
        assert!(tree.get(&rid).is_none());
        // nothing left to reduce
        assert!(!tree.reduce());
    }

    #[test]
    fn iteration_order_is_insertion_independent() {
        let r = root();
        let rid = r.id();
        let a = make_change("a", &[rid], Some(rid), false);
        let b = make_change("b", &[rid], Some(rid), false);
        let c = make_change("c", &[a.id(), b.id()], Some(rid), false);

        let mut forward = Tree::with_root(root());
        forward.add(vec![a.clone(), b.clone(), c.clone()]);
        let mut backward = Tree::with_root(root());
        backward.add(vec![c.clone()]);
        backward.add(vec![b.clone()]);
        backward.add(vec![a.clone()]);

        let collect = |tree: &Tree| {
            let mut ids = Vec::new();
            tree.iterate_from_root(|ch| {
                ids.push(ch.id());
                true
            });
            ids
        };
        assert_eq!(collect(&forward), collect(&backward));
        assert_eq!(collect(&forward).len(), 4);
    }

    #[test]
    fn dfs_prev_visits_all_ancestors() {
        let r = root();
        let rid = r.id();
        let mut tree = Tree::with_root(r);
        let c1 = make_change("c1", &[rid], Some(rid), false);
        let c2 = make_change("c2", &[c1.id()], Some(rid), false);
        tree.add(vec![c1, c2]);

        let mut seen = 0;
        tree.dfs_prev(&tree.heads().to_vec(), |_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 3);
    }

    #[test]
    fn parentless_stranger_never_attaches() {
        let r = root();
        let mut tree = Tree::with_root(r);
        let stranger = make_change("stranger", &[], None, true);
        assert_eq!(tree.add(vec![stranger.clone()]), Mode::Nothing);
        assert!(tree.get(&stranger.id()).is_none());
        assert!(tree.has_change(&stranger.id()));
    }
}
