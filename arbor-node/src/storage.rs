//! Node-level storage contracts: per-space storage, the deletion registry,
//! and in-memory implementations backing tests and the default wiring.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use arbor_sync::acl::AclRecord;
use arbor_sync::change::ChangeId;
use arbor_sync::store::memory::MemoryTreeStorage;
use arbor_sync::store::{TreeStorage, TreeStorageCreatePayload};

/// Typed storage failures the node distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unknown space id")]
    UnknownSpaceId,
    #[error("unknown tree id")]
    UnknownTreeId,
    #[error("space storage already exists")]
    SpaceExists,
    #[error("space storage is locked, try again later")]
    SpaceStorageIsLocked,
}

/// Deletion status of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceStatus {
    Ok,
    Remove,
}

/// Descriptor of a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceHeader {
    pub id: String,
    pub payload: Bytes,
}

/// Everything needed to create the storage of a fresh space.
#[derive(Debug, Clone)]
pub struct SpaceStorageCreatePayload {
    pub header: SpaceHeader,
    pub acl_root: AclRecord,
    pub settings_root: TreeStorageCreatePayload,
}

/// The optional stats capability of a space storage.
pub trait SpaceStorageStats: Send + Sync {
    /// Length of the largest change stored in the space.
    fn max_change_len(&self) -> Result<usize>;
}

/// Storage of one space: its header, ACL records, and tree storages.
pub trait SpaceStorage: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn header(&self) -> Result<SpaceHeader>;

    /// The ACL records in list order.
    fn acl_records(&self) -> Result<Vec<AclRecord>>;

    /// Appends an ACL record; idempotent by id.
    fn add_acl_record(&self, record: AclRecord) -> Result<()>;

    fn create_tree_storage(
        &self,
        payload: TreeStorageCreatePayload,
    ) -> Result<Arc<dyn TreeStorage>>;

    fn tree_storage(&self, id: &ChangeId) -> Result<Arc<dyn TreeStorage>>;

    fn set_tree_deleted_status(&self, id: &ChangeId, status: &str) -> Result<()>;

    fn tree_deleted_status(&self, id: &ChangeId) -> Result<Option<String>>;

    /// Ids of every stored tree, settings tree included.
    fn stored_ids(&self) -> Result<Vec<ChangeId>>;

    fn write_space_hash(&self, hash: &str) -> Result<()>;

    fn read_space_hash(&self) -> Result<String>;

    /// Downcast to the stats capability, when the backend supports it.
    fn stats(&self) -> Option<&dyn SpaceStorageStats> {
        None
    }
}

/// The per-node deletion registry, keyed by space id.
pub trait DeletionStorage: Send + Sync + 'static {
    /// Fails with [`StorageError::UnknownSpaceId`] for spaces never marked.
    fn space_status(&self, space_id: &str) -> Result<SpaceStatus>;

    fn set_space_status(&self, space_id: &str, status: SpaceStatus) -> Result<()>;
}

/// Node storage: all spaces plus the deletion registry.
pub trait NodeStorage: Send + Sync + 'static {
    fn space_storage(&self, space_id: &str) -> Result<Arc<dyn SpaceStorage>>;

    fn create_space_storage(
        &self,
        payload: SpaceStorageCreatePayload,
    ) -> Result<Arc<dyn SpaceStorage>>;

    fn all_space_ids(&self) -> Result<Vec<String>>;

    fn deletion_storage(&self) -> Arc<dyn DeletionStorage>;
}

/// In-memory space storage.
#[derive(Debug)]
pub struct MemorySpaceStorage {
    id: String,
    header: SpaceHeader,
    settings_id: ChangeId,
    inner: RwLock<SpaceState>,
}

#[derive(Debug, Default)]
struct SpaceState {
    acl_records: Vec<AclRecord>,
    trees: HashMap<ChangeId, Arc<MemoryTreeStorage>>,
    deleted: HashMap<ChangeId, String>,
    space_hash: String,
}

impl MemorySpaceStorage {
    pub fn create(payload: SpaceStorageCreatePayload) -> Self {
        let settings = MemoryTreeStorage::create(payload.settings_root);
        let settings_id = settings.id();
        let mut trees = HashMap::new();
        trees.insert(settings_id, Arc::new(settings));
        MemorySpaceStorage {
            id: payload.header.id.clone(),
            header: payload.header,
            settings_id,
            inner: RwLock::new(SpaceState {
                acl_records: vec![payload.acl_root],
                trees,
                deleted: HashMap::new(),
                space_hash: String::new(),
            }),
        }
    }

    pub fn settings_id(&self) -> ChangeId {
        self.settings_id
    }
}

impl SpaceStorage for MemorySpaceStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn header(&self) -> Result<SpaceHeader> {
        Ok(self.header.clone())
    }

    fn acl_records(&self) -> Result<Vec<AclRecord>> {
        Ok(self.inner.read().acl_records.clone())
    }

    fn add_acl_record(&self, record: AclRecord) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.acl_records.iter().any(|r| r.id == record.id) {
            return Ok(());
        }
        inner.acl_records.push(record);
        Ok(())
    }

    fn create_tree_storage(
        &self,
        payload: TreeStorageCreatePayload,
    ) -> Result<Arc<dyn TreeStorage>> {
        let mut inner = self.inner.write();
        let id = payload.root.id;
        if let Some(existing) = inner.trees.get(&id) {
            return Ok(existing.clone());
        }
        let storage = Arc::new(MemoryTreeStorage::create(payload));
        inner.trees.insert(id, storage.clone());
        Ok(storage)
    }

    fn tree_storage(&self, id: &ChangeId) -> Result<Arc<dyn TreeStorage>> {
        let inner = self.inner.read();
        let storage = inner
            .trees
            .get(id)
            .cloned()
            .ok_or(StorageError::UnknownTreeId)?;
        Ok(storage)
    }

    fn set_tree_deleted_status(&self, id: &ChangeId, status: &str) -> Result<()> {
        self.inner.write().deleted.insert(*id, status.to_string());
        Ok(())
    }

    fn tree_deleted_status(&self, id: &ChangeId) -> Result<Option<String>> {
        Ok(self.inner.read().deleted.get(id).cloned())
    }

    fn stored_ids(&self) -> Result<Vec<ChangeId>> {
        let mut ids: Vec<ChangeId> = self.inner.read().trees.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn write_space_hash(&self, hash: &str) -> Result<()> {
        self.inner.write().space_hash = hash.to_string();
        Ok(())
    }

    fn read_space_hash(&self) -> Result<String> {
        Ok(self.inner.read().space_hash.clone())
    }

    fn stats(&self) -> Option<&dyn SpaceStorageStats> {
        Some(self)
    }
}

impl SpaceStorageStats for MemorySpaceStorage {
    fn max_change_len(&self) -> Result<usize> {
        let inner = self.inner.read();
        Ok(inner
            .trees
            .values()
            .filter_map(|t| t.max_change_len())
            .max()
            .unwrap_or(0))
    }
}

/// In-memory deletion registry.
#[derive(Debug, Default)]
pub struct MemoryDeletionStorage {
    statuses: RwLock<HashMap<String, SpaceStatus>>,
}

impl DeletionStorage for MemoryDeletionStorage {
    fn space_status(&self, space_id: &str) -> Result<SpaceStatus> {
        self.statuses
            .read()
            .get(space_id)
            .copied()
            .ok_or_else(|| StorageError::UnknownSpaceId.into())
    }

    fn set_space_status(&self, space_id: &str, status: SpaceStatus) -> Result<()> {
        self.statuses.write().insert(space_id.to_string(), status);
        Ok(())
    }
}

/// In-memory node storage.
#[derive(Debug, Default)]
pub struct MemoryNodeStorage {
    spaces: RwLock<HashMap<String, Arc<MemorySpaceStorage>>>,
    deletion: Arc<MemoryDeletionStorage>,
}

impl MemoryNodeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl NodeStorage for MemoryNodeStorage {
    fn space_storage(&self, space_id: &str) -> Result<Arc<dyn SpaceStorage>> {
        let spaces = self.spaces.read();
        let storage = spaces
            .get(space_id)
            .cloned()
            .ok_or(StorageError::UnknownSpaceId)?;
        Ok(storage)
    }

    fn create_space_storage(
        &self,
        payload: SpaceStorageCreatePayload,
    ) -> Result<Arc<dyn SpaceStorage>> {
        let mut spaces = self.spaces.write();
        if spaces.contains_key(&payload.header.id) {
            return Err(StorageError::SpaceExists.into());
        }
        let id = payload.header.id.clone();
        let storage = Arc::new(MemorySpaceStorage::create(payload));
        spaces.insert(id, storage.clone());
        Ok(storage)
    }

    fn all_space_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.spaces.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn deletion_storage(&self) -> Arc<dyn DeletionStorage> {
        self.deletion.clone()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use arbor_sync::acl::testutil as acl_testutil;
    use arbor_sync::acl::AclList;
    use arbor_sync::keys::AccountKeys;
    use arbor_sync::objecttree::create_tree_root;

    use super::*;

    /// A space payload with a real genesis ACL and settings root, authored by
    /// a deterministic account.
    pub fn space_payload(space_id: &str, seed: u64) -> (SpaceStorageCreatePayload, AccountKeys) {
        let mut rng = StdRng::seed_from_u64(seed);
        let account = AccountKeys::generate(&mut rng);
        let acl = acl_testutil::genesis(&account);
        let settings_root = create_tree_root(
            &account.signing,
            &acl,
            Bytes::from_static(b"settings"),
            space_id,
        )
        .unwrap();
        (
            SpaceStorageCreatePayload {
                header: SpaceHeader {
                    id: space_id.to_string(),
                    payload: Bytes::from_static(b"header"),
                },
                acl_root: acl.records()[0].clone(),
                settings_root,
            },
            account,
        )
    }

    /// Rebuilds the account-backed ACL list for a stored space.
    pub fn acl_for(storage: &dyn SpaceStorage, account: &AccountKeys) -> AclList {
        AclList::build(Some(account.clone()), storage.acl_records().unwrap()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::space_payload;
    use super::*;

    #[test]
    fn create_and_reopen_space() {
        let node = MemoryNodeStorage::new();
        let (payload, _) = space_payload("space.a", 1);
        let settings_id = payload.settings_root.root.id;

        let created = node.create_space_storage(payload.clone()).unwrap();
        assert_eq!(created.id(), "space.a");
        assert!(node.create_space_storage(payload).is_err());

        let reopened = node.space_storage("space.a").unwrap();
        assert_eq!(reopened.header().unwrap().id, "space.a");
        assert_eq!(reopened.stored_ids().unwrap(), vec![settings_id]);
        assert_eq!(reopened.acl_records().unwrap().len(), 1);
    }

    #[test]
    fn tree_storage_roundtrip_and_deleted_status() {
        let node = MemoryNodeStorage::new();
        let (payload, account) = space_payload("space.b", 2);
        let space = node.create_space_storage(payload).unwrap();

        let acl = super::testutil::acl_for(space.as_ref(), &account);
        let tree_payload = arbor_sync::objecttree::create_tree_root(
            &account.signing,
            &acl,
            Bytes::from_static(b"doc"),
            "space.b",
        )
        .unwrap();
        let tree_id = tree_payload.root.id;

        let tree = space.create_tree_storage(tree_payload).unwrap();
        assert_eq!(tree.id(), tree_id);
        assert_eq!(space.tree_storage(&tree_id).unwrap().id(), tree_id);
        assert_eq!(space.stored_ids().unwrap().len(), 2);

        assert_eq!(space.tree_deleted_status(&tree_id).unwrap(), None);
        space.set_tree_deleted_status(&tree_id, "deleted").unwrap();
        assert_eq!(
            space.tree_deleted_status(&tree_id).unwrap(),
            Some("deleted".to_string())
        );
    }

    #[test]
    fn space_hash_roundtrip() {
        let node = MemoryNodeStorage::new();
        let (payload, _) = space_payload("space.c", 3);
        let space = node.create_space_storage(payload).unwrap();

        space.write_space_hash("abc123").unwrap();
        assert_eq!(space.read_space_hash().unwrap(), "abc123");
    }

    #[test]
    fn deletion_statuses() {
        let node = MemoryNodeStorage::new();
        let deletion = node.deletion_storage();
        let err = deletion.space_status("nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::UnknownSpaceId)
        ));

        deletion
            .set_space_status("space.d", SpaceStatus::Remove)
            .unwrap();
        assert_eq!(
            deletion.space_status("space.d").unwrap(),
            SpaceStatus::Remove
        );
    }

    #[test]
    fn stats_capability_reports_max_change_len() {
        let node = MemoryNodeStorage::new();
        let (payload, _) = space_payload("space.e", 4);
        let expected = payload.settings_root.root.payload.len();
        let space = node.create_space_storage(payload).unwrap();

        let stats = space.stats().expect("memory storage supports stats");
        assert_eq!(stats.max_change_len().unwrap(), expected);
    }
}
