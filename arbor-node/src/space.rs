//! Spaces: the unit of node-level routing.
//!
//! A [`NodeSpace`] owns one space's ACL list, a cache of its live object
//! trees, and the peer manager used to fan updates out. The
//! [`NodeSpaceService`] owns the space cache itself: spaces load on demand,
//! are checked against the deletion registry, and expire back out of memory
//! when idle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use arbor_sync::acl::AclList;
use arbor_sync::change::ChangeId;
use arbor_sync::objecttree::{ObjectTree, TreeError, TreeUpdateListener};
use arbor_sync::store::{TreeStorage, TreeStorageCreatePayload};

use crate::cache::{CacheError, CacheGuard, CacheObject, LoadMode, LoadRequest, Loader, ObjectCache};
use crate::metrics::NodeMetrics;
use crate::nodeconf::NodeConf;
use crate::peers::{PeerManager, PeerPool, SpaceMessage, StreamPool, TreeHeads};
use crate::storage::{
    NodeStorage, SpaceStatus, SpaceStorage, SpaceStorageCreatePayload, StorageError,
};

/// Errors of the space service.
#[derive(Debug, thiserror::Error)]
pub enum SpaceError {
    #[error("space is deleted")]
    SpaceIsDeleted,
    #[error("space storage doesn't support stats")]
    DoesntSupportStats,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("storage: {0}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for SpaceError {
    fn from(err: anyhow::Error) -> Self {
        SpaceError::Storage(err)
    }
}

/// Change-size stats of one space.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ChangeSizeStats {
    pub max_len: usize,
}

/// Stats served for one space.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SpaceStats {
    pub change_size: ChangeSizeStats,
}

/// Requests head synchronization for trees of a space.
#[async_trait]
pub trait TreeSyncer: Send + Sync + 'static {
    async fn request_sync(&self, space_id: &str, trees: Vec<TreeHeads>) -> anyhow::Result<()>;
}

/// Ships head-sync requests to the responsible peers.
pub struct PeerTreeSyncer {
    peers: Arc<PeerManager>,
    space_hash: String,
}

#[async_trait]
impl TreeSyncer for PeerTreeSyncer {
    async fn request_sync(&self, space_id: &str, trees: Vec<TreeHeads>) -> anyhow::Result<()> {
        let msg = SpaceMessage::HeadSyncRequest {
            space_id: space_id.to_string(),
            space_hash: self.space_hash.clone(),
            ranges: trees,
        };
        self.peers.send_responsible(&msg).await?;
        Ok(())
    }
}

/// Observes sync lifecycle transitions of a space.
pub trait SyncStatusListener: Send + Sync + 'static {
    fn on_sync_started(&self, space_id: &str);
    fn on_sync_failed(&self, space_id: &str);
}

/// The default listener: nodes don't track per-space sync status.
#[derive(Debug, Default)]
pub struct NoOpSyncStatus;

impl SyncStatusListener for NoOpSyncStatus {
    fn on_sync_started(&self, _space_id: &str) {}

    fn on_sync_failed(&self, _space_id: &str) {}
}

/// Broadcasts tree updates to the space's peers. Holds no reference back to
/// the tree or its cache.
struct SpaceNotifier {
    space_id: String,
    peers: Arc<PeerManager>,
}

impl TreeUpdateListener for SpaceNotifier {
    fn update(&self, id: &ChangeId, heads: &[ChangeId]) {
        self.post(id, heads);
    }

    fn rebuild(&self, id: &ChangeId, heads: &[ChangeId]) {
        self.post(id, heads);
    }
}

impl SpaceNotifier {
    fn post(&self, id: &ChangeId, heads: &[ChangeId]) {
        let msg = SpaceMessage::ObjectSync {
            space_id: self.space_id.clone(),
            tree_id: *id,
            heads: heads.to_vec(),
            changes: Vec::new(),
            snapshot_path: Vec::new(),
        };
        let peers = self.peers.clone();
        // the listener fires under the tree's write lock; the broadcast must
        // not run there
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = peers.broadcast_message(&msg).await {
                    debug!(%err, "broadcasting tree update failed");
                }
            });
        }
    }
}

/// The storage handle trees run on inside the node.
pub type SpaceTreeStorage = Arc<dyn TreeStorage>;

/// A live object tree owned by a space's tree cache.
pub struct SpaceTree {
    tree: ObjectTree<SpaceTreeStorage>,
}

impl SpaceTree {
    pub fn tree(&self) -> &ObjectTree<SpaceTreeStorage> {
        &self.tree
    }
}

impl CacheObject for SpaceTree {
    fn close(&self) -> anyhow::Result<()> {
        self.tree.close()?;
        Ok(())
    }
}

/// Loads live trees for one space's tree cache.
pub struct TreeLoader {
    space_id: String,
    storage: Arc<dyn SpaceStorage>,
    acl: Arc<RwLock<AclList>>,
    peers: Arc<PeerManager>,
}

impl Loader for TreeLoader {
    type Object = SpaceTree;
    type CreatePayload = TreeStorageCreatePayload;

    async fn load(&self, req: LoadRequest<TreeStorageCreatePayload>) -> anyhow::Result<SpaceTree> {
        let storage = match req.mode {
            LoadMode::Open => {
                let id: ChangeId = req.id.parse()?;
                self.storage.tree_storage(&id)?
            }
            LoadMode::Create(payload) => self.storage.create_tree_storage(payload)?,
        };
        let listener: Arc<dyn TreeUpdateListener> = Arc::new(SpaceNotifier {
            space_id: self.space_id.clone(),
            peers: self.peers.clone(),
        });
        let tree = ObjectTree::build(storage, self.acl.clone(), Some(listener))?;
        debug!(space_id = %self.space_id, tree_id = %tree.id().fmt_short(), "tree loaded");
        Ok(SpaceTree { tree })
    }
}

/// One live space.
pub struct NodeSpace {
    space_id: String,
    storage: Arc<dyn SpaceStorage>,
    acl: Arc<RwLock<AclList>>,
    peers: Arc<PeerManager>,
    trees: ObjectCache<TreeLoader>,
    syncer: Arc<dyn TreeSyncer>,
    sync_status: Arc<dyn SyncStatusListener>,
}

impl NodeSpace {
    pub fn id(&self) -> &str {
        &self.space_id
    }

    pub fn storage(&self) -> &Arc<dyn SpaceStorage> {
        &self.storage
    }

    pub fn acl(&self) -> &Arc<RwLock<AclList>> {
        &self.acl
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    /// Kicks off head synchronization for everything the space stores.
    pub(crate) async fn init(&self) -> anyhow::Result<()> {
        let heads = self.all_heads()?;
        debug!(space_id = %self.space_id, trees = heads.len(), "space initialized");
        self.sync_status.on_sync_started(&self.space_id);
        if let Err(err) = self.syncer.request_sync(&self.space_id, heads).await {
            // transient: responsible peers may be unreachable right now, the
            // next hot-sync round retries
            info!(space_id = %self.space_id, %err, "initial head sync not delivered");
            self.sync_status.on_sync_failed(&self.space_id);
        }
        Ok(())
    }

    /// Borrows a live tree, loading it from the space storage if needed.
    pub async fn get_tree(&self, id: &ChangeId) -> Result<CacheGuard<SpaceTree>, SpaceError> {
        let guard = self
            .trees
            .get(LoadRequest {
                id: id.to_string(),
                mode: LoadMode::Open,
            })
            .await?;
        Ok(guard)
    }

    /// Creates a tree from a payload and loads it.
    pub async fn create_tree(
        &self,
        payload: TreeStorageCreatePayload,
    ) -> Result<CacheGuard<SpaceTree>, SpaceError> {
        let guard = self
            .trees
            .get(LoadRequest {
                id: payload.root.id.to_string(),
                mode: LoadMode::Create(payload),
            })
            .await?;
        Ok(guard)
    }

    /// Ingests inbound change bytes for one tree: the receive path of the
    /// peer protocol.
    pub async fn add_raw_changes(
        &self,
        tree_id: &ChangeId,
        changes: Vec<arbor_sync::change::RawChange>,
    ) -> Result<arbor_sync::objecttree::AddResult, SpaceError> {
        let tree = self.get_tree(tree_id).await?;
        Ok(tree.tree().add_raw_changes(changes)?)
    }

    /// Heads of every stored tree, straight from storage.
    pub fn all_heads(&self) -> anyhow::Result<Vec<TreeHeads>> {
        let mut out = Vec::new();
        for id in self.storage.stored_ids()? {
            let tree_storage = self.storage.tree_storage(&id)?;
            out.push(TreeHeads {
                id,
                heads: tree_storage.heads()?,
            });
        }
        Ok(out)
    }

    /// The tree cache, for enumeration surfaces.
    pub fn tree_cache(&self) -> &ObjectCache<TreeLoader> {
        &self.trees
    }
}

impl CacheObject for NodeSpace {
    fn close(&self) -> anyhow::Result<()> {
        self.trees.close();
        Ok(())
    }
}

/// Knobs of the space service.
#[derive(Debug, Clone)]
pub struct SpaceServiceConfig {
    /// Seconds an idle space (or tree) stays cached.
    pub gc_ttl: Duration,
    /// Sweep period of the caches.
    pub gc_period: Duration,
}

impl Default for SpaceServiceConfig {
    fn default() -> Self {
        SpaceServiceConfig {
            gc_ttl: Duration::from_secs(60),
            gc_period: Duration::from_secs(60),
        }
    }
}

/// Loads live spaces for the service's space cache.
pub struct SpaceLoader {
    storage: Arc<dyn NodeStorage>,
    node_conf: Arc<NodeConf>,
    pool: Arc<dyn PeerPool>,
    streams: Arc<dyn StreamPool>,
    config: SpaceServiceConfig,
    metrics: Arc<NodeMetrics>,
}

impl SpaceLoader {
    fn check_deletion_status(&self, space_id: &str) -> anyhow::Result<()> {
        let deletion = self.storage.deletion_storage();
        match deletion.space_status(space_id) {
            Ok(SpaceStatus::Remove) => Err(SpaceError::SpaceIsDeleted.into()),
            Ok(SpaceStatus::Ok) => Ok(()),
            Err(err) => match err.downcast_ref::<StorageError>() {
                // never marked: a fresh space
                Some(StorageError::UnknownSpaceId) => Ok(()),
                _ => Err(err),
            },
        }
    }
}

impl Loader for SpaceLoader {
    type Object = NodeSpace;
    type CreatePayload = SpaceStorageCreatePayload;

    async fn load(&self, req: LoadRequest<SpaceStorageCreatePayload>) -> anyhow::Result<NodeSpace> {
        let space_id = req.id.clone();
        let result = self.load_inner(req).await;
        match &result {
            Ok(_) => {
                info!(id = %space_id, "space loaded");
                self.metrics.spaces_loaded.inc();
            }
            Err(err) => {
                info!(id = %space_id, %err, "space load failed");
                self.metrics.space_load_errors.inc();
            }
        }
        result
    }
}

impl SpaceLoader {
    async fn load_inner(
        &self,
        req: LoadRequest<SpaceStorageCreatePayload>,
    ) -> anyhow::Result<NodeSpace> {
        let space_id = req.id.clone();
        self.check_deletion_status(&space_id)?;

        let storage = match req.mode {
            LoadMode::Open => self.storage.space_storage(&space_id)?,
            LoadMode::Create(payload) => self.storage.create_space_storage(payload)?,
        };

        let acl = Arc::new(RwLock::new(AclList::build(None, storage.acl_records()?)?));
        let peers = Arc::new(PeerManager::new(
            space_id.clone(),
            self.node_conf.clone(),
            self.pool.clone(),
            self.streams.clone(),
        ));
        let space_hash = storage.read_space_hash().unwrap_or_default();
        let syncer: Arc<dyn TreeSyncer> = Arc::new(PeerTreeSyncer {
            peers: peers.clone(),
            space_hash,
        });
        let trees = ObjectCache::with_gc_period(
            TreeLoader {
                space_id: space_id.clone(),
                storage: storage.clone(),
                acl: acl.clone(),
                peers: peers.clone(),
            },
            self.config.gc_ttl,
            self.config.gc_period,
        );
        trees.run_gc();

        let space = NodeSpace {
            space_id,
            storage,
            acl,
            peers,
            trees,
            syncer,
            sync_status: Arc::new(NoOpSyncStatus),
        };
        space.init().await?;
        Ok(space)
    }
}

/// Owns the space cache; loads spaces on demand and serves stats.
pub struct NodeSpaceService {
    cache: ObjectCache<SpaceLoader>,
    storage: Arc<dyn NodeStorage>,
}

impl NodeSpaceService {
    pub fn new(
        config: SpaceServiceConfig,
        storage: Arc<dyn NodeStorage>,
        node_conf: Arc<NodeConf>,
        pool: Arc<dyn PeerPool>,
        streams: Arc<dyn StreamPool>,
        metrics: Arc<NodeMetrics>,
    ) -> Arc<Self> {
        let loader = SpaceLoader {
            storage: storage.clone(),
            node_conf,
            pool,
            streams,
            config: config.clone(),
            metrics,
        };
        Arc::new(NodeSpaceService {
            cache: ObjectCache::with_gc_period(loader, config.gc_ttl, config.gc_period),
            storage,
        })
    }

    /// Starts background maintenance.
    pub fn run(&self) {
        self.cache.run_gc();
    }

    pub fn storage(&self) -> &Arc<dyn NodeStorage> {
        &self.storage
    }

    /// Borrows a space, loading it if needed.
    pub async fn get_space(&self, id: &str) -> Result<CacheGuard<NodeSpace>, SpaceError> {
        let guard = self
            .cache
            .get(LoadRequest {
                id: id.to_string(),
                mode: LoadMode::Open,
            })
            .await?;
        Ok(guard)
    }

    /// Creates a space from a payload and loads it.
    pub async fn create_space(
        &self,
        payload: SpaceStorageCreatePayload,
    ) -> Result<CacheGuard<NodeSpace>, SpaceError> {
        let guard = self
            .cache
            .get(LoadRequest {
                id: payload.header.id.clone(),
                mode: LoadMode::Create(payload),
            })
            .await?;
        Ok(guard)
    }

    /// Borrows a space only if it is already live.
    pub fn pick_space(&self, id: &str) -> Result<CacheGuard<NodeSpace>, SpaceError> {
        Ok(self.cache.pick(id)?)
    }

    /// The space cache, for enumeration surfaces.
    pub fn cache(&self) -> &ObjectCache<SpaceLoader> {
        &self.cache
    }

    /// Opens the space and reads stats through the storage's optional stats
    /// capability. The space is released afterwards.
    pub async fn get_stats(&self, id: &str) -> Result<SpaceStats, SpaceError> {
        let space = self.get_space(id).await?;
        let storage = space.storage();
        let stats = storage.stats().ok_or(SpaceError::DoesntSupportStats)?;
        let max_len = stats.max_change_len()?;
        Ok(SpaceStats {
            change_size: ChangeSizeStats { max_len },
        })
    }

    pub fn close(&self) {
        self.cache.close();
    }
}

impl Drop for NodeSpaceService {
    fn drop(&mut self) {
        self.cache.close();
    }
}
