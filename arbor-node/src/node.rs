//! Node assembly and lifecycle.
//!
//! Components are built leaves-first and passed into their owners
//! explicitly; the [`Node`] owns run and close ordering.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::hotsync::HotSync;
use crate::metrics::NodeMetrics;
use crate::nodeconf::NodeConf;
use crate::peers::{DiscardStreams, DisconnectedPool, PeerPool, StreamPool};
use crate::rpc::{self, DebugState};
use crate::space::{NodeSpaceService, SpaceServiceConfig};
use crate::storage::{MemoryNodeStorage, NodeStorage};

/// A running sync node.
pub struct Node {
    config: Config,
    storage: Arc<dyn NodeStorage>,
    service: Arc<NodeSpaceService>,
    hotsync: Arc<HotSync>,
    registry: Arc<Mutex<Registry>>,
    hit: Arc<AtomicU32>,
    miss: Arc<AtomicU32>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Builds the component graph from the configuration. Leaves first:
    /// storage, node table, pools, metrics, then the services that own them.
    pub fn build(config: Config) -> Result<Node> {
        let storage: Arc<dyn NodeStorage> = MemoryNodeStorage::new();
        if !config.storage.path.is_empty() {
            // the kv driver is provided by the embedding binary; this one
            // runs on the in-memory backend
            warn!(path = %config.storage.path, "storage.path set but no disk driver is linked, running in memory");
        }

        let node_conf = Arc::new(NodeConf::new(config.nodes.clone(), config.replication));
        let pool: Arc<dyn PeerPool> = Arc::new(DisconnectedPool);
        let streams: Arc<dyn StreamPool> = Arc::new(DiscardStreams);

        let mut registry = Registry::default();
        let metrics = Arc::new(NodeMetrics::new(&mut registry));

        let service = NodeSpaceService::new(
            SpaceServiceConfig {
                gc_ttl: std::time::Duration::from_secs(config.space.gc_ttl),
                ..SpaceServiceConfig::default()
            },
            storage.clone(),
            node_conf,
            pool,
            streams,
            metrics.clone(),
        );

        let hit = Arc::new(AtomicU32::new(0));
        let miss = Arc::new(AtomicU32::new(0));
        let hotsync = HotSync::new(
            service.clone(),
            config.space.hot_sync.simultaneous_requests,
            hit.clone(),
            miss.clone(),
        );

        Ok(Node {
            config,
            storage,
            service,
            hotsync,
            registry: Arc::new(Mutex::new(registry)),
            hit,
            miss,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn service(&self) -> &Arc<NodeSpaceService> {
        &self.service
    }

    pub fn hotsync(&self) -> &Arc<HotSync> {
        &self.hotsync
    }

    pub fn hit_miss(&self) -> (u32, u32) {
        use std::sync::atomic::Ordering;
        (
            self.hit.load(Ordering::Relaxed),
            self.miss.load(Ordering::Relaxed),
        )
    }

    /// Starts background maintenance and the HTTP surfaces.
    pub async fn run(&self) -> Result<()> {
        self.service.run();
        self.hotsync.run();

        // everything already stored wants to converge again after a restart
        let ids = self.storage.all_space_ids()?;
        if !ids.is_empty() {
            info!(spaces = ids.len(), "queueing stored spaces for hot sync");
            self.hotsync.update_queue(&ids);
        }

        let state = Arc::new(DebugState {
            service: self.service.clone(),
            storage: self.storage.clone(),
            hotsync: self.hotsync.clone(),
            registry: self.registry.clone(),
        });

        let addr = self.config.api.listen_addr.clone();
        let api_state = state.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            if let Err(err) = rpc::serve(&addr, api_state).await {
                warn!(%err, "debug api server stopped");
            }
        }));

        if let Ok(addr) = std::env::var("ANYPROF") {
            if !addr.is_empty() {
                info!(%addr, "profiling endpoint enabled");
                self.tasks.lock().push(tokio::spawn(async move {
                    if let Err(err) = rpc::serve(&addr, state).await {
                        warn!(%err, "profiling endpoint stopped");
                    }
                }));
            }
        }
        Ok(())
    }

    /// Stops background work and closes the caches, newest owners first.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.hotsync.close();
        self.service.close();
        info!("node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_runs_and_shuts_down() {
        let config = Config {
            api: crate::config::ApiConfig {
                listen_addr: "127.0.0.1:0".to_string(),
            },
            ..Config::default()
        };
        let node = Node::build(config).unwrap();
        node.run().await.unwrap();
        let (hit, miss) = node.hit_miss();
        assert_eq!((hit, miss), (0, 0));
        node.shutdown().await;
    }
}
