//! Responsible-peer management and message routing for one space.
//!
//! The responsible set is derived from the node table and refreshed at most
//! once per minute; peers that fail to connect sit out a cooldown before the
//! next attempt. Messages go to responsible peers over pooled connections,
//! broadcasts additionally reach every peer subscribed to the space.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use arbor_sync::change::{ChangeId, RawChange};

use crate::nodeconf::NodeConf;

/// How long the responsible-peer list stays fresh.
const RESPONSIBLE_REFRESH: Duration = Duration::from_secs(60);
/// Cooldown after a failed connection attempt.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(60);

/// Network-level errors of the peer manager.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("unable to connect to any responsible peer")]
    UnableToConnect,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A connected peer handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    id: String,
}

impl Peer {
    pub fn new(id: impl Into<String>) -> Self {
        Peer { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Heads of one tree, for eager head comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeHeads {
    pub id: ChangeId,
    pub heads: Vec<ChangeId>,
}

/// Messages exchanged between peers for one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpaceMessage {
    /// Request the peer's view of the listed trees.
    HeadSyncRequest {
        space_id: String,
        space_hash: String,
        ranges: Vec<TreeHeads>,
    },
    /// The responding half of a head sync.
    HeadSyncResponse {
        space_id: String,
        space_hash: String,
        ranges: Vec<TreeHeads>,
    },
    /// A change batch for one object.
    ObjectSync {
        space_id: String,
        tree_id: ChangeId,
        heads: Vec<ChangeId>,
        changes: Vec<RawChange>,
        snapshot_path: Vec<ChangeId>,
    },
    /// Settings-tree equivalent of an object sync.
    SpaceSettingsSync {
        space_id: String,
        heads: Vec<ChangeId>,
        changes: Vec<RawChange>,
    },
}

impl SpaceMessage {
    pub fn space_id(&self) -> &str {
        match self {
            SpaceMessage::HeadSyncRequest { space_id, .. }
            | SpaceMessage::HeadSyncResponse { space_id, .. }
            | SpaceMessage::ObjectSync { space_id, .. }
            | SpaceMessage::SpaceSettingsSync { space_id, .. } => space_id,
        }
    }
}

/// Pooled connections to peers.
#[async_trait]
pub trait PeerPool: Send + Sync + 'static {
    async fn get(&self, peer_id: &str) -> anyhow::Result<Peer>;
}

/// Multiplexed per-space streams.
#[async_trait]
pub trait StreamPool: Send + Sync + 'static {
    /// Sends over the stream of a connected peer.
    async fn send(&self, peer: &Peer, msg: &SpaceMessage) -> anyhow::Result<()>;

    /// Routes to any existing stream of the peer.
    async fn send_by_id(&self, peer_id: &str, msg: &SpaceMessage) -> anyhow::Result<()>;

    /// Delivers to every peer subscribed to the space.
    async fn broadcast(&self, space_id: &str, msg: &SpaceMessage) -> anyhow::Result<()>;
}

/// The pool a node runs with until a transport is plugged in: every
/// connection attempt fails, so the peer manager reports `UnableToConnect`
/// and retries after the cooldown.
#[derive(Debug, Default)]
pub struct DisconnectedPool;

#[async_trait]
impl PeerPool for DisconnectedPool {
    async fn get(&self, peer_id: &str) -> anyhow::Result<Peer> {
        anyhow::bail!("no transport configured for peer {peer_id}")
    }
}

/// Stream pool that drops outbound messages; stands in for the transport's
/// stream multiplexer.
#[derive(Debug, Default)]
pub struct DiscardStreams;

#[async_trait]
impl StreamPool for DiscardStreams {
    async fn send(&self, peer: &Peer, msg: &SpaceMessage) -> anyhow::Result<()> {
        debug!(peer_id = %peer.id(), space_id = %msg.space_id(), "discarding outbound message");
        Ok(())
    }

    async fn send_by_id(&self, peer_id: &str, msg: &SpaceMessage) -> anyhow::Result<()> {
        debug!(%peer_id, space_id = %msg.space_id(), "discarding outbound message");
        Ok(())
    }

    async fn broadcast(&self, space_id: &str, _msg: &SpaceMessage) -> anyhow::Result<()> {
        debug!(%space_id, "discarding broadcast");
        Ok(())
    }
}

struct ResponsiblePeer {
    peer_id: String,
    last_fail: Option<Instant>,
}

#[derive(Default)]
struct ResponsibleState {
    peers: Vec<ResponsiblePeer>,
    refreshed_at: Option<Instant>,
}

/// Maintains the responsible-peer set for one space and routes messages.
pub struct PeerManager {
    space_id: String,
    node_conf: Arc<NodeConf>,
    pool: Arc<dyn PeerPool>,
    streams: Arc<dyn StreamPool>,
    state: Mutex<ResponsibleState>,
}

impl PeerManager {
    pub fn new(
        space_id: impl Into<String>,
        node_conf: Arc<NodeConf>,
        pool: Arc<dyn PeerPool>,
        streams: Arc<dyn StreamPool>,
    ) -> Self {
        PeerManager {
            space_id: space_id.into(),
            node_conf,
            pool,
            streams,
            state: Mutex::new(ResponsibleState::default()),
        }
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    /// The connected subset of responsible peers. Peers inside their failure
    /// cooldown are skipped; a failed attempt stamps the cooldown.
    pub async fn get_responsible_peers(&self) -> Result<Vec<Peer>, NetError> {
        let now = Instant::now();
        let candidates: Vec<String> = {
            let mut state = self.state.lock();
            self.refresh_locked(&mut state, now);
            state
                .peers
                .iter()
                .filter(|p| {
                    p.last_fail
                        .map_or(true, |t| now.duration_since(t) >= RECONNECT_COOLDOWN)
                })
                .map(|p| p.peer_id.clone())
                .collect()
        };

        let mut peers = Vec::with_capacity(candidates.len());
        for peer_id in candidates {
            match self.pool.get(&peer_id).await {
                Ok(peer) => peers.push(peer),
                Err(err) => {
                    info!(%peer_id, %err, "can't connect to responsible peer");
                    let mut state = self.state.lock();
                    if let Some(p) = state.peers.iter_mut().find(|p| p.peer_id == peer_id) {
                        p.last_fail = Some(Instant::now());
                    }
                }
            }
        }
        if peers.is_empty() {
            return Err(NetError::UnableToConnect);
        }
        Ok(peers)
    }

    /// Sends to all currently responsible peers.
    pub async fn send_responsible(&self, msg: &SpaceMessage) -> Result<(), NetError> {
        let peers = self.get_responsible_peers().await?;
        for peer in &peers {
            if let Err(err) = self.streams.send(peer, msg).await {
                debug!(peer_id = %peer.id(), %err, "send to responsible peer failed");
            }
        }
        Ok(())
    }

    /// Sends to one peer: over a pooled connection when it is responsible,
    /// otherwise via any existing stream.
    pub async fn send_message(&self, peer_id: &str, msg: &SpaceMessage) -> Result<(), NetError> {
        if self.is_responsible(peer_id) {
            debug!(%peer_id, "send over pooled connection");
            let peer = self.pool.get(peer_id).await?;
            self.streams.send(&peer, msg).await?;
            return Ok(());
        }
        debug!(%peer_id, "send by id");
        self.streams.send_by_id(peer_id, msg).await?;
        Ok(())
    }

    /// Sends to responsible peers and additionally to every subscriber of
    /// the space.
    pub async fn broadcast_message(&self, msg: &SpaceMessage) -> Result<(), NetError> {
        if let Err(err) = self.send_responsible(msg).await {
            info!(%err, "broadcast: sending to responsible peers failed");
        }
        debug!(space_id = %self.space_id, "broadcast");
        self.streams.broadcast(&self.space_id, msg).await?;
        Ok(())
    }

    pub fn is_responsible(&self, peer_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refresh_locked(&mut state, now);
        state.peers.iter().any(|p| p.peer_id == peer_id)
    }

    fn refresh_locked(&self, state: &mut ResponsibleState, now: Instant) {
        let fresh = state
            .refreshed_at
            .is_some_and(|t| now.duration_since(t) < RESPONSIBLE_REFRESH);
        if fresh && !state.peers.is_empty() {
            return;
        }
        let node_ids = self.node_conf.node_ids(&self.space_id);
        let mut peers = Vec::with_capacity(node_ids.len());
        for peer_id in node_ids {
            let last_fail = state
                .peers
                .iter()
                .find(|p| p.peer_id == peer_id)
                .and_then(|p| p.last_fail);
            peers.push(ResponsiblePeer { peer_id, last_fail });
        }
        state.peers = peers;
        state.refreshed_at = Some(now);
    }
}
