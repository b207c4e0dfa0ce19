//! Debug HTTP API: space and tree introspection, forced sync, metrics.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use arbor_sync::change::ChangeId;

use crate::hotsync::HotSync;
use crate::space::{NodeSpaceService, SpaceStats};
use crate::storage::NodeStorage;

/// How long a forced sync waits before handing control back.
const FORCE_SYNC_DEADLINE: Duration = Duration::from_millis(100);

/// Shared state of the debug API.
pub struct DebugState {
    pub service: Arc<NodeSpaceService>,
    pub storage: Arc<dyn NodeStorage>,
    pub hotsync: Arc<HotSync>,
    pub registry: Arc<Mutex<Registry>>,
}

#[derive(Debug, Serialize)]
pub struct AllSpacesResponse {
    pub space_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TreeInfo {
    pub id: String,
    pub heads: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AllTreesResponse {
    pub trees: Vec<TreeInfo>,
}

#[derive(Debug, Serialize)]
pub struct TreeParamsResponse {
    pub root_id: String,
    pub head_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ForceSyncResponse {
    pub queued: usize,
}

impl DebugState {
    pub async fn all_spaces(&self) -> anyhow::Result<AllSpacesResponse> {
        Ok(AllSpacesResponse {
            space_ids: self.storage.all_space_ids()?,
        })
    }

    pub async fn all_trees(&self, space_id: &str) -> anyhow::Result<AllTreesResponse> {
        let space = self.service.get_space(space_id).await?;
        let trees = space
            .all_heads()?
            .into_iter()
            .map(|t| TreeInfo {
                id: t.id.to_string(),
                heads: t.heads.iter().map(|h| h.to_string()).collect(),
            })
            .collect();
        Ok(AllTreesResponse { trees })
    }

    pub async fn tree_params(
        &self,
        space_id: &str,
        tree_id: &ChangeId,
    ) -> anyhow::Result<TreeParamsResponse> {
        let space = self.service.get_space(space_id).await?;
        let tree = space.get_tree(tree_id).await?;
        let root_id = tree
            .tree()
            .root_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        Ok(TreeParamsResponse {
            root_id,
            head_ids: tree.tree().heads().iter().map(|h| h.to_string()).collect(),
        })
    }

    pub async fn dump_tree(&self, space_id: &str, tree_id: &ChangeId) -> anyhow::Result<String> {
        let space = self.service.get_space(space_id).await?;
        let tree = space.get_tree(tree_id).await?;
        Ok(tree.tree().debug_dump())
    }

    pub async fn stats(&self, space_id: &str) -> anyhow::Result<SpaceStats> {
        Ok(self.service.get_stats(space_id).await?)
    }

    /// Queues every stored space for hot sync and returns after a fixed
    /// deadline; warming continues in the background.
    pub async fn force_sync(&self) -> anyhow::Result<ForceSyncResponse> {
        let ids = self.storage.all_space_ids()?;
        let queued = ids.len();
        self.hotsync.update_queue(&ids);

        let hotsync = self.hotsync.clone();
        let round = tokio::spawn(async move { hotsync.tick().await });
        tokio::select! {
            _ = round => {}
            _ = tokio::time::sleep(FORCE_SYNC_DEADLINE) => {}
        }
        Ok(ForceSyncResponse { queued })
    }

    pub fn encode_metrics(&self) -> anyhow::Result<String> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry.lock())?;
        Ok(out)
    }
}

struct AppError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", self.0)).into_response()
    }
}

type AppResult<T> = Result<T, AppError>;

async fn all_spaces(State(state): State<Arc<DebugState>>) -> AppResult<Json<AllSpacesResponse>> {
    Ok(Json(state.all_spaces().await?))
}

async fn all_trees(
    State(state): State<Arc<DebugState>>,
    Path(space_id): Path<String>,
) -> AppResult<Json<AllTreesResponse>> {
    Ok(Json(state.all_trees(&space_id).await?))
}

async fn tree_params(
    State(state): State<Arc<DebugState>>,
    Path((space_id, tree_id)): Path<(String, String)>,
) -> AppResult<Json<TreeParamsResponse>> {
    let tree_id: ChangeId = tree_id.parse().map_err(anyhow::Error::from)?;
    Ok(Json(state.tree_params(&space_id, &tree_id).await?))
}

async fn dump_tree(
    State(state): State<Arc<DebugState>>,
    Path((space_id, tree_id)): Path<(String, String)>,
) -> AppResult<String> {
    let tree_id: ChangeId = tree_id.parse().map_err(anyhow::Error::from)?;
    Ok(state.dump_tree(&space_id, &tree_id).await?)
}

async fn space_stats(
    State(state): State<Arc<DebugState>>,
    Path(space_id): Path<String>,
) -> AppResult<Json<SpaceStats>> {
    Ok(Json(state.stats(&space_id).await?))
}

async fn force_sync(State(state): State<Arc<DebugState>>) -> AppResult<Json<ForceSyncResponse>> {
    Ok(Json(state.force_sync().await?))
}

async fn metrics(State(state): State<Arc<DebugState>>) -> AppResult<String> {
    Ok(state.encode_metrics()?)
}

/// The debug router.
pub fn router(state: Arc<DebugState>) -> Router {
    Router::new()
        .route("/debug/spaces", get(all_spaces))
        .route("/debug/spaces/:space_id/trees", get(all_trees))
        .route("/debug/spaces/:space_id/trees/:tree_id", get(tree_params))
        .route(
            "/debug/spaces/:space_id/trees/:tree_id/dump",
            get(dump_tree),
        )
        .route("/debug/spaces/:space_id/stats", get(space_stats))
        .route("/debug/sync", post(force_sync))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Binds and serves the debug API until the task is aborted.
pub async fn serve(addr: &str, state: Arc<DebugState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "debug api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::space::testutil::harness;
    use crate::storage::testutil::space_payload;

    fn debug_state() -> (Arc<DebugState>, crate::space::testutil::Harness) {
        let h = harness();
        for (i, id) in ["alpha", "beta"].iter().enumerate() {
            let (payload, _) = space_payload(id, 200 + i as u64);
            h.storage.create_space_storage(payload).unwrap();
        }
        let hotsync = HotSync::new(
            h.service.clone(),
            2,
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        );
        let state = Arc::new(DebugState {
            service: h.service.clone(),
            storage: h.storage.clone(),
            hotsync,
            registry: Arc::new(Mutex::new(Registry::default())),
        });
        (state, h)
    }

    #[tokio::test]
    async fn all_spaces_lists_storage() {
        let (state, _h) = debug_state();
        let resp = state.all_spaces().await.unwrap();
        assert_eq!(resp.space_ids, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn tree_endpoints_reflect_the_live_tree() {
        let (state, h) = debug_state();
        let settings_id = {
            let space = h.service.get_space("alpha").await.unwrap();
            space.storage().stored_ids().unwrap()[0]
        };

        let trees = state.all_trees("alpha").await.unwrap();
        assert_eq!(trees.trees.len(), 1);
        assert_eq!(trees.trees[0].id, settings_id.to_string());

        let params = state.tree_params("alpha", &settings_id).await.unwrap();
        assert_eq!(params.root_id, settings_id.to_string());
        assert_eq!(params.head_ids, vec![settings_id.to_string()]);

        let dump = state.dump_tree("alpha", &settings_id).await.unwrap();
        assert!(dump.contains("snapshot"));
    }

    #[tokio::test]
    async fn force_sync_returns_within_the_deadline() {
        let (state, _h) = debug_state();
        let started = std::time::Instant::now();
        let resp = state.force_sync().await.unwrap();
        assert_eq!(resp.queued, 2);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stats_endpoint_uses_the_capability() {
        let (state, _h) = debug_state();
        let stats = state.stats("alpha").await.unwrap();
        assert!(stats.change_size.max_len > 0);
    }

    #[tokio::test]
    async fn serves_over_http() {
        let (state, _h) = debug_state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /debug/spaces HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.contains("alpha"));
        server.abort();
    }
}
