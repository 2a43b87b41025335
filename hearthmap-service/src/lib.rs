use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    routing::{get, post},
    Router,
};

pub mod align;
pub mod codec;
pub mod compose;
pub mod config;
pub mod errors;
pub mod large_tiles;
pub mod markers;
pub mod orchestrator;
pub mod public_maps;
pub mod pyramid;
pub mod routes;
pub mod sources;
pub mod textures;

pub use config::Config;
pub use errors::ApiError;
pub use large_tiles::{LargeTileCache, TileKey};
pub use orchestrator::Orchestrator;
pub use public_maps::PublicMapService;
pub use textures::TextureStore;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub orchestrator: Arc<Orchestrator>,
    pub large_tiles: Arc<LargeTileCache>,
    pub maps: Arc<PublicMapService>,
}

impl AppState {
    pub fn new(cfg: Config) -> Self {
        let textures = Arc::new(TextureStore::new(
            cfg.texture_base_url.clone(),
            cfg.texture_cache_dir(),
        ));
        Self {
            orchestrator: Arc::new(Orchestrator::new(cfg.clone(), textures)),
            large_tiles: Arc::new(LargeTileCache::new(cfg.clone())),
            maps: Arc::new(PublicMapService::new(cfg.clone())),
            cfg,
        }
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(routes::health))
        .route("/maps/:id/status", get(routes::map_status))
        .route("/maps/:id/generate", post(routes::generate))
        .route("/tenants/:tenant_id/large/:map_id/:zoom/:tile", get(routes::large_tile))
        .with_state(state)
}
