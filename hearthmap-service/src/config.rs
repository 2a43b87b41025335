use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: SocketAddr,
    /// Root of all generated output and cached inputs.
    pub grid_storage: PathBuf,
    pub catalog_path: PathBuf,
    pub orchestrator_tick: Duration,
    pub pregen_tick: Duration,
    pub large_memory_entries: usize,
    pub negative_entries: usize,
    pub negative_ttl: Duration,
    pub catalog_permits: usize,
    pub batch_parallelism: usize,
    pub webp_quality: f32,
    pub texture_base_url: String,
    /// Viewer front-end base URL for the post-run cache invalidation POST.
    pub viewer_internal_url: Option<String>,
    pub hmap_max_bytes: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let host = env::var("HEARTHMAP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env_parse("HEARTHMAP_PORT").unwrap_or(8080);
        let addr: SocketAddr = format!("{}:{}", host, port).parse().expect("invalid host/port");
        let grid_storage = PathBuf::from(env::var("GRID_STORAGE").unwrap_or_else(|_| "map".to_string()));
        let catalog_path = env::var("HEARTHMAP_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| grid_storage.join("catalog.db"));
        Self {
            addr,
            catalog_path,
            orchestrator_tick: Duration::from_secs(env_parse("ORCHESTRATOR_TICK_SECS").unwrap_or(30)),
            pregen_tick: Duration::from_secs(env_parse("PREGEN_TICK_SECS").unwrap_or(30)),
            large_memory_entries: env_parse("LARGE_MEMORY_ENTRIES").unwrap_or(500),
            negative_entries: env_parse("NEGATIVE_ENTRIES").unwrap_or(10_000),
            negative_ttl: Duration::from_secs(env_parse("NEGATIVE_TTL_SECS").unwrap_or(300)),
            catalog_permits: env_parse("CATALOG_PERMITS").unwrap_or(8),
            batch_parallelism: env_parse("BATCH_PARALLELISM").unwrap_or(4),
            webp_quality: env_parse("WEBP_QUALITY").unwrap_or(85.0),
            texture_base_url: env::var("TEXTURE_BASE_URL")
                .unwrap_or_else(|_| "https://www.havenandhearth.com/res".to_string()),
            viewer_internal_url: env::var("VIEWER_INTERNAL_URL").ok(),
            hmap_max_bytes: env_parse("HMAP_MAX_BYTES").unwrap_or(500 * 1024 * 1024),
            grid_storage,
        }
    }

    /// Scratch configuration rooted at `root`, used by tests.
    pub fn for_root(root: &Path) -> Self {
        Self {
            addr: "127.0.0.1:0".parse().expect("loopback addr"),
            grid_storage: root.to_path_buf(),
            catalog_path: root.join("catalog.db"),
            orchestrator_tick: Duration::from_secs(30),
            pregen_tick: Duration::from_secs(30),
            large_memory_entries: 500,
            negative_entries: 10_000,
            negative_ttl: Duration::from_secs(300),
            catalog_permits: 8,
            batch_parallelism: 4,
            webp_quality: 85.0,
            texture_base_url: "http://127.0.0.1:1/res".to_string(),
            viewer_internal_url: None,
            hmap_max_bytes: 500 * 1024 * 1024,
        }
    }

    // ---- storage layout --------------------------------------------------

    pub fn public_dir(&self, slug: &str) -> PathBuf {
        self.grid_storage.join("public").join(slug)
    }

    pub fn public_tile(&self, slug: &str, zoom: u8, x: i32, y: i32) -> PathBuf {
        self.public_dir(slug).join(zoom.to_string()).join(format!("{x}_{y}.webp"))
    }

    pub fn markers_path(&self, slug: &str) -> PathBuf {
        self.public_dir(slug).join("markers.json")
    }

    pub fn large_tile(&self, tenant_id: &str, map_id: i64, zoom: u8, x: i32, y: i32) -> PathBuf {
        self.grid_storage
            .join("tenants")
            .join(tenant_id)
            .join("large")
            .join(map_id.to_string())
            .join(zoom.to_string())
            .join(format!("{x}_{y}.webp"))
    }

    pub fn hmap_sources_dir(&self) -> PathBuf {
        self.grid_storage.join("hmap-sources")
    }

    pub fn texture_cache_dir(&self) -> PathBuf {
        self.grid_storage.join("hmap-tile-cache")
    }

    /// Tenant base tiles are stored by catalog-relative path.
    pub fn grid_file(&self, relative: &str) -> PathBuf {
        self.grid_storage.join(relative)
    }
}
