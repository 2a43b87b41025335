//! Tile texture resolution for snapshot rendering.
//!
//! Resource names resolve to PNG textures fetched from the game's resource
//! server, cached on disk under `hmap-tile-cache/`, decoded once per process
//! and memoised. Concurrent lookups of the same name coalesce into a single
//! fetch; misses are remembered as absent until the next generation run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use image::RgbaImage;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{debug, warn};

const PREFETCH_CONCURRENCY: usize = 8;

pub struct TextureStore {
    client: reqwest::Client,
    base_url: String,
    cache_dir: PathBuf,
    decoded: Mutex<HashMap<String, Option<RgbaImage>>>,
    inflight: Mutex<HashMap<String, Vec<oneshot::Sender<Option<RgbaImage>>>>>,
}

impl TextureStore {
    pub fn new(base_url: String, cache_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            cache_dir,
            decoded: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Forget memoised misses. Called at the start of each generation run so
    /// a texture that has appeared upstream is retried.
    pub async fn reset_misses(&self) {
        self.decoded.lock().await.retain(|_, v| v.is_some());
    }

    /// Resolve one resource name to a decoded texture, or `None` when the
    /// resource cannot be fetched or decoded.
    pub async fn get(&self, name: &str) -> Option<RgbaImage> {
        if let Some(cached) = self.decoded.lock().await.get(name) {
            return cached.clone();
        }

        // coalesce with an in-flight fetch for the same name
        let rx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(waiters) = inflight.get_mut(name) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                inflight.insert(name.to_string(), Vec::new());
                None
            }
        };
        if let Some(rx) = rx {
            return rx.await.unwrap_or(None);
        }

        let resolved = self.fetch(name).await;
        self.decoded.lock().await.insert(name.to_string(), resolved.clone());
        let waiters = self.inflight.lock().await.remove(name).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(resolved.clone());
        }
        resolved
    }

    /// Bulk-resolve ahead of rendering with bounded concurrency.
    pub async fn prefetch(self: Arc<Self>, names: &[String]) {
        let semaphore = Arc::new(Semaphore::new(PREFETCH_CONCURRENCY));
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            let store = Arc::clone(&self);
            let name = name.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                store.get(&name).await.is_some()
            }));
        }
        let mut resolved = 0usize;
        for h in handles {
            if matches!(h.await, Ok(true)) {
                resolved += 1;
            }
        }
        debug!(requested = names.len(), resolved, "texture prefetch finished");
    }

    /// Resolve every name into an owned lookup table for the renderer.
    pub async fn resolve_table(self: Arc<Self>, names: &[String]) -> HashMap<String, RgbaImage> {
        Arc::clone(&self).prefetch(names).await;
        let mut table = HashMap::new();
        for name in names {
            if let Some(img) = self.get(name).await {
                table.insert(name.clone(), img);
            }
        }
        table
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        // content-addressed by resource name; path separators flattened
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.cache_dir.join(format!("{safe}.png"))
    }

    async fn fetch(&self, name: &str) -> Option<RgbaImage> {
        let disk = self.disk_path(name);
        if let Ok(bytes) = tokio::fs::read(&disk).await {
            match image::load_from_memory(&bytes) {
                Ok(img) => return Some(img.to_rgba8()),
                Err(e) => warn!(name, error = %e, "cached texture undecodable; refetching"),
            }
        }

        let url = format!("{}/{}.png", self.base_url.trim_end_matches('/'), name);
        let bytes = match self.client.get(&url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(name, error = %e, "texture body read failed");
                        return None;
                    }
                },
                Err(e) => {
                    warn!(name, error = %e, "texture fetch rejected");
                    return None;
                }
            },
            Err(e) => {
                warn!(name, error = %e, "texture fetch failed");
                return None;
            }
        };

        let img = match image::load_from_memory(&bytes) {
            Ok(img) => img.to_rgba8(),
            Err(e) => {
                warn!(name, error = %e, "fetched texture undecodable");
                return None;
            }
        };
        if let Err(e) = self.store_to_disk(&disk, &bytes).await {
            warn!(name, error = %e, "texture disk cache write failed");
        }
        Some(img)
    }

    async fn store_to_disk(&self, path: &PathBuf, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn png_bytes(side: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(side, side, Rgba([1, 2, 3, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn disk_cached_texture_resolves_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TextureStore::new(
            "http://127.0.0.1:1/res".to_string(),
            dir.path().to_path_buf(),
        ));
        let disk = store.disk_path("gfx/tiles/grass");
        std::fs::create_dir_all(disk.parent().unwrap()).unwrap();
        std::fs::write(&disk, png_bytes(16)).unwrap();

        let img = store.get("gfx/tiles/grass").await.expect("resolve from disk");
        assert_eq!((img.width(), img.height()), (16, 16));
    }

    #[tokio::test]
    async fn unreachable_resource_is_memoised_absent_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TextureStore::new(
            // nothing listens here; the fetch fails fast
            "http://127.0.0.1:1/res".to_string(),
            dir.path().to_path_buf(),
        ));
        assert!(store.get("gfx/tiles/void").await.is_none());
        assert!(store.decoded.lock().await.contains_key("gfx/tiles/void"));

        store.reset_misses().await;
        assert!(!store.decoded.lock().await.contains_key("gfx/tiles/void"));
    }
}
