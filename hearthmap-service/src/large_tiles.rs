//! Per-tenant 400x400 tile cache with on-demand generation.
//!
//! Lookup walks memory, the negative cache, then disk; misses generate
//! behind a per-key single-flight gate. Zoom 0 composes from the source-tile
//! catalog under a process-wide semaphore; higher zooms recurse over their
//! four children and never touch the catalog (a semaphore there would
//! deadlock the recursion).

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use hearthmap_core::db::SourceTileRow;
use hearthmap_core::{block_parent, parent, Catalog};
use image::imageops::FilterType;
use rand::Rng;
use tokio::sync::{oneshot, Semaphore};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::codec::{encode_webp, write_tile};
use crate::compose::compose_tile;
use crate::config::Config;
use crate::pyramid::{compose_parent, MAX_ZOOM};
use crate::sources::{CellMap, SourceCell};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub tenant_id: String,
    pub map_id: i64,
    pub zoom: u8,
    pub x: i32,
    pub y: i32,
}

impl TileKey {
    pub fn new(tenant_id: &str, map_id: i64, zoom: u8, x: i32, y: i32) -> Self {
        Self { tenant_id: tenant_id.to_string(), map_id, zoom, x, y }
    }

    fn child(&self, dx: i32, dy: i32) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            map_id: self.map_id,
            zoom: self.zoom - 1,
            x: 2 * self.x + dx,
            y: 2 * self.y + dy,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct TenantStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub negative_hits: u64,
    pub coalesced: u64,
    pub generated: u64,
    pub failed: u64,
    pub dirty_invalidated: u64,
    pub generation_ms: u64,
}

struct MemEntry {
    bytes: Bytes,
    last_access: u64,
}

struct MemoryCache {
    entries: HashMap<TileKey, MemEntry>,
    counter: u64,
    capacity: usize,
}

impl MemoryCache {
    fn get(&mut self, key: &TileKey) -> Option<Bytes> {
        self.counter += 1;
        let counter = self.counter;
        self.entries.get_mut(key).map(|e| {
            e.last_access = counter;
            e.bytes.clone()
        })
    }

    fn insert(&mut self, key: TileKey, bytes: Bytes) {
        self.counter += 1;
        self.entries.insert(key, MemEntry { bytes, last_access: self.counter });
        if self.entries.len() > self.capacity {
            // evict the coldest tenth in one sweep
            let mut by_age: Vec<(TileKey, u64)> =
                self.entries.iter().map(|(k, e)| (k.clone(), e.last_access)).collect();
            by_age.sort_by_key(|(_, age)| *age);
            let evict = (self.capacity / 10).max(1);
            for (key, _) in by_age.into_iter().take(evict) {
                self.entries.remove(&key);
            }
        }
    }
}

pub struct LargeTileCache {
    cfg: Config,
    memory: Mutex<MemoryCache>,
    negative: Mutex<HashMap<TileKey, Instant>>,
    inflight: AsyncMutex<HashMap<TileKey, Vec<oneshot::Sender<Option<Bytes>>>>>,
    catalog_permits: Semaphore,
    stats: Mutex<HashMap<String, TenantStats>>,
}

impl LargeTileCache {
    pub fn new(cfg: Config) -> Self {
        let capacity = cfg.large_memory_entries;
        let permits = cfg.catalog_permits;
        Self {
            cfg,
            memory: Mutex::new(MemoryCache { entries: HashMap::new(), counter: 0, capacity }),
            negative: Mutex::new(HashMap::new()),
            inflight: AsyncMutex::new(HashMap::new()),
            catalog_permits: Semaphore::new(permits),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats_snapshot(&self) -> HashMap<String, TenantStats> {
        self.stats.lock().expect("stats lock").clone()
    }

    fn bump<F: FnOnce(&mut TenantStats)>(&self, tenant_id: &str, f: F) {
        let mut stats = self.stats.lock().expect("stats lock");
        f(stats.entry(tenant_id.to_string()).or_default())
    }

    // ---- lookup ----------------------------------------------------------

    /// Serve one large tile, generating it when needed. `None` means the
    /// tile has no source data (recorded in the negative cache).
    pub fn get_or_generate(
        self: Arc<Self>,
        key: TileKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>>> + Send>> {
        let cache = self;
        Box::pin(async move {
            if let Some(bytes) = cache.memory.lock().expect("memory lock").get(&key) {
                cache.bump(&key.tenant_id, |s| s.memory_hits += 1);
                return Ok(Some(bytes));
            }

            {
                let mut negative = cache.negative.lock().expect("negative lock");
                if let Some(recorded) = negative.get(&key) {
                    if recorded.elapsed() < cache.cfg.negative_ttl {
                        cache.bump(&key.tenant_id, |s| s.negative_hits += 1);
                        return Ok(None);
                    }
                    negative.remove(&key);
                }
            }

            let path = cache.cfg.large_tile(&key.tenant_id, key.map_id, key.zoom, key.x, key.y);
            if let Ok(bytes) = tokio::fs::read(&path).await {
                let bytes = Bytes::from(bytes);
                cache.memory.lock().expect("memory lock").insert(key.clone(), bytes.clone());
                cache.bump(&key.tenant_id, |s| s.disk_hits += 1);
                return Ok(Some(bytes));
            }

            // single flight per key
            let rx = {
                let mut inflight = cache.inflight.lock().await;
                if let Some(waiters) = inflight.get_mut(&key) {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                } else {
                    inflight.insert(key.clone(), Vec::new());
                    None
                }
            };
            if let Some(rx) = rx {
                cache.bump(&key.tenant_id, |s| s.coalesced += 1);
                return Ok(rx.await.unwrap_or(None));
            }

            let started = Instant::now();
            let result = Arc::clone(&cache).generate(&key).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let broadcast = match &result {
                Ok(option) => option.clone(),
                Err(_) => None,
            };
            match &result {
                Ok(Some(bytes)) => {
                    cache.memory.lock().expect("memory lock").insert(key.clone(), bytes.clone());
                    cache.bump(&key.tenant_id, |s| {
                        s.generated += 1;
                        s.generation_ms += elapsed_ms;
                    });
                }
                Ok(None) => {
                    cache.record_negative(key.clone());
                    cache.bump(&key.tenant_id, |s| s.generation_ms += elapsed_ms);
                }
                Err(_) => cache.bump(&key.tenant_id, |s| s.failed += 1),
            }

            let waiters = cache.inflight.lock().await.remove(&key).unwrap_or_default();
            for tx in waiters {
                let _ = tx.send(broadcast.clone());
            }
            result
        })
    }

    fn record_negative(&self, key: TileKey) {
        let mut negative = self.negative.lock().expect("negative lock");
        if negative.len() >= self.cfg.negative_entries {
            let mut by_age: Vec<(TileKey, Instant)> =
                negative.iter().map(|(k, t)| (k.clone(), *t)).collect();
            by_age.sort_by_key(|(_, t)| *t);
            let evict = (self.cfg.negative_entries / 10).max(1);
            for (key, _) in by_age.into_iter().take(evict) {
                negative.remove(&key);
            }
        }
        negative.insert(key, Instant::now());
    }

    // ---- generation ------------------------------------------------------

    async fn generate(self: Arc<Self>, key: &TileKey) -> Result<Option<Bytes>> {
        if key.zoom == 0 {
            let _permit = self.catalog_permits.acquire().await.expect("semaphore closed");
            let cfg = self.cfg.clone();
            let key = key.clone();
            return tokio::task::spawn_blocking(move || -> Result<Option<Bytes>> {
                let catalog = Catalog::open(&cfg.catalog_path)?;
                let rows = catalog.tiles_in_block(&key.tenant_id, key.map_id, key.x, key.y)?;
                compose_base_block(&cfg, &key, rows.into_iter().map(|r| ((r.coord_x, r.coord_y), r)).collect())
            })
            .await
            .context("zoom-0 generation task panicked")?;
        }

        // zoom > 0: recurse into the four children, filesystem and cache only
        let mut children: [Option<Bytes>; 4] = [None, None, None, None];
        for dy in 0..2i32 {
            for dx in 0..2i32 {
                children[(dy * 2 + dx) as usize] =
                    Arc::clone(&self).get_or_generate(key.child(dx, dy)).await?;
            }
        }
        if children.iter().all(Option::is_none) {
            return Ok(None);
        }

        let cfg = self.cfg.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Bytes>> {
            let quads = children.map(|c| c.and_then(|b| crate::codec::decode_webp(&b)));
            let Some(img) = compose_parent(quads, FilterType::Nearest) else {
                return Ok(None);
            };
            let bytes = encode_webp(&img, cfg.webp_quality)?;
            let path = cfg.large_tile(&key.tenant_id, key.map_id, key.zoom, key.x, key.y);
            write_tile(&path, &bytes)?;
            Ok(Some(Bytes::from(bytes)))
        })
        .await
        .context("parent generation task panicked")?
    }

    // ---- invalidation ----------------------------------------------------

    /// Invalidate the large-tile stack covering one base tile: the zoom-0
    /// tile plus its six ancestors. Memory, negative and disk entries are
    /// gone before this returns; the call is idempotent.
    pub async fn mark_dirty(&self, tenant_id: &str, map_id: i64, base_x: i32, base_y: i32) {
        let (mut x, mut y) = block_parent(base_x, base_y);
        let mut invalidated = 0u64;
        for zoom in 0..=MAX_ZOOM {
            let key = TileKey::new(tenant_id, map_id, zoom, x, y);
            self.memory.lock().expect("memory lock").entries.remove(&key);
            self.negative.lock().expect("negative lock").remove(&key);
            let path = self.cfg.large_tile(tenant_id, map_id, zoom, x, y);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => invalidated += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "dirty delete failed"),
            }
            (x, y) = parent(x, y);
        }
        self.bump(tenant_id, |s| s.dirty_invalidated += invalidated);
        debug!(tenant = tenant_id, map_id, base_x, base_y, "large-tile stack invalidated");
    }

    // ---- batch pre-generation --------------------------------------------

    /// Fill in missing large tiles for every map of one tenant. Zoom 0 works
    /// from a single bulk catalog query; zooms 1..6 derive from the
    /// filesystem alone. Returns `(zoom, generated)` counts.
    pub async fn generate_missing_tiles(self: Arc<Self>, tenant_id: &str) -> Result<Vec<(u8, usize)>> {
        let maps = {
            let cfg = self.cfg.clone();
            let tenant = tenant_id.to_string();
            tokio::task::spawn_blocking(move || -> Result<Vec<i64>> {
                Catalog::open(&cfg.catalog_path)?.list_tenant_maps(&tenant)
            })
            .await
            .context("map listing task panicked")??
        };

        let mut per_zoom = vec![0usize; MAX_ZOOM as usize + 1];
        for map_id in maps {
            let rows = {
                let cfg = self.cfg.clone();
                let tenant = tenant_id.to_string();
                tokio::task::spawn_blocking(move || -> Result<Vec<SourceTileRow>> {
                    Catalog::open(&cfg.catalog_path)?.zoom0_tiles(&tenant, map_id)
                })
                .await
                .context("tile listing task panicked")??
            };
            if rows.is_empty() {
                continue;
            }

            let preloaded: Arc<HashMap<(i32, i32), SourceTileRow>> =
                Arc::new(rows.into_iter().map(|r| ((r.coord_x, r.coord_y), r)).collect());
            let required: BTreeSet<(i32, i32)> =
                preloaded.keys().map(|&(x, y)| block_parent(x, y)).collect();

            // zoom 0 from the preloaded rows, a few workers at a time
            let workers = Arc::new(Semaphore::new(self.cfg.batch_parallelism));
            let mut handles = Vec::new();
            for &(bx, by) in &required {
                let path = self.cfg.large_tile(tenant_id, map_id, 0, bx, by);
                if path.exists() {
                    continue;
                }
                let cache = Arc::clone(&self);
                let preloaded = Arc::clone(&preloaded);
                let workers = Arc::clone(&workers);
                let key = TileKey::new(tenant_id, map_id, 0, bx, by);
                handles.push(tokio::spawn(async move {
                    let _permit = workers.acquire().await;
                    let cfg = cache.cfg.clone();
                    let block_key = key.clone();
                    let produced = tokio::task::spawn_blocking(move || {
                        let block: HashMap<(i32, i32), SourceTileRow> = preloaded
                            .iter()
                            .filter(|((x, y), _)| block_parent(*x, *y) == (block_key.x, block_key.y))
                            .map(|(c, r)| (*c, r.clone()))
                            .collect();
                        compose_base_block(&cfg, &block_key, block)
                    })
                    .await;
                    match produced {
                        Ok(Ok(Some(_))) => {
                            cache.negative.lock().expect("negative lock").remove(&key);
                            cache.bump(&key.tenant_id, |s| s.generated += 1);
                            true
                        }
                        Ok(Ok(None)) => false,
                        Ok(Err(e)) => {
                            cache.bump(&key.tenant_id, |s| s.failed += 1);
                            warn!(error = %e.to_string(), "batch zoom-0 generation failed");
                            false
                        }
                        Err(e) => {
                            warn!(error = %e, "batch zoom-0 task panicked");
                            false
                        }
                    }
                }));
            }
            for h in handles {
                if matches!(h.await, Ok(true)) {
                    per_zoom[0] += 1;
                }
            }

            // zooms 1..6 from the filesystem only
            let mut children = required;
            for zoom in 1..=MAX_ZOOM {
                let parents: BTreeSet<(i32, i32)> =
                    children.iter().map(|&(x, y)| parent(x, y)).collect();
                for &(px, py) in &parents {
                    let path = self.cfg.large_tile(tenant_id, map_id, zoom, px, py);
                    if path.exists() {
                        continue;
                    }
                    let cfg = self.cfg.clone();
                    let key = TileKey::new(tenant_id, map_id, zoom, px, py);
                    let produced = tokio::task::spawn_blocking(move || -> Result<bool> {
                        let mut quads = [None, None, None, None];
                        for dy in 0..2i32 {
                            for dx in 0..2i32 {
                                let child = cfg.large_tile(
                                    &key.tenant_id,
                                    key.map_id,
                                    key.zoom - 1,
                                    2 * key.x + dx,
                                    2 * key.y + dy,
                                );
                                quads[(dy * 2 + dx) as usize] =
                                    crate::codec::read_webp_tile(&child)?;
                            }
                        }
                        let Some(img) = compose_parent(quads, FilterType::Nearest) else {
                            return Ok(false);
                        };
                        let bytes = encode_webp(&img, cfg.webp_quality)?;
                        write_tile(&cfg.large_tile(&key.tenant_id, key.map_id, key.zoom, key.x, key.y), &bytes)?;
                        Ok(true)
                    })
                    .await
                    .context("batch parent task panicked")?;
                    match produced {
                        Ok(true) => {
                            self.negative.lock().expect("negative lock").remove(&TileKey::new(
                                tenant_id, map_id, zoom, px, py,
                            ));
                            per_zoom[zoom as usize] += 1;
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e.to_string(), "batch parent generation failed"),
                    }
                }
                children = parents;
            }
        }

        Ok(per_zoom.into_iter().enumerate().map(|(z, n)| (z as u8, n)).collect())
    }

    /// Background pre-generation daemon: one cycle per tick, a stats summary
    /// every ten cycles.
    pub fn spawn_pregenerator(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let tick = self.cfg.pregen_tick;
        tokio::spawn(async move {
            let initial = Duration::from_secs(rand::thread_rng().gen_range(30..=90));
            tokio::select! {
                _ = tokio::time::sleep(initial) => {}
                _ = shutdown.changed() => return,
            }
            let mut cycle = 0u64;
            loop {
                cycle += 1;
                let tenants = {
                    let cfg = self.cfg.clone();
                    tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
                        Ok(Catalog::open(&cfg.catalog_path)?
                            .list_active_tenants()?
                            .into_iter()
                            .map(|t| t.id)
                            .collect())
                    })
                    .await
                };
                match tenants {
                    Ok(Ok(tenants)) => {
                        for tenant in tenants {
                            if *shutdown.borrow() {
                                return;
                            }
                            match Arc::clone(&self).generate_missing_tiles(&tenant).await {
                                Ok(counts) => {
                                    let total: usize = counts.iter().map(|(_, n)| n).sum();
                                    if total > 0 {
                                        info!(tenant = %tenant, generated = total, "pre-generated large tiles");
                                    }
                                }
                                Err(e) => {
                                    warn!(tenant = %tenant, error = %e.to_string(), "pre-generation failed")
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => warn!(error = %e.to_string(), "tenant listing failed"),
                    Err(e) => warn!(error = %e, "tenant listing panicked"),
                }

                if cycle % 10 == 0 {
                    for (tenant, s) in self.stats_snapshot() {
                        info!(
                            tenant = %tenant,
                            memory_hits = s.memory_hits,
                            disk_hits = s.disk_hits,
                            negative_hits = s.negative_hits,
                            coalesced = s.coalesced,
                            generated = s.generated,
                            failed = s.failed,
                            dirty_invalidated = s.dirty_invalidated,
                            generation_ms = s.generation_ms,
                            "large-tile cache stats"
                        );
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {
                        info!("pre-generator shutting down");
                        return;
                    }
                }
            }
        });
    }
}

/// Compose one zoom-0 large tile from catalog rows covering its 4x4 block,
/// write it to disk and return the encoded bytes. `None` when no cell drew.
fn compose_base_block(
    cfg: &Config,
    key: &TileKey,
    rows: HashMap<(i32, i32), SourceTileRow>,
) -> Result<Option<Bytes>> {
    let cells: CellMap = rows
        .into_iter()
        .map(|(coord, row)| {
            (coord, SourceCell::BaseTile { file: cfg.grid_file(&row.file), cache: row.cache })
        })
        .collect();
    let textures = HashMap::new();
    let Some(img) = compose_tile(&cells, &textures, key.x, key.y) else {
        return Ok(None);
    };
    let bytes = encode_webp(&img, cfg.webp_quality)?;
    write_tile(&cfg.large_tile(&key.tenant_id, key.map_id, key.zoom, key.x, key.y), &bytes)?;
    Ok(Some(Bytes::from(bytes)))
}
