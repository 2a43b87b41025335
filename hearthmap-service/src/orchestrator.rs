//! Public-map generation runs: single-flight per map id, a deduplicated
//! queue drained by a background ticker, and scheduled auto-regeneration.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use hearthmap_core::hmap::{decode_file, HmapData};
use hearthmap_core::{Bounds, Catalog};
use image::imageops::FilterType;
use image::RgbaImage;
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::align::compute_offsets;
use crate::compose::compose_zoom0;
use crate::config::Config;
use crate::errors::ApiError;
use crate::markers::{hmap_markers, tenant_markers, write_markers};
use crate::now_unix;
use crate::pyramid::build_pyramid;
use crate::sources::{cell_bounds, hmap_cells, tenant_cells};
use crate::textures::TextureStore;

pub struct Orchestrator {
    cfg: Config,
    textures: Arc<TextureStore>,
    client: reqwest::Client,
    running: Mutex<HashSet<String>>,
    queue: Mutex<VecDeque<String>>,
}

struct RunOutcome {
    tile_count: i64,
    bounds: Option<Bounds>,
}

impl Orchestrator {
    pub fn new(cfg: Config, textures: Arc<TextureStore>) -> Self {
        Self {
            cfg,
            textures,
            client: reqwest::Client::new(),
            running: Mutex::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a map for generation; a no-op when it is already queued.
    pub fn enqueue(&self, id: &str) {
        let mut queue = self.queue.lock().expect("queue lock");
        if !queue.iter().any(|q| q == id) {
            queue.push_back(id.to_string());
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.lock().expect("running lock").contains(id)
    }

    /// Run generation for one public map. Rejects with `Conflict` when a run
    /// for the same id is already in flight.
    pub async fn start(&self, id: &str) -> Result<(), ApiError> {
        {
            let mut running = self.running.lock().expect("running lock");
            if !running.insert(id.to_string()) {
                return Err(ApiError::Conflict(format!("generation already running for '{id}'")));
            }
        }
        let result = self.run(id).await;
        self.running.lock().expect("running lock").remove(id);

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = format!("{e:#}");
                error!(map = %id, error = %message, "generation failed");
                if let Err(persist) = self.open_catalog().and_then(|c| c.fail_generation(id, &message)) {
                    warn!(map = %id, error = %persist.to_string(), "failed to persist failure status");
                }
                Err(ApiError::Internal(e))
            }
        }
    }

    async fn run(&self, id: &str) -> Result<()> {
        let started = Instant::now();
        let cfg = self.cfg.clone();
        let map_id = id.to_string();

        type SourceRows = (Vec<hearthmap_core::db::TenantSourceRow>, Vec<hearthmap_core::db::HmapLinkRow>);
        let (tenant_sources, hmap_links) = {
            let map_id = map_id.clone();
            let cfg = cfg.clone();
            tokio::task::spawn_blocking(move || -> Result<SourceRows> {
                let catalog = Catalog::open(&cfg.catalog_path)?;
                let row = catalog
                    .get_public_map(&map_id)?
                    .ok_or_else(|| anyhow!("unknown public map '{map_id}'"))?;
                catalog.mark_generation_running(&row.id)?;
                let tenant_sources = catalog.list_tenant_sources(&row.id)?;
                let hmap_links = catalog.list_hmap_links(&row.id)?;
                Ok((tenant_sources, hmap_links))
            })
            .await
            .context("catalog load task panicked")??
        };

        if tenant_sources.is_empty() && hmap_links.is_empty() {
            info!(map = %id, "no sources; completing with zero tiles");
            let elapsed = started.elapsed().as_secs() as i64;
            let map_id = map_id.clone();
            let cfg = cfg.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                Catalog::open(&cfg.catalog_path)?
                    .complete_generation(&map_id, 0, None, now_unix() as i64, elapsed)
            })
            .await
            .context("completion task panicked")??;
            return Ok(());
        }

        let out_dir = cfg.public_dir(id);
        if out_dir.exists() {
            std::fs::remove_dir_all(&out_dir)
                .with_context(|| format!("failed to clear {}", out_dir.display()))?;
        }
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;

        let outcome = if !tenant_sources.is_empty() {
            self.run_tenant_path(&map_id, tenant_sources).await?
        } else {
            self.run_hmap_path(&map_id, hmap_links).await?
        };

        let elapsed = started.elapsed().as_secs() as i64;
        {
            let map_id = map_id.clone();
            let cfg = cfg.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                Catalog::open(&cfg.catalog_path)?.complete_generation(
                    &map_id,
                    outcome.tile_count,
                    outcome.bounds,
                    now_unix() as i64,
                    elapsed,
                )
            })
            .await
            .context("completion task panicked")??;
        }
        info!(map = %id, tiles = outcome.tile_count, seconds = elapsed, "generation completed");

        self.notify_viewer(id);
        Ok(())
    }

    async fn run_tenant_path(
        &self,
        id: &str,
        sources: Vec<hearthmap_core::db::TenantSourceRow>,
    ) -> Result<RunOutcome> {
        let cfg = self.cfg.clone();
        let map_id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<RunOutcome> {
            let catalog = Catalog::open(&cfg.catalog_path)?;
            let offsets = compute_offsets(&catalog, &sources)?;
            let cells = tenant_cells(&catalog, &cfg.grid_storage, &sources, &offsets)?;
            let bounds = cell_bounds(&cells);
            let markers = tenant_markers(&catalog, &sources, &offsets)?;
            let textures = HashMap::new();
            finish_run(&cfg, &map_id, &catalog, cells, &textures, markers, bounds, 0)
        })
        .await
        .context("tenant composition task panicked")?
    }

    async fn run_hmap_path(
        &self,
        id: &str,
        links: Vec<hearthmap_core::db::HmapLinkRow>,
    ) -> Result<RunOutcome> {
        let cfg = self.cfg.clone();
        let map_id = id.to_string();

        // decode every linked snapshot in priority order
        let datas: Vec<HmapData> = {
            let cfg = cfg.clone();
            let map_id = map_id.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<HmapData>> {
                let catalog = Catalog::open(&cfg.catalog_path)?;
                let mut datas = Vec::with_capacity(links.len());
                for link in &links {
                    let source = catalog
                        .get_hmap_source(link.hmap_source_id)?
                        .ok_or_else(|| anyhow!("unknown hmap source {}", link.hmap_source_id))?;
                    let path = cfg.grid_file(&source.file_path);
                    let data = decode_file(&path)
                        .with_context(|| format!("failed to decode {}", path.display()))?;
                    datas.push(data);
                }
                if let Err(e) = catalog.set_generation_progress(&map_id, 15) {
                    warn!(map = %map_id, error = %e.to_string(), "progress write failed");
                }
                Ok(datas)
            })
            .await
            .context("snapshot decode task panicked")??
        };

        let mut names: Vec<String> = datas.iter().flat_map(|d| d.resource_names()).collect();
        names.sort();
        names.dedup();
        // a resource missing in an earlier run may exist upstream by now
        self.textures.reset_misses().await;
        let textures = Arc::clone(&self.textures).resolve_table(&names).await;

        tokio::task::spawn_blocking(move || -> Result<RunOutcome> {
            let catalog = Catalog::open(&cfg.catalog_path)?;
            let (cells, raw_markers) = hmap_cells(datas);
            let bounds = cell_bounds(&cells);
            let markers = hmap_markers(&raw_markers);
            finish_run(&cfg, &map_id, &catalog, cells, &textures, markers, bounds, 15)
        })
        .await
        .context("snapshot composition task panicked")?
    }

    fn open_catalog(&self) -> Result<Catalog> {
        Catalog::open(&self.cfg.catalog_path)
    }

    /// Best-effort downstream cache invalidation; failures are warnings.
    fn notify_viewer(&self, id: &str) {
        let Some(base) = self.cfg.viewer_internal_url.clone() else { return };
        let url = format!("{}/internal/public-cache/invalidate/{}", base.trim_end_matches('/'), id);
        let client = self.client.clone();
        let map_id = id.to_string();
        tokio::spawn(async move {
            match client.post(&url).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(map = %map_id, status = %resp.status(), "viewer invalidation rejected"),
                Err(e) => warn!(map = %map_id, error = %e, "viewer invalidation failed"),
            }
        });
    }

    /// Ticker draining the queue and starting due auto-regenerations.
    pub fn spawn_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let tick = self.cfg.orchestrator_tick;
        tokio::spawn(async move {
            let initial = Duration::from_secs(rand::thread_rng().gen_range(5..=30));
            tokio::select! {
                _ = tokio::time::sleep(initial) => {}
                _ = shutdown.changed() => return,
            }
            loop {
                self.drain_queue().await;
                self.start_due_regenerations().await;
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {
                        info!("scheduler shutting down");
                        return;
                    }
                }
            }
        });
    }

    async fn drain_queue(&self) {
        loop {
            let Some(id) = self.queue.lock().expect("queue lock").pop_front() else { break };
            match self.start(&id).await {
                Ok(()) => {}
                Err(ApiError::Conflict(_)) => {
                    info!(map = %id, "queued run skipped; already running");
                }
                Err(e) => warn!(map = %id, error = %e.to_string(), "queued run failed"),
            }
        }
    }

    async fn start_due_regenerations(&self) {
        let cfg = self.cfg.clone();
        let due = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let catalog = Catalog::open(&cfg.catalog_path)?;
            Ok(catalog
                .list_auto_regenerate_due(now_unix() as i64)?
                .into_iter()
                .map(|m| m.id)
                .collect())
        })
        .await;
        let due = match due {
            Ok(Ok(due)) => due,
            Ok(Err(e)) => {
                warn!(error = %e.to_string(), "auto-regeneration scan failed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "auto-regeneration scan panicked");
                return;
            }
        };
        for id in due {
            info!(map = %id, "auto-regeneration due");
            if let Err(e) = self.start(&id).await {
                match e {
                    ApiError::Conflict(_) => {}
                    other => warn!(map = %id, error = %other.to_string(), "auto-regeneration failed"),
                }
            }
        }
    }
}

/// Shared tail of both source paths: compose zoom 0, build the pyramid,
/// write markers, return what the completion row needs.
#[allow(clippy::too_many_arguments)]
fn finish_run(
    cfg: &Config,
    map_id: &str,
    catalog: &Catalog,
    cells: crate::sources::CellMap,
    textures: &HashMap<String, RgbaImage>,
    markers: Vec<hearthmap_core::models::PublicMarker>,
    bounds: Option<Bounds>,
    progress_floor: i64,
) -> Result<RunOutcome> {
    let out_dir = cfg.public_dir(map_id);
    let mut report = |pct: i64| {
        if let Err(e) = catalog.set_generation_progress(map_id, pct) {
            warn!(map = %map_id, error = %e.to_string(), "progress write failed");
        }
    };

    let zoom0 = compose_zoom0(
        &cells,
        textures,
        &out_dir,
        cfg.webp_quality,
        (progress_floor, 50),
        &mut report,
    )?;
    let pyramid_count = build_pyramid(
        &out_dir,
        &zoom0,
        cfg.webp_quality,
        FilterType::Triangle,
        (50, 100),
        &mut report,
    )?;
    write_markers(&cfg.markers_path(map_id), &markers)?;

    Ok(RunOutcome {
        tile_count: (zoom0.len() + pyramid_count) as i64,
        bounds: if zoom0.is_empty() { None } else { bounds },
    })
}
