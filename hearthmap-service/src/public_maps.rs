//! Public-map catalog service: CRUD over public maps and their sources,
//! snapshot upload intake, and contribution analysis. Every operation opens
//! its own short-lived catalog handle.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use hearthmap_core::db::{HmapLinkRow, HmapSourceRow, PublicMapRow, TenantSourceRow};
use hearthmap_core::hmap::{analyze_file, decode_bytes};
use hearthmap_core::models::GenerationStatus;
use hearthmap_core::{slugify, Catalog, HMAP_MAGIC};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::errors::ApiError;
use crate::now_unix;

const SLUG_MAX: usize = 50;

#[derive(Debug, Default, Clone)]
pub struct PublicMapUpdate {
    pub name: Option<String>,
    pub is_active: Option<bool>,
    pub auto_regenerate: Option<bool>,
    /// `Some(None)` clears the interval.
    pub regenerate_interval_minutes: Option<Option<i64>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicMapBounds {
    pub id: String,
    pub name: String,
    pub min_x: Option<i32>,
    pub max_x: Option<i32>,
    pub min_y: Option<i32>,
    pub max_y: Option<i32>,
    pub tile_version: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTenantMap {
    pub tenant_id: String,
    pub tenant_name: String,
    pub map_id: i64,
    pub tile_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceContribution {
    pub hmap_source_id: i64,
    pub new_grids: i64,
    pub overlapping_grids: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionReport {
    pub sources: Vec<SourceContribution>,
    pub total_grids: i64,
}

pub struct PublicMapService {
    cfg: Config,
}

impl PublicMapService {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    fn catalog(&self) -> Result<Catalog, ApiError> {
        Ok(Catalog::open(&self.cfg.catalog_path)?)
    }

    // ---- public maps -----------------------------------------------------

    pub fn create_public_map(
        &self,
        name: &str,
        slug: Option<&str>,
        is_active: bool,
        created_by: &str,
    ) -> Result<PublicMapRow, ApiError> {
        if name.trim().is_empty() {
            return Err(ApiError::InvalidArgument("map name must not be empty".into()));
        }
        let base = match slug {
            // an explicit slug that would need padding out is a caller error
            Some(explicit) if slugify_core_len(explicit) < 3 => {
                return Err(ApiError::InvalidArgument(format!(
                    "slug '{explicit}' is shorter than 3 characters after normalisation"
                )));
            }
            Some(explicit) => slugify(explicit),
            None => slugify(name),
        };

        let catalog = self.catalog()?;
        let id = resolve_collision(&catalog, &base)?;
        let row = PublicMapRow {
            id: id.clone(),
            name: name.to_string(),
            is_active,
            created_at: now_unix() as i64,
            created_by: created_by.to_string(),
            auto_regenerate: false,
            regenerate_interval_minutes: None,
            generation_status: GenerationStatus::Pending,
            generation_progress: 0,
            tile_count: 0,
            last_generated_at: None,
            last_generation_duration_seconds: None,
            generation_error: None,
            min_x: None,
            max_x: None,
            min_y: None,
            max_y: None,
        };
        catalog.insert_public_map(&row)?;
        info!(map = %id, name = %name, "created public map");
        Ok(row)
    }

    pub fn get_public_map(&self, id: &str) -> Result<PublicMapRow, ApiError> {
        self.catalog()?
            .get_public_map(id)?
            .ok_or_else(|| ApiError::NotFound(format!("unknown public map '{id}'")))
    }

    pub fn list_public_maps(&self) -> Result<Vec<PublicMapRow>, ApiError> {
        Ok(self.catalog()?.list_public_maps()?)
    }

    pub fn update_public_map(&self, id: &str, update: PublicMapUpdate) -> Result<PublicMapRow, ApiError> {
        let catalog = self.catalog()?;
        let mut row = catalog
            .get_public_map(id)?
            .ok_or_else(|| ApiError::NotFound(format!("unknown public map '{id}'")))?;
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(ApiError::InvalidArgument("map name must not be empty".into()));
            }
            row.name = name;
        }
        if let Some(active) = update.is_active {
            row.is_active = active;
        }
        if let Some(auto) = update.auto_regenerate {
            row.auto_regenerate = auto;
        }
        if let Some(interval) = update.regenerate_interval_minutes {
            if matches!(interval, Some(m) if m <= 0) {
                return Err(ApiError::InvalidArgument("regeneration interval must be positive".into()));
            }
            row.regenerate_interval_minutes = interval;
        }
        catalog.update_public_map_settings(
            &row.id,
            &row.name,
            row.is_active,
            row.auto_regenerate,
            row.regenerate_interval_minutes,
        )?;
        Ok(row)
    }

    /// Delete a public map, its source links and its generated tile tree.
    pub fn delete_public_map(&self, id: &str) -> Result<(), ApiError> {
        let catalog = self.catalog()?;
        if !catalog.public_map_exists(id)? {
            return Err(ApiError::NotFound(format!("unknown public map '{id}'")));
        }
        let dir = self.cfg.public_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        catalog.delete_public_map(id)?;
        info!(map = %id, "deleted public map");
        Ok(())
    }

    pub fn get_bounds(&self, id: &str) -> Result<PublicMapBounds, ApiError> {
        let row = self.get_public_map(id)?;
        Ok(PublicMapBounds {
            id: row.id,
            name: row.name,
            min_x: row.min_x,
            max_x: row.max_x,
            min_y: row.min_y,
            max_y: row.max_y,
            tile_version: row.last_generated_at,
        })
    }

    // ---- tenant sources --------------------------------------------------

    pub fn add_tenant_source(
        &self,
        public_map_id: &str,
        tenant_id: &str,
        map_id: i64,
        priority: i64,
        added_by: &str,
    ) -> Result<(), ApiError> {
        let catalog = self.catalog()?;
        if !catalog.public_map_exists(public_map_id)? {
            return Err(ApiError::NotFound(format!("unknown public map '{public_map_id}'")));
        }
        let duplicate = catalog
            .list_tenant_sources(public_map_id)?
            .iter()
            .any(|s| s.tenant_id == tenant_id && s.map_id == map_id);
        if duplicate {
            return Err(ApiError::InvalidArgument(format!(
                "source ({tenant_id}, {map_id}) is already linked to '{public_map_id}'"
            )));
        }
        catalog.insert_tenant_source(&TenantSourceRow {
            public_map_id: public_map_id.to_string(),
            tenant_id: tenant_id.to_string(),
            map_id,
            priority,
            added_at: now_unix() as i64,
            added_by: added_by.to_string(),
        })?;
        Ok(())
    }

    pub fn remove_tenant_source(&self, public_map_id: &str, tenant_id: &str, map_id: i64) -> Result<(), ApiError> {
        let removed = self.catalog()?.delete_tenant_source(public_map_id, tenant_id, map_id)?;
        if removed == 0 {
            return Err(ApiError::NotFound(format!(
                "source ({tenant_id}, {map_id}) is not linked to '{public_map_id}'"
            )));
        }
        Ok(())
    }

    pub fn set_tenant_source_priority(
        &self,
        public_map_id: &str,
        tenant_id: &str,
        map_id: i64,
        priority: i64,
    ) -> Result<(), ApiError> {
        let updated =
            self.catalog()?.set_tenant_source_priority(public_map_id, tenant_id, map_id, priority)?;
        if updated == 0 {
            return Err(ApiError::NotFound(format!(
                "source ({tenant_id}, {map_id}) is not linked to '{public_map_id}'"
            )));
        }
        Ok(())
    }

    // ---- hmap sources ----------------------------------------------------

    /// Validate and store an uploaded snapshot, then analyse its structure.
    pub fn save_hmap_source(
        &self,
        name: &str,
        original_file_name: &str,
        bytes: &[u8],
    ) -> Result<HmapSourceRow, ApiError> {
        if bytes.len() < HMAP_MAGIC.len() || &bytes[..HMAP_MAGIC.len()] != HMAP_MAGIC {
            return Err(ApiError::InvalidArgument("not a Haven mapfile".into()));
        }
        if bytes.len() as u64 > self.cfg.hmap_max_bytes {
            return Err(ApiError::InvalidArgument(format!(
                "mapfile exceeds the {} byte upload ceiling",
                self.cfg.hmap_max_bytes
            )));
        }
        // full structural validation before anything touches disk
        decode_bytes(bytes).map_err(|e| ApiError::InvalidArgument(format!("malformed mapfile: {e}")))?;

        let basename = Path::new(original_file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.hmap");
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let relative = format!("hmap-sources/{stamp}_{basename}");
        let full = self.cfg.grid_file(&relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&full, bytes).with_context(|| format!("failed to write {}", full.display()))?;

        let catalog = self.catalog()?;
        let id = catalog.insert_hmap_source(&HmapSourceRow {
            id: 0,
            name: name.to_string(),
            file_name: basename.to_string(),
            file_path: relative,
            file_size_bytes: bytes.len() as i64,
            total_grids: None,
            segment_count: None,
            min_x: None,
            max_x: None,
            min_y: None,
            max_y: None,
            analyzed_at: None,
            created_at: now_unix() as i64,
        })?;
        drop(catalog);
        self.refresh_hmap_analysis(id)
    }

    /// Re-parse the stored file and refresh the analysis columns.
    pub fn refresh_hmap_analysis(&self, id: i64) -> Result<HmapSourceRow, ApiError> {
        let catalog = self.catalog()?;
        let row = catalog
            .get_hmap_source(id)?
            .ok_or_else(|| ApiError::NotFound(format!("unknown hmap source {id}")))?;
        let analysis = analyze_file(self.cfg.grid_file(&row.file_path))
            .map_err(|e| ApiError::InvalidArgument(format!("malformed mapfile: {e}")))?;
        catalog.set_hmap_analysis(id, &analysis, now_unix() as i64)?;
        catalog
            .get_hmap_source(id)?
            .ok_or_else(|| ApiError::NotFound(format!("unknown hmap source {id}")))
    }

    pub fn list_hmap_sources(&self) -> Result<Vec<HmapSourceRow>, ApiError> {
        Ok(self.catalog()?.list_hmap_sources()?)
    }

    /// Deleting is forbidden while any public map still references the file.
    pub fn delete_hmap_source(&self, id: i64) -> Result<(), ApiError> {
        let catalog = self.catalog()?;
        let row = catalog
            .get_hmap_source(id)?
            .ok_or_else(|| ApiError::NotFound(format!("unknown hmap source {id}")))?;
        let references = catalog.count_hmap_references(id)?;
        if references > 0 {
            return Err(ApiError::InvalidArgument(format!(
                "hmap source {id} is referenced by {references} public map(s)"
            )));
        }
        let full = self.cfg.grid_file(&row.file_path);
        if full.exists() {
            std::fs::remove_file(&full)
                .with_context(|| format!("failed to remove {}", full.display()))?;
        }
        catalog.delete_hmap_source(id)?;
        Ok(())
    }

    pub fn add_hmap_source_link(&self, public_map_id: &str, hmap_source_id: i64, priority: i64) -> Result<(), ApiError> {
        let catalog = self.catalog()?;
        if !catalog.public_map_exists(public_map_id)? {
            return Err(ApiError::NotFound(format!("unknown public map '{public_map_id}'")));
        }
        if catalog.get_hmap_source(hmap_source_id)?.is_none() {
            return Err(ApiError::NotFound(format!("unknown hmap source {hmap_source_id}")));
        }
        let duplicate = catalog
            .list_hmap_links(public_map_id)?
            .iter()
            .any(|l| l.hmap_source_id == hmap_source_id);
        if duplicate {
            return Err(ApiError::InvalidArgument(format!(
                "hmap source {hmap_source_id} is already linked to '{public_map_id}'"
            )));
        }
        catalog.insert_hmap_link(&HmapLinkRow {
            public_map_id: public_map_id.to_string(),
            hmap_source_id,
            priority,
            added_at: now_unix() as i64,
            new_grids: None,
            overlapping_grids: None,
        })?;
        Ok(())
    }

    pub fn remove_hmap_source_link(&self, public_map_id: &str, hmap_source_id: i64) -> Result<(), ApiError> {
        let removed = self.catalog()?.delete_hmap_link(public_map_id, hmap_source_id)?;
        if removed == 0 {
            return Err(ApiError::NotFound(format!(
                "hmap source {hmap_source_id} is not linked to '{public_map_id}'"
            )));
        }
        Ok(())
    }

    pub fn set_hmap_source_priority(&self, public_map_id: &str, hmap_source_id: i64, priority: i64) -> Result<(), ApiError> {
        let updated = self.catalog()?.set_hmap_link_priority(public_map_id, hmap_source_id, priority)?;
        if updated == 0 {
            return Err(ApiError::NotFound(format!(
                "hmap source {hmap_source_id} is not linked to '{public_map_id}'"
            )));
        }
        Ok(())
    }

    /// Walk every linked snapshot in priority order counting grid coordinates
    /// each source is the first to claim. The counters are persisted to the
    /// linking rows as a side effect.
    pub fn analyze_contributions(&self, public_map_id: &str) -> Result<ContributionReport, ApiError> {
        let catalog = self.catalog()?;
        if !catalog.public_map_exists(public_map_id)? {
            return Err(ApiError::NotFound(format!("unknown public map '{public_map_id}'")));
        }
        let links = catalog.list_hmap_links(public_map_id)?;
        let mut claimed: HashSet<(i32, i32)> = HashSet::new();
        let mut sources = Vec::with_capacity(links.len());
        for link in &links {
            let source = catalog
                .get_hmap_source(link.hmap_source_id)?
                .ok_or_else(|| ApiError::NotFound(format!("unknown hmap source {}", link.hmap_source_id)))?;
            let data = hearthmap_core::hmap::decode_file(self.cfg.grid_file(&source.file_path))
                .map_err(|e| ApiError::InvalidArgument(format!("malformed mapfile: {e}")))?;
            let mut new_grids = 0i64;
            let mut overlapping = 0i64;
            for grid in &data.grids {
                if claimed.insert((grid.tile_x, grid.tile_y)) {
                    new_grids += 1;
                } else {
                    overlapping += 1;
                }
            }
            catalog.set_hmap_link_contribution(public_map_id, link.hmap_source_id, new_grids, overlapping)?;
            sources.push(SourceContribution {
                hmap_source_id: link.hmap_source_id,
                new_grids,
                overlapping_grids: overlapping,
            });
        }
        Ok(ContributionReport { sources, total_grids: claimed.len() as i64 })
    }

    // ---- tenant map listing ----------------------------------------------

    pub fn list_available_tenant_maps(&self) -> Result<Vec<AvailableTenantMap>, ApiError> {
        let catalog = self.catalog()?;
        let mut out = Vec::new();
        for tenant in catalog.list_active_tenants()? {
            for map_id in catalog.list_tenant_maps(&tenant.id)? {
                let tile_count = catalog.count_zoom0_tiles(&tenant.id, map_id)?;
                out.push(AvailableTenantMap {
                    tenant_id: tenant.id.clone(),
                    tenant_name: tenant.name.clone(),
                    map_id,
                    tile_count,
                });
            }
        }
        Ok(out)
    }
}

/// Length of the normalised slug body, before the short-input fallbacks.
fn slugify_core_len(input: &str) -> usize {
    let mut len = 0usize;
    let mut last_dash = true;
    let mut trailing = 0usize;
    for ch in input.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            len += 1;
            last_dash = false;
            trailing = 0;
        } else if !last_dash {
            len += 1;
            last_dash = true;
            trailing += 1;
        }
    }
    len - trailing
}

/// Suffix `-1`, `-2`, ... until the slug is free.
fn resolve_collision(catalog: &Catalog, base: &str) -> Result<String, ApiError> {
    if !catalog.public_map_exists(base)? {
        return Ok(base.to_string());
    }
    for n in 1.. {
        let suffix = format!("-{n}");
        let mut candidate = base.to_string();
        candidate.truncate(SLUG_MAX.saturating_sub(suffix.len()));
        while candidate.ends_with('-') {
            candidate.pop();
        }
        candidate.push_str(&suffix);
        if !catalog.public_map_exists(&candidate)? {
            return Ok(candidate);
        }
    }
    unreachable!("collision loop is unbounded")
}
