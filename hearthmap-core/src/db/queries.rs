use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::rows::{
    HmapLinkRow, HmapSourceRow, MarkerRow, PublicMapRow, SourceGridRow, SourceTileRow, TenantRow,
    TenantSourceRow, HMAP_SOURCE_COLUMNS, PUBLIC_MAP_COLUMNS,
};
use super::Catalog;
use crate::coords::Bounds;
use crate::hmap::HmapAnalysis;
use crate::models::GenerationStatus;

impl Catalog {
    // ---- public maps -----------------------------------------------------

    pub fn insert_public_map(&self, row: &PublicMapRow) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO public_maps (id, name, is_active, created_at, created_by, \
                 auto_regenerate, regenerate_interval_minutes) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .context("prepare insert_public_map")?
            .execute(params![
                row.id,
                row.name,
                row.is_active as i64,
                row.created_at,
                row.created_by,
                row.auto_regenerate as i64,
                row.regenerate_interval_minutes,
            ])
            .context("exec insert_public_map")?;
        Ok(())
    }

    pub fn get_public_map(&self, id: &str) -> Result<Option<PublicMapRow>> {
        let sql = format!("SELECT {PUBLIC_MAP_COLUMNS} FROM public_maps WHERE id = ?1");
        let row = self
            .conn()
            .prepare_cached(&sql)
            .context("prepare get_public_map")?
            .query_row(params![id], |r| Ok(PublicMapRow::from_row(r)))
            .optional()
            .context("exec get_public_map")?;
        Ok(row)
    }

    pub fn list_public_maps(&self) -> Result<Vec<PublicMapRow>> {
        let sql = format!("SELECT {PUBLIC_MAP_COLUMNS} FROM public_maps ORDER BY id");
        let mut stmt = self.conn().prepare_cached(&sql).context("prepare list_public_maps")?;
        let rows = stmt
            .query_map([], |r| Ok(PublicMapRow::from_row(r)))
            .context("exec list_public_maps")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn public_map_exists(&self, id: &str) -> Result<bool> {
        let n: i64 = self
            .conn()
            .prepare_cached("SELECT COUNT(*) FROM public_maps WHERE id = ?1")
            .context("prepare public_map_exists")?
            .query_row(params![id], |r| r.get(0))
            .context("exec public_map_exists")?;
        Ok(n > 0)
    }

    pub fn update_public_map_settings(
        &self,
        id: &str,
        name: &str,
        is_active: bool,
        auto_regenerate: bool,
        regenerate_interval_minutes: Option<i64>,
    ) -> Result<()> {
        self.conn()
            .prepare_cached(
                "UPDATE public_maps SET name = ?2, is_active = ?3, auto_regenerate = ?4, \
                 regenerate_interval_minutes = ?5 WHERE id = ?1",
            )
            .context("prepare update_public_map_settings")?
            .execute(params![id, name, is_active as i64, auto_regenerate as i64, regenerate_interval_minutes])
            .context("exec update_public_map_settings")?;
        Ok(())
    }

    pub fn delete_public_map(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM public_map_sources WHERE public_map_id = ?1", params![id])
            .context("delete tenant source links")?;
        self.conn()
            .execute("DELETE FROM public_map_hmap_sources WHERE public_map_id = ?1", params![id])
            .context("delete hmap source links")?;
        self.conn()
            .execute("DELETE FROM public_maps WHERE id = ?1", params![id])
            .context("delete public map")?;
        Ok(())
    }

    // ---- generation status -----------------------------------------------

    pub fn mark_generation_running(&self, id: &str) -> Result<()> {
        self.conn()
            .prepare_cached(
                "UPDATE public_maps SET generation_status = 'running', generation_progress = 0, \
                 generation_error = NULL WHERE id = ?1",
            )
            .context("prepare mark_generation_running")?
            .execute(params![id])
            .context("exec mark_generation_running")?;
        Ok(())
    }

    /// Progress is monotonic within a run and capped at 99 until completion.
    pub fn set_generation_progress(&self, id: &str, percent: i64) -> Result<()> {
        self.conn()
            .prepare_cached(
                "UPDATE public_maps SET generation_progress = \
                 MAX(generation_progress, MIN(?2, 99)) WHERE id = ?1",
            )
            .context("prepare set_generation_progress")?
            .execute(params![id, percent])
            .context("exec set_generation_progress")?;
        Ok(())
    }

    pub fn complete_generation(
        &self,
        id: &str,
        tile_count: i64,
        bounds: Option<Bounds>,
        generated_at: i64,
        duration_seconds: i64,
    ) -> Result<()> {
        match bounds {
            Some(b) => {
                self.conn()
                    .prepare_cached(
                        "UPDATE public_maps SET generation_status = 'completed', \
                         generation_progress = 100, generation_error = NULL, tile_count = ?2, \
                         last_generated_at = ?3, last_generation_duration_seconds = ?4, \
                         min_x = ?5, max_x = ?6, min_y = ?7, max_y = ?8 WHERE id = ?1",
                    )
                    .context("prepare complete_generation")?
                    .execute(params![
                        id, tile_count, generated_at, duration_seconds,
                        b.min_x, b.max_x, b.min_y, b.max_y
                    ])
                    .context("exec complete_generation")?;
            }
            // empty run: bounds stay as they were
            None => {
                self.conn()
                    .prepare_cached(
                        "UPDATE public_maps SET generation_status = 'completed', \
                         generation_progress = 100, generation_error = NULL, tile_count = ?2, \
                         last_generated_at = ?3, last_generation_duration_seconds = ?4 WHERE id = ?1",
                    )
                    .context("prepare complete_generation")?
                    .execute(params![id, tile_count, generated_at, duration_seconds])
                    .context("exec complete_generation")?;
            }
        }
        Ok(())
    }

    pub fn fail_generation(&self, id: &str, error: &str) -> Result<()> {
        self.conn()
            .prepare_cached(
                "UPDATE public_maps SET generation_status = 'failed', generation_error = ?2 \
                 WHERE id = ?1",
            )
            .context("prepare fail_generation")?
            .execute(params![id, error])
            .context("exec fail_generation")?;
        Ok(())
    }

    /// Maps due for automatic regeneration as of `now` (unix seconds).
    pub fn list_auto_regenerate_due(&self, now: i64) -> Result<Vec<PublicMapRow>> {
        let sql = format!(
            "SELECT {PUBLIC_MAP_COLUMNS} FROM public_maps WHERE is_active = 1 \
             AND auto_regenerate = 1 AND regenerate_interval_minutes IS NOT NULL \
             AND generation_status != 'running' \
             AND (last_generated_at IS NULL \
                  OR last_generated_at + regenerate_interval_minutes * 60 <= ?1) \
             ORDER BY id"
        );
        let mut stmt = self.conn().prepare_cached(&sql).context("prepare list_auto_regenerate_due")?;
        let rows = stmt
            .query_map(params![now], |r| Ok(PublicMapRow::from_row(r)))
            .context("exec list_auto_regenerate_due")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- tenant sources --------------------------------------------------

    /// Sources in composition order: priority desc, then added_at asc. The
    /// first row is the alignment base.
    pub fn list_tenant_sources(&self, public_map_id: &str) -> Result<Vec<TenantSourceRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT public_map_id, tenant_id, map_id, priority, added_at, added_by \
                 FROM public_map_sources WHERE public_map_id = ?1 \
                 ORDER BY priority DESC, added_at ASC, tenant_id, map_id",
            )
            .context("prepare list_tenant_sources")?;
        let rows = stmt
            .query_map(params![public_map_id], |r| Ok(TenantSourceRow::from_row(r)))
            .context("exec list_tenant_sources")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn insert_tenant_source(&self, row: &TenantSourceRow) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO public_map_sources \
                 (public_map_id, tenant_id, map_id, priority, added_at, added_by) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .context("prepare insert_tenant_source")?
            .execute(params![
                row.public_map_id, row.tenant_id, row.map_id, row.priority, row.added_at, row.added_by
            ])
            .context("exec insert_tenant_source")?;
        Ok(())
    }

    pub fn delete_tenant_source(&self, public_map_id: &str, tenant_id: &str, map_id: i64) -> Result<usize> {
        let n = self
            .conn()
            .prepare_cached(
                "DELETE FROM public_map_sources WHERE public_map_id = ?1 AND tenant_id = ?2 AND map_id = ?3",
            )
            .context("prepare delete_tenant_source")?
            .execute(params![public_map_id, tenant_id, map_id])
            .context("exec delete_tenant_source")?;
        Ok(n)
    }

    pub fn set_tenant_source_priority(
        &self,
        public_map_id: &str,
        tenant_id: &str,
        map_id: i64,
        priority: i64,
    ) -> Result<usize> {
        let n = self
            .conn()
            .prepare_cached(
                "UPDATE public_map_sources SET priority = ?4 \
                 WHERE public_map_id = ?1 AND tenant_id = ?2 AND map_id = ?3",
            )
            .context("prepare set_tenant_source_priority")?
            .execute(params![public_map_id, tenant_id, map_id, priority])
            .context("exec set_tenant_source_priority")?;
        Ok(n)
    }

    // ---- hmap source links -----------------------------------------------

    pub fn list_hmap_links(&self, public_map_id: &str) -> Result<Vec<HmapLinkRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT public_map_id, hmap_source_id, priority, added_at, new_grids, overlapping_grids \
                 FROM public_map_hmap_sources WHERE public_map_id = ?1 \
                 ORDER BY priority DESC, added_at ASC, hmap_source_id",
            )
            .context("prepare list_hmap_links")?;
        let rows = stmt
            .query_map(params![public_map_id], |r| Ok(HmapLinkRow::from_row(r)))
            .context("exec list_hmap_links")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn insert_hmap_link(&self, row: &HmapLinkRow) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO public_map_hmap_sources (public_map_id, hmap_source_id, priority, added_at) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .context("prepare insert_hmap_link")?
            .execute(params![row.public_map_id, row.hmap_source_id, row.priority, row.added_at])
            .context("exec insert_hmap_link")?;
        Ok(())
    }

    pub fn delete_hmap_link(&self, public_map_id: &str, hmap_source_id: i64) -> Result<usize> {
        let n = self
            .conn()
            .prepare_cached(
                "DELETE FROM public_map_hmap_sources WHERE public_map_id = ?1 AND hmap_source_id = ?2",
            )
            .context("prepare delete_hmap_link")?
            .execute(params![public_map_id, hmap_source_id])
            .context("exec delete_hmap_link")?;
        Ok(n)
    }

    pub fn set_hmap_link_priority(&self, public_map_id: &str, hmap_source_id: i64, priority: i64) -> Result<usize> {
        let n = self
            .conn()
            .prepare_cached(
                "UPDATE public_map_hmap_sources SET priority = ?3 \
                 WHERE public_map_id = ?1 AND hmap_source_id = ?2",
            )
            .context("prepare set_hmap_link_priority")?
            .execute(params![public_map_id, hmap_source_id, priority])
            .context("exec set_hmap_link_priority")?;
        Ok(n)
    }

    pub fn set_hmap_link_contribution(
        &self,
        public_map_id: &str,
        hmap_source_id: i64,
        new_grids: i64,
        overlapping_grids: i64,
    ) -> Result<()> {
        self.conn()
            .prepare_cached(
                "UPDATE public_map_hmap_sources SET new_grids = ?3, overlapping_grids = ?4 \
                 WHERE public_map_id = ?1 AND hmap_source_id = ?2",
            )
            .context("prepare set_hmap_link_contribution")?
            .execute(params![public_map_id, hmap_source_id, new_grids, overlapping_grids])
            .context("exec set_hmap_link_contribution")?;
        Ok(())
    }

    // ---- hmap sources ----------------------------------------------------

    pub fn insert_hmap_source(&self, row: &HmapSourceRow) -> Result<i64> {
        self.conn()
            .prepare_cached(
                "INSERT INTO hmap_sources (name, file_name, file_path, file_size_bytes, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .context("prepare insert_hmap_source")?
            .execute(params![row.name, row.file_name, row.file_path, row.file_size_bytes, row.created_at])
            .context("exec insert_hmap_source")?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_hmap_source(&self, id: i64) -> Result<Option<HmapSourceRow>> {
        let sql = format!("SELECT {HMAP_SOURCE_COLUMNS} FROM hmap_sources WHERE id = ?1");
        let row = self
            .conn()
            .prepare_cached(&sql)
            .context("prepare get_hmap_source")?
            .query_row(params![id], |r| Ok(HmapSourceRow::from_row(r)))
            .optional()
            .context("exec get_hmap_source")?;
        Ok(row)
    }

    pub fn list_hmap_sources(&self) -> Result<Vec<HmapSourceRow>> {
        let sql = format!("SELECT {HMAP_SOURCE_COLUMNS} FROM hmap_sources ORDER BY id");
        let mut stmt = self.conn().prepare_cached(&sql).context("prepare list_hmap_sources")?;
        let rows = stmt
            .query_map([], |r| Ok(HmapSourceRow::from_row(r)))
            .context("exec list_hmap_sources")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn delete_hmap_source(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM hmap_sources WHERE id = ?1", params![id])
            .context("exec delete_hmap_source")?;
        Ok(())
    }

    pub fn count_hmap_references(&self, hmap_source_id: i64) -> Result<i64> {
        let n: i64 = self
            .conn()
            .prepare_cached("SELECT COUNT(*) FROM public_map_hmap_sources WHERE hmap_source_id = ?1")
            .context("prepare count_hmap_references")?
            .query_row(params![hmap_source_id], |r| r.get(0))
            .context("exec count_hmap_references")?;
        Ok(n)
    }

    pub fn set_hmap_analysis(&self, id: i64, analysis: &HmapAnalysis, analyzed_at: i64) -> Result<()> {
        let b = analysis.bounds;
        self.conn()
            .prepare_cached(
                "UPDATE hmap_sources SET total_grids = ?2, segment_count = ?3, \
                 min_x = ?4, max_x = ?5, min_y = ?6, max_y = ?7, analyzed_at = ?8 WHERE id = ?1",
            )
            .context("prepare set_hmap_analysis")?
            .execute(params![
                id,
                analysis.total_grids,
                analysis.segment_count,
                b.map(|b| b.min_x),
                b.map(|b| b.max_x),
                b.map(|b| b.min_y),
                b.map(|b| b.max_y),
                analyzed_at,
            ])
            .context("exec set_hmap_analysis")?;
        Ok(())
    }

    // ---- tiles / grids / markers ----------------------------------------

    pub fn zoom0_tiles(&self, tenant_id: &str, map_id: i64) -> Result<Vec<SourceTileRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT coord_x, coord_y, file, cache FROM tiles \
                 WHERE tenant_id = ?1 AND map_id = ?2 AND zoom = 0",
            )
            .context("prepare zoom0_tiles")?;
        let rows = stmt
            .query_map(params![tenant_id, map_id], |r| Ok(SourceTileRow::from_row(r)))
            .context("exec zoom0_tiles")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// The 4x4 block of base tiles under one large tile.
    pub fn tiles_in_block(&self, tenant_id: &str, map_id: i64, block_x: i32, block_y: i32) -> Result<Vec<SourceTileRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT coord_x, coord_y, file, cache FROM tiles \
                 WHERE tenant_id = ?1 AND map_id = ?2 AND zoom = 0 \
                 AND coord_x BETWEEN ?3 AND ?4 AND coord_y BETWEEN ?5 AND ?6",
            )
            .context("prepare tiles_in_block")?;
        let (x0, y0) = (block_x * 4, block_y * 4);
        let rows = stmt
            .query_map(params![tenant_id, map_id, x0, x0 + 3, y0, y0 + 3], |r| {
                Ok(SourceTileRow::from_row(r))
            })
            .context("exec tiles_in_block")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn count_zoom0_tiles(&self, tenant_id: &str, map_id: i64) -> Result<i64> {
        let n: i64 = self
            .conn()
            .prepare_cached("SELECT COUNT(*) FROM tiles WHERE tenant_id = ?1 AND map_id = ?2 AND zoom = 0")
            .context("prepare count_zoom0_tiles")?
            .query_row(params![tenant_id, map_id], |r| r.get(0))
            .context("exec count_zoom0_tiles")?;
        Ok(n)
    }

    pub fn grids_for(&self, tenant_id: &str, map_id: i64) -> Result<Vec<SourceGridRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT id, coord_x, coord_y FROM grids WHERE tenant_id = ?1 AND map_id = ?2",
            )
            .context("prepare grids_for")?;
        let rows = stmt
            .query_map(params![tenant_id, map_id], |r| Ok(SourceGridRow::from_row(r)))
            .context("exec grids_for")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Visible thingwall markers for one tenant.
    pub fn thingwall_markers(&self, tenant_id: &str) -> Result<Vec<MarkerRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT id, grid_id, position_x, position_y, image, name FROM markers \
                 WHERE tenant_id = ?1 AND image LIKE '%thingwall%' AND hidden = 0",
            )
            .context("prepare thingwall_markers")?;
        let rows = stmt
            .query_map(params![tenant_id], |r| Ok(MarkerRow::from_row(r)))
            .context("exec thingwall_markers")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_active_tenants(&self) -> Result<Vec<TenantRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT id, name, active FROM tenants WHERE active = 1 ORDER BY id")
            .context("prepare list_active_tenants")?;
        let rows = stmt
            .query_map([], |r| Ok(TenantRow::from_row(r)))
            .context("exec list_active_tenants")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_tenant_maps(&self, tenant_id: &str) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT DISTINCT map_id FROM tiles WHERE tenant_id = ?1 AND zoom = 0 ORDER BY map_id",
            )
            .context("prepare list_tenant_maps")?;
        let rows = stmt
            .query_map(params![tenant_id], |r| r.get::<_, i64>(0))
            .context("exec list_tenant_maps")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- upload-side seeding (used by the intake paths and tests) --------

    pub fn upsert_tenant(&self, tenant: &TenantRow) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO tenants (id, name, active) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET name = ?2, active = ?3",
            )
            .context("prepare upsert_tenant")?
            .execute(params![tenant.id, tenant.name, tenant.active as i64])
            .context("exec upsert_tenant")?;
        Ok(())
    }

    pub fn upsert_tile(
        &self,
        tenant_id: &str,
        map_id: i64,
        coord_x: i32,
        coord_y: i32,
        file: &str,
        cache: i64,
    ) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO tiles (tenant_id, map_id, zoom, coord_x, coord_y, file, cache) \
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(tenant_id, map_id, zoom, coord_x, coord_y) \
                 DO UPDATE SET file = ?5, cache = ?6",
            )
            .context("prepare upsert_tile")?
            .execute(params![tenant_id, map_id, coord_x, coord_y, file, cache])
            .context("exec upsert_tile")?;
        Ok(())
    }

    pub fn upsert_grid(&self, tenant_id: &str, map_id: i64, grid_id: &str, coord_x: i32, coord_y: i32) -> Result<()> {
        self.conn()
            .prepare_cached(
                "INSERT INTO grids (id, tenant_id, map_id, coord_x, coord_y) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(tenant_id, map_id, id) DO UPDATE SET coord_x = ?4, coord_y = ?5",
            )
            .context("prepare upsert_grid")?
            .execute(params![grid_id, tenant_id, map_id, coord_x, coord_y])
            .context("exec upsert_grid")?;
        Ok(())
    }

    pub fn insert_marker(
        &self,
        tenant_id: &str,
        grid_id: &str,
        position_x: i32,
        position_y: i32,
        image: &str,
        name: &str,
        hidden: bool,
    ) -> Result<i64> {
        self.conn()
            .prepare_cached(
                "INSERT INTO markers (tenant_id, grid_id, position_x, position_y, image, name, hidden) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .context("prepare insert_marker")?
            .execute(params![tenant_id, grid_id, position_x, position_y, image, name, hidden as i64])
            .context("exec insert_marker")?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Status snapshot consumed by generation gates.
    pub fn generation_status(&self, id: &str) -> Result<Option<GenerationStatus>> {
        let status: Option<String> = self
            .conn()
            .prepare_cached("SELECT generation_status FROM public_maps WHERE id = ?1")
            .context("prepare generation_status")?
            .query_row(params![id], |r| r.get(0))
            .optional()
            .context("exec generation_status")?;
        Ok(status.and_then(|s| GenerationStatus::parse(&s)))
    }
}
