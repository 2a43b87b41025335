//! Catalog access. One `Catalog` wraps one SQLite connection; handles are
//! cheap to open and are scoped per operation — a connection is never shared
//! across tasks.

mod queries;
mod rows;

pub use rows::{
    HmapLinkRow, HmapSourceRow, MarkerRow, PublicMapRow, SourceGridRow, SourceTileRow,
    TenantRow, TenantSourceRow,
};

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open catalog database")?;
        let _ = conn.pragma_update(None, "foreign_keys", 1i32);
        let _ = conn.pragma_update(None, "busy_timeout", 5_000i32);
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(SCHEMA).context("failed to apply catalog schema")?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tenants (
    id      TEXT PRIMARY KEY,
    name    TEXT NOT NULL DEFAULT '',
    active  INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS tiles (
    tenant_id TEXT NOT NULL,
    map_id    INTEGER NOT NULL,
    zoom      INTEGER NOT NULL,
    coord_x   INTEGER NOT NULL,
    coord_y   INTEGER NOT NULL,
    file      TEXT NOT NULL,
    cache     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tenant_id, map_id, zoom, coord_x, coord_y)
);

CREATE TABLE IF NOT EXISTS grids (
    id        TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    map_id    INTEGER NOT NULL,
    coord_x   INTEGER NOT NULL,
    coord_y   INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, map_id, id)
);

CREATE TABLE IF NOT EXISTS markers (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id  TEXT NOT NULL,
    grid_id    TEXT NOT NULL,
    position_x INTEGER NOT NULL,
    position_y INTEGER NOT NULL,
    image      TEXT NOT NULL,
    name       TEXT NOT NULL,
    hidden     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS public_maps (
    id                               TEXT PRIMARY KEY,
    name                             TEXT NOT NULL,
    is_active                        INTEGER NOT NULL DEFAULT 1,
    created_at                       INTEGER NOT NULL,
    created_by                       TEXT NOT NULL,
    auto_regenerate                  INTEGER NOT NULL DEFAULT 0,
    regenerate_interval_minutes      INTEGER,
    generation_status                TEXT NOT NULL DEFAULT 'pending',
    generation_progress              INTEGER NOT NULL DEFAULT 0,
    tile_count                       INTEGER NOT NULL DEFAULT 0,
    last_generated_at                INTEGER,
    last_generation_duration_seconds INTEGER,
    generation_error                 TEXT,
    min_x INTEGER, max_x INTEGER, min_y INTEGER, max_y INTEGER
);

CREATE TABLE IF NOT EXISTS public_map_sources (
    public_map_id TEXT NOT NULL,
    tenant_id     TEXT NOT NULL,
    map_id        INTEGER NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    added_at      INTEGER NOT NULL,
    added_by      TEXT NOT NULL,
    PRIMARY KEY (public_map_id, tenant_id, map_id)
);

CREATE TABLE IF NOT EXISTS public_map_hmap_sources (
    public_map_id     TEXT NOT NULL,
    hmap_source_id    INTEGER NOT NULL,
    priority          INTEGER NOT NULL DEFAULT 0,
    added_at          INTEGER NOT NULL,
    new_grids         INTEGER,
    overlapping_grids INTEGER,
    PRIMARY KEY (public_map_id, hmap_source_id)
);

CREATE TABLE IF NOT EXISTS hmap_sources (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    file_name       TEXT NOT NULL,
    file_path       TEXT NOT NULL,
    file_size_bytes INTEGER NOT NULL,
    total_grids     INTEGER,
    segment_count   INTEGER,
    min_x INTEGER, max_x INTEGER, min_y INTEGER, max_y INTEGER,
    analyzed_at     INTEGER,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tiles_lookup ON tiles (tenant_id, map_id, zoom);
CREATE INDEX IF NOT EXISTS idx_markers_tenant ON markers (tenant_id);
";
