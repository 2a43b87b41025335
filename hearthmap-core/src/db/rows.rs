use rusqlite::Row;

use crate::models::GenerationStatus;

#[derive(Debug, Clone)]
pub struct PublicMapRow {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: i64,
    pub created_by: String,
    pub auto_regenerate: bool,
    pub regenerate_interval_minutes: Option<i64>,
    pub generation_status: GenerationStatus,
    pub generation_progress: i64,
    pub tile_count: i64,
    pub last_generated_at: Option<i64>,
    pub last_generation_duration_seconds: Option<i64>,
    pub generation_error: Option<String>,
    pub min_x: Option<i32>,
    pub max_x: Option<i32>,
    pub min_y: Option<i32>,
    pub max_y: Option<i32>,
}

impl PublicMapRow {
    pub(crate) fn from_row(r: &Row<'_>) -> Self {
        let status: String = r.get::<_, Option<String>>(7).ok().flatten().unwrap_or_default();
        Self {
            id: r.get(0).unwrap_or_default(),
            name: r.get(1).unwrap_or_default(),
            is_active: r.get::<_, i64>(2).unwrap_or_default() != 0,
            created_at: r.get(3).unwrap_or_default(),
            created_by: r.get(4).unwrap_or_default(),
            auto_regenerate: r.get::<_, i64>(5).unwrap_or_default() != 0,
            regenerate_interval_minutes: r.get(6).ok(),
            generation_status: GenerationStatus::parse(&status).unwrap_or(GenerationStatus::Pending),
            generation_progress: r.get(8).unwrap_or_default(),
            tile_count: r.get(9).unwrap_or_default(),
            last_generated_at: r.get(10).ok(),
            last_generation_duration_seconds: r.get(11).ok(),
            generation_error: r.get(12).ok(),
            min_x: r.get(13).ok(),
            max_x: r.get(14).ok(),
            min_y: r.get(15).ok(),
            max_y: r.get(16).ok(),
        }
    }
}

pub(crate) const PUBLIC_MAP_COLUMNS: &str = "id, name, is_active, created_at, created_by, \
     auto_regenerate, regenerate_interval_minutes, generation_status, generation_progress, \
     tile_count, last_generated_at, last_generation_duration_seconds, generation_error, \
     min_x, max_x, min_y, max_y";

#[derive(Debug, Clone)]
pub struct TenantSourceRow {
    pub public_map_id: String,
    pub tenant_id: String,
    pub map_id: i64,
    pub priority: i64,
    pub added_at: i64,
    pub added_by: String,
}

impl TenantSourceRow {
    pub(crate) fn from_row(r: &Row<'_>) -> Self {
        Self {
            public_map_id: r.get(0).unwrap_or_default(),
            tenant_id: r.get(1).unwrap_or_default(),
            map_id: r.get(2).unwrap_or_default(),
            priority: r.get(3).unwrap_or_default(),
            added_at: r.get(4).unwrap_or_default(),
            added_by: r.get(5).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HmapLinkRow {
    pub public_map_id: String,
    pub hmap_source_id: i64,
    pub priority: i64,
    pub added_at: i64,
    pub new_grids: Option<i64>,
    pub overlapping_grids: Option<i64>,
}

impl HmapLinkRow {
    pub(crate) fn from_row(r: &Row<'_>) -> Self {
        Self {
            public_map_id: r.get(0).unwrap_or_default(),
            hmap_source_id: r.get(1).unwrap_or_default(),
            priority: r.get(2).unwrap_or_default(),
            added_at: r.get(3).unwrap_or_default(),
            new_grids: r.get(4).ok(),
            overlapping_grids: r.get(5).ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HmapSourceRow {
    pub id: i64,
    pub name: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size_bytes: i64,
    pub total_grids: Option<i64>,
    pub segment_count: Option<i64>,
    pub min_x: Option<i32>,
    pub max_x: Option<i32>,
    pub min_y: Option<i32>,
    pub max_y: Option<i32>,
    pub analyzed_at: Option<i64>,
    pub created_at: i64,
}

impl HmapSourceRow {
    pub(crate) fn from_row(r: &Row<'_>) -> Self {
        Self {
            id: r.get(0).unwrap_or_default(),
            name: r.get(1).unwrap_or_default(),
            file_name: r.get(2).unwrap_or_default(),
            file_path: r.get(3).unwrap_or_default(),
            file_size_bytes: r.get(4).unwrap_or_default(),
            total_grids: r.get(5).ok(),
            segment_count: r.get(6).ok(),
            min_x: r.get(7).ok(),
            max_x: r.get(8).ok(),
            min_y: r.get(9).ok(),
            max_y: r.get(10).ok(),
            analyzed_at: r.get(11).ok(),
            created_at: r.get(12).unwrap_or_default(),
        }
    }
}

pub(crate) const HMAP_SOURCE_COLUMNS: &str = "id, name, file_name, file_path, file_size_bytes, \
     total_grids, segment_count, min_x, max_x, min_y, max_y, analyzed_at, created_at";

/// A zoom-0 catalog tile: where the uploaded 100x100 image lives on disk and
/// the monotonic counter used for overlap tie-breaking.
#[derive(Debug, Clone)]
pub struct SourceTileRow {
    pub coord_x: i32,
    pub coord_y: i32,
    pub file: String,
    pub cache: i64,
}

impl SourceTileRow {
    pub(crate) fn from_row(r: &Row<'_>) -> Self {
        Self {
            coord_x: r.get(0).unwrap_or_default(),
            coord_y: r.get(1).unwrap_or_default(),
            file: r.get(2).unwrap_or_default(),
            cache: r.get(3).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceGridRow {
    pub grid_id: String,
    pub coord_x: i32,
    pub coord_y: i32,
}

impl SourceGridRow {
    pub(crate) fn from_row(r: &Row<'_>) -> Self {
        Self {
            grid_id: r.get(0).unwrap_or_default(),
            coord_x: r.get(1).unwrap_or_default(),
            coord_y: r.get(2).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarkerRow {
    pub id: i64,
    pub grid_id: String,
    pub position_x: i32,
    pub position_y: i32,
    pub image: String,
    pub name: String,
}

impl MarkerRow {
    pub(crate) fn from_row(r: &Row<'_>) -> Self {
        Self {
            id: r.get(0).unwrap_or_default(),
            grid_id: r.get(1).unwrap_or_default(),
            position_x: r.get(2).unwrap_or_default(),
            position_y: r.get(3).unwrap_or_default(),
            image: r.get(4).unwrap_or_default(),
            name: r.get(5).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantRow {
    pub id: String,
    pub name: String,
    pub active: bool,
}

impl TenantRow {
    pub(crate) fn from_row(r: &Row<'_>) -> Self {
        Self {
            id: r.get(0).unwrap_or_default(),
            name: r.get(1).unwrap_or_default(),
            active: r.get::<_, i64>(2).unwrap_or_default() != 0,
        }
    }
}
