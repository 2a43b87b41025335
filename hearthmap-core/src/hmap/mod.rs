//! `Haven Mapfile 1` world snapshots: per-grid tile indices, heightmap and
//! tileset tables, plus an embedded marker section.

mod reader;

pub use reader::{analyze_file, decode_bytes, decode_file, HmapError};

use crate::coords::Bounds;

/// 15-byte ASCII signature at the start of every mapfile.
pub const HMAP_MAGIC: &[u8; 15] = b"Haven Mapfile 1";

/// Tiles per grid edge; grids are square.
pub const GRID_EDGE: usize = 100;

/// Cells in one grid (tile index and z-map entry count).
pub const GRID_TILES: usize = GRID_EDGE * GRID_EDGE;

/// Marker kind tag for surface markers.
pub const MARKER_KIND_SURFACE: u8 = b'S';

/// One decoded 100x100 grid.
#[derive(Debug, Clone)]
pub struct HmapGrid {
    pub segment_id: i64,
    pub tile_x: i32,
    pub tile_y: i32,
    /// Indices into `tilesets`, row-major, `GRID_TILES` entries.
    pub tile_indices: Vec<u8>,
    /// Heights, row-major, `GRID_TILES` entries.
    pub z_map: Vec<f32>,
    /// Texture resource names referenced by `tile_indices`.
    pub tilesets: Vec<String>,
}

impl HmapGrid {
    pub fn tile_index_at(&self, x: usize, y: usize) -> u8 {
        self.tile_indices[y * GRID_EDGE + x]
    }

    pub fn z_at(&self, x: usize, y: usize) -> f32 {
        self.z_map[y * GRID_EDGE + x]
    }

    pub fn tileset_at(&self, x: usize, y: usize) -> Option<&str> {
        self.tilesets.get(self.tile_index_at(x, y) as usize).map(String::as_str)
    }
}

/// A surface marker carried in the mapfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmapMarker {
    pub object_id: u64,
    pub tile_x: i32,
    pub tile_y: i32,
    pub name: String,
    pub resource_name: String,
}

/// Everything decoded from one mapfile.
#[derive(Debug, Clone, Default)]
pub struct HmapData {
    pub grids: Vec<HmapGrid>,
    pub markers: Vec<HmapMarker>,
}

/// Structural summary persisted after upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HmapAnalysis {
    pub total_grids: i64,
    pub segment_count: i64,
    pub bounds: Option<Bounds>,
}

impl HmapData {
    /// Distinct texture resource names across every grid, for prefetching.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .grids
            .iter()
            .flat_map(|g| g.tilesets.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn analysis(&self) -> HmapAnalysis {
        let mut segments: Vec<i64> = self.grids.iter().map(|g| g.segment_id).collect();
        segments.sort_unstable();
        segments.dedup();
        HmapAnalysis {
            total_grids: self.grids.len() as i64,
            segment_count: segments.len() as i64,
            bounds: Bounds::collect(self.grids.iter().map(|g| (g.tile_x, g.tile_y))),
        }
    }
}
