//! The unified-coordinate dictionary the composer consumes.
//!
//! Cells come from one of two source kinds: catalog base tiles on disk
//! (tenant path) or decoded world-snapshot grids rendered at compose time
//! (hmap path). Exactly one kind feeds a given run.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::Result;
use hearthmap_core::db::TenantSourceRow;
use hearthmap_core::hmap::{HmapData, HmapGrid, HmapMarker};
use hearthmap_core::render::render_grid;
use hearthmap_core::{block_parent, Bounds, Catalog};
use image::RgbaImage;
use tracing::warn;

use crate::align::SourceKey;
use crate::codec::load_base_tile;

/// One 100x100 cell of the unified space.
pub enum SourceCell {
    /// A tenant-uploaded base tile, loaded from grid storage on demand.
    BaseTile { file: PathBuf, cache: i64 },
    /// A decoded snapshot grid, rasterised on demand.
    Grid(Box<HmapGrid>),
}

impl SourceCell {
    /// Resolve the cell to pixels. `None` when the backing file is missing
    /// or undecodable; the composer skips such cells.
    pub fn load(&self, textures: &HashMap<String, RgbaImage>) -> Option<RgbaImage> {
        match self {
            SourceCell::BaseTile { file, .. } => match load_base_tile(file) {
                Ok(img) => Some(img),
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "skipping unreadable base tile");
                    None
                }
            },
            SourceCell::Grid(grid) => Some(render_grid(grid, textures)),
        }
    }
}

pub type CellMap = HashMap<(i32, i32), SourceCell>;

/// Merge all tenant sources into unified space. Overlaps keep the entry with
/// the greatest cache timestamp; on equal timestamps the earlier source in
/// composition order stays.
pub fn tenant_cells(
    catalog: &Catalog,
    grid_storage: &std::path::Path,
    sources: &[TenantSourceRow],
    offsets: &HashMap<SourceKey, (i32, i32)>,
) -> Result<CellMap> {
    let mut cells: HashMap<(i32, i32), (PathBuf, i64)> = HashMap::new();
    for source in sources {
        let key = (source.tenant_id.clone(), source.map_id);
        let (dx, dy) = offsets.get(&key).copied().unwrap_or((0, 0));
        for tile in catalog.zoom0_tiles(&source.tenant_id, source.map_id)? {
            let unified = (tile.coord_x + dx, tile.coord_y + dy);
            let candidate = (grid_storage.join(&tile.file), tile.cache);
            match cells.get(&unified) {
                Some((_, existing)) if *existing >= tile.cache => {}
                _ => {
                    cells.insert(unified, candidate);
                }
            }
        }
    }
    Ok(cells
        .into_iter()
        .map(|(coord, (file, cache))| (coord, SourceCell::BaseTile { file, cache }))
        .collect())
}

/// Merge decoded snapshots in priority order: the first source to claim a
/// grid coordinate keeps it. Markers come back alongside, in the same
/// priority order, for the extractor.
pub fn hmap_cells(datas: Vec<HmapData>) -> (CellMap, Vec<HmapMarker>) {
    let mut cells: CellMap = HashMap::new();
    let mut markers = Vec::new();
    for data in datas {
        for grid in data.grids {
            let coord = (grid.tile_x, grid.tile_y);
            cells.entry(coord).or_insert_with(|| SourceCell::Grid(Box::new(grid)));
        }
        markers.extend(data.markers);
    }
    (cells, markers)
}

/// Inclusive unified bounds over all cells; `None` when empty.
pub fn cell_bounds(cells: &CellMap) -> Option<Bounds> {
    Bounds::collect(cells.keys().copied())
}

/// Output-tile coordinates covering the cells, in deterministic order.
pub fn output_tiles(cells: &CellMap) -> BTreeSet<(i32, i32)> {
    cells.keys().map(|&(x, y)| block_parent(x, y)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthmap_core::hmap::GRID_TILES;

    fn grid_at(x: i32, y: i32) -> HmapGrid {
        HmapGrid {
            segment_id: 0,
            tile_x: x,
            tile_y: y,
            tile_indices: vec![0; GRID_TILES],
            z_map: vec![0.0; GRID_TILES],
            tilesets: vec![],
        }
    }

    #[test]
    fn hmap_claims_are_first_wins() {
        let high = HmapData { grids: vec![grid_at(0, 0), grid_at(1, 0)], markers: vec![] };
        let mut low_grid = grid_at(0, 0);
        low_grid.segment_id = 99;
        let low = HmapData { grids: vec![low_grid, grid_at(2, 0)], markers: vec![] };

        let (cells, _) = hmap_cells(vec![high, low]);
        assert_eq!(cells.len(), 3);
        match &cells[&(0, 0)] {
            SourceCell::Grid(g) => assert_eq!(g.segment_id, 0, "higher priority source keeps the claim"),
            _ => panic!("expected grid cell"),
        }
    }

    #[test]
    fn output_tiles_group_by_four() {
        let mut cells: CellMap = HashMap::new();
        for coord in [(0, 0), (3, 3), (4, 0), (-1, -1)] {
            cells.insert(coord, SourceCell::Grid(Box::new(grid_at(coord.0, coord.1))));
        }
        let tiles: Vec<_> = output_tiles(&cells).into_iter().collect();
        assert_eq!(tiles, vec![(-1, -1), (0, 0), (1, 0)]);
        let b = cell_bounds(&cells).unwrap();
        assert_eq!((b.min_x, b.max_x, b.min_y, b.max_y), (-1, 4, -1, 3));
    }
}
