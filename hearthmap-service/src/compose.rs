//! Zoom-0 composition: pack 4x4 blocks of 100x100 cells into 400x400 WebP
//! tiles under `{output}/0/`.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Result;
use image::{imageops, RgbaImage};
use tracing::debug;

use crate::codec::{encode_webp, write_tile, BASE_PX, TILE_PX};
use crate::sources::{output_tiles, CellMap};

/// Compose a single output tile. `None` when no cell in the 4x4 block
/// produced pixels; such tiles are not written.
pub fn compose_tile(
    cells: &CellMap,
    textures: &HashMap<String, RgbaImage>,
    tx: i32,
    ty: i32,
) -> Option<RgbaImage> {
    let mut canvas: Option<RgbaImage> = None;
    for dy in 0..4i32 {
        for dx in 0..4i32 {
            let Some(cell) = cells.get(&(4 * tx + dx, 4 * ty + dy)) else { continue };
            let Some(img) = cell.load(textures) else { continue };
            let canvas = canvas.get_or_insert_with(|| RgbaImage::new(TILE_PX, TILE_PX));
            imageops::replace(canvas, &img, (dx * BASE_PX as i32) as i64, (dy * BASE_PX as i32) as i64);
        }
    }
    canvas
}

/// Compose every covered output tile, reporting progress through
/// `progress_range` in steps of at least five percent. Returns the set of
/// coordinates actually written.
pub fn compose_zoom0(
    cells: &CellMap,
    textures: &HashMap<String, RgbaImage>,
    out_dir: &Path,
    quality: f32,
    progress_range: (i64, i64),
    progress: &mut dyn FnMut(i64),
) -> Result<BTreeSet<(i32, i32)>> {
    let coords = output_tiles(cells);
    let total = coords.len();
    let (lo, hi) = progress_range;
    let mut written = BTreeSet::new();
    let mut last_reported = lo;

    for (done, &(tx, ty)) in coords.iter().enumerate() {
        if let Some(img) = compose_tile(cells, textures, tx, ty) {
            let bytes = encode_webp(&img, quality)?;
            write_tile(&out_dir.join("0").join(format!("{tx}_{ty}.webp")), &bytes)?;
            written.insert((tx, ty));
        } else {
            debug!(tx, ty, "no cell contributed; tile omitted");
        }
        let pct = lo + ((done + 1) as i64) * (hi - lo) / (total.max(1) as i64);
        if pct >= last_reported + 5 || done + 1 == total {
            progress(pct);
            last_reported = pct;
        }
    }
    Ok(written)
}
