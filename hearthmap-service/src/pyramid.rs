//! Zoom levels 1..6, built bottom-up from the previous level's written tiles
//! by 2x2 downsampling.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::debug;

use crate::codec::{encode_webp, read_webp_tile, write_tile, QUAD_PX, TILE_PX};

/// Highest generated zoom level (inclusive).
pub const MAX_ZOOM: u8 = 6;

/// Pack up to four child tiles into a parent canvas. Children are indexed
/// `[dqy * 2 + dqx]`; each is resized to a 200x200 quadrant. `None` when no
/// child is present.
pub fn compose_parent(children: [Option<RgbaImage>; 4], filter: FilterType) -> Option<RgbaImage> {
    let mut canvas: Option<RgbaImage> = None;
    for (i, child) in children.into_iter().enumerate() {
        let Some(child) = child else { continue };
        let (dqx, dqy) = ((i % 2) as i64, (i / 2) as i64);
        let scaled = imageops::resize(&child, QUAD_PX, QUAD_PX, filter);
        let canvas = canvas.get_or_insert_with(|| RgbaImage::new(TILE_PX, TILE_PX));
        imageops::replace(canvas, &scaled, dqx * QUAD_PX as i64, dqy * QUAD_PX as i64);
    }
    canvas
}

/// Build zooms 1..=MAX_ZOOM under `out_dir` from the zoom-0 coordinate set.
/// Progress covers `progress_range`, split evenly across the six levels.
/// Returns the number of tiles written above zoom 0.
pub fn build_pyramid(
    out_dir: &Path,
    zoom0: &BTreeSet<(i32, i32)>,
    quality: f32,
    filter: FilterType,
    progress_range: (i64, i64),
    progress: &mut dyn FnMut(i64),
) -> Result<usize> {
    let (lo, hi) = progress_range;
    let mut children = zoom0.clone();
    let mut total_written = 0usize;

    for z in 1..=MAX_ZOOM {
        let parents: BTreeSet<(i32, i32)> =
            children.iter().map(|&(x, y)| hearthmap_core::parent(x, y)).collect();
        let mut written = BTreeSet::new();

        for &(px, py) in &parents {
            let mut quads: [Option<RgbaImage>; 4] = [None, None, None, None];
            for dqy in 0..2i32 {
                for dqx in 0..2i32 {
                    let child = out_dir
                        .join((z - 1).to_string())
                        .join(format!("{}_{}.webp", 2 * px + dqx, 2 * py + dqy));
                    quads[(dqy * 2 + dqx) as usize] = read_webp_tile(&child)?;
                }
            }
            if let Some(img) = compose_parent(quads, filter) {
                let bytes = encode_webp(&img, quality)?;
                write_tile(&out_dir.join(z.to_string()).join(format!("{px}_{py}.webp")), &bytes)?;
                written.insert((px, py));
            }
        }

        debug!(zoom = z, tiles = written.len(), "pyramid level done");
        total_written += written.len();
        progress(lo + (z as i64) * (hi - lo) / MAX_ZOOM as i64);
        if written.is_empty() {
            break;
        }
        children = written;
    }
    Ok(total_written)
}
