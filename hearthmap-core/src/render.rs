//! Rasterise one decoded grid into a 100x100 RGBA image.
//!
//! Three passes, in order: texture sampling, cliff shading, tile-priority
//! borders. Borders run last so they overwrite shaded pixels.

use std::collections::HashMap;

use image::{Rgba, RgbaImage};

use crate::hmap::{HmapGrid, GRID_EDGE};

/// Height delta beyond which adjacent cells are considered a cliff.
pub const CLIFF_DELTA: f32 = 11.0;

/// Blend factor toward black applied to cliff pixels.
pub const CLIFF_SHADE: f32 = 0.6;

/// Fill for cells whose tileset has no resolved texture.
pub const MISSING_FILL: Rgba<u8> = Rgba([128, 128, 128, 255]);

const BORDER: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Render `grid` using `textures` keyed by tileset resource name. Missing
/// textures fall back to a neutral grey fill; rendering never fails.
pub fn render_grid(grid: &HmapGrid, textures: &HashMap<String, RgbaImage>) -> RgbaImage {
    let edge = GRID_EDGE as u32;
    let mut out = RgbaImage::new(edge, edge);

    for y in 0..GRID_EDGE {
        for x in 0..GRID_EDGE {
            let px = match grid.tileset_at(x, y).and_then(|name| textures.get(name)) {
                Some(tex) => sample(tex, x, y),
                None => MISSING_FILL,
            };
            out.put_pixel(x as u32, y as u32, px);
        }
    }

    shade_cliffs(grid, &mut out);
    draw_priority_borders(grid, &mut out);
    out
}

fn sample(tex: &RgbaImage, x: usize, y: usize) -> Rgba<u8> {
    let tx = (x as u32) % tex.width();
    let ty = (y as u32) % tex.height();
    *tex.get_pixel(tx, ty)
}

fn shade_cliffs(grid: &HmapGrid, out: &mut RgbaImage) {
    let keep = 1.0 - CLIFF_SHADE;
    for y in 1..GRID_EDGE - 1 {
        for x in 1..GRID_EDGE - 1 {
            let z = grid.z_at(x, y);
            let broken = [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)]
                .into_iter()
                .any(|(nx, ny)| (z - grid.z_at(nx, ny)).abs() > CLIFF_DELTA);
            if broken {
                let px = out.get_pixel_mut(x as u32, y as u32);
                for c in &mut px.0[..3] {
                    *c = (*c as f32 * keep) as u8;
                }
            }
        }
    }
}

fn draw_priority_borders(grid: &HmapGrid, out: &mut RgbaImage) {
    let edge = GRID_EDGE as i32;
    for y in 0..edge {
        for x in 0..edge {
            let here = grid.tile_index_at(x as usize, y as usize);
            let higher = [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)]
                .into_iter()
                .filter(|&(nx, ny)| nx >= 0 && ny >= 0 && nx < edge && ny < edge)
                .any(|(nx, ny)| grid.tile_index_at(nx as usize, ny as usize) > here);
            if higher {
                out.put_pixel(x as u32, y as u32, BORDER);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmap::GRID_TILES;

    fn flat_grid(index: u8, tilesets: &[&str]) -> HmapGrid {
        HmapGrid {
            segment_id: 1,
            tile_x: 0,
            tile_y: 0,
            tile_indices: vec![index; GRID_TILES],
            z_map: vec![0.0; GRID_TILES],
            tilesets: tilesets.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn checkerboard(side: u32) -> RgbaImage {
        RgbaImage::from_fn(side, side, |x, y| {
            if (x + y) % 2 == 0 { Rgba([255, 255, 255, 255]) } else { Rgba([0, 0, 255, 255]) }
        })
    }

    #[test]
    fn uniform_grid_samples_with_wrapping() {
        let grid = flat_grid(0, &["gfx/tiles/checker"]);
        let mut textures = HashMap::new();
        textures.insert("gfx/tiles/checker".to_string(), checkerboard(16));
        let img = render_grid(&grid, &textures);
        for (x, y) in [(0usize, 0usize), (15, 3), (17, 1), (99, 99)] {
            let expected = *checkerboard(16).get_pixel(x as u32 % 16, y as u32 % 16);
            assert_eq!(*img.get_pixel(x as u32, y as u32), expected, "pixel ({x},{y})");
        }
    }

    #[test]
    fn missing_texture_fills_grey() {
        let grid = flat_grid(0, &["gfx/tiles/unknown"]);
        let img = render_grid(&grid, &HashMap::new());
        assert_eq!(*img.get_pixel(50, 50), MISSING_FILL);
    }

    #[test]
    fn cliff_shading_darkens_interior_pixels() {
        let mut grid = flat_grid(0, &["gfx/tiles/unknown"]);
        // column x == 50 raised well past the cliff threshold
        for y in 0..GRID_EDGE {
            grid.z_map[y * GRID_EDGE + 50] = 50.0;
        }
        let img = render_grid(&grid, &HashMap::new());
        let shaded = *img.get_pixel(50, 50);
        assert_eq!(shaded, Rgba([51, 51, 51, 255]), "128 * 0.4 rounds down to 51");
        // far from the cliff stays untouched
        assert_eq!(*img.get_pixel(10, 50), MISSING_FILL);
    }

    #[test]
    fn priority_borders_overwrite_with_black() {
        let mut grid = flat_grid(0, &["gfx/tiles/a", "gfx/tiles/b"]);
        // one high-priority cell; its 4-neighbours get the border
        grid.tile_indices[50 * GRID_EDGE + 50] = 1;
        let img = render_grid(&grid, &HashMap::new());
        assert_eq!(*img.get_pixel(49, 50), Rgba([0, 0, 0, 255]));
        assert_eq!(*img.get_pixel(50, 49), Rgba([0, 0, 0, 255]));
        // the high cell itself has no greater neighbour
        assert_eq!(*img.get_pixel(50, 50), MISSING_FILL);
        // unrelated pixels untouched
        assert_eq!(*img.get_pixel(10, 10), MISSING_FILL);
    }
}
