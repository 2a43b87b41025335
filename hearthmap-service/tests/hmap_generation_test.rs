//! End-to-end generation from an uploaded world snapshot.

use byteorder::{LittleEndian, WriteBytesExt};
use hearthmap_core::hmap::{GRID_TILES, HMAP_MAGIC};
use hearthmap_core::models::GenerationStatus;
use hearthmap_core::Catalog;
use hearthmap_service::{AppState, Config, PublicMapService};
use image::{Rgba, RgbaImage};
use std::io::Write;

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_i32::<LittleEndian>(s.len() as i32).unwrap();
    buf.write_all(s.as_bytes()).unwrap();
}

/// One segment, one flat grid at (0,0) referencing a single tileset, plus
/// one thingwall surface marker.
fn snapshot_bytes(tileset: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(HMAP_MAGIC);
    buf.write_i32::<LittleEndian>(1).unwrap();
    buf.write_i64::<LittleEndian>(7).unwrap();
    buf.write_i32::<LittleEndian>(1).unwrap();
    buf.write_i32::<LittleEndian>(0).unwrap(); // tile x
    buf.write_i32::<LittleEndian>(0).unwrap(); // tile y
    buf.write_i32::<LittleEndian>(1).unwrap();
    push_string(&mut buf, tileset);
    buf.extend(std::iter::repeat(0u8).take(GRID_TILES));
    for _ in 0..GRID_TILES {
        buf.write_f32::<LittleEndian>(0.0).unwrap();
    }
    // marker section
    buf.write_i32::<LittleEndian>(1).unwrap();
    let mut rec = Vec::new();
    rec.push(b'S');
    rec.write_u64::<LittleEndian>(31).unwrap();
    rec.write_i32::<LittleEndian>(250).unwrap();
    rec.write_i32::<LittleEndian>(-30).unwrap();
    push_string(&mut rec, "Odd stone");
    push_string(&mut rec, "gfx/terobjs/mm/thingwall");
    buf.write_i32::<LittleEndian>(rec.len() as i32).unwrap();
    buf.extend(rec);
    buf
}

/// 16x16 texture: left 8 columns white, right 8 columns blue. Wide bands
/// survive lossy encoding well enough for pixel assertions.
fn banded_texture() -> RgbaImage {
    RgbaImage::from_fn(16, 16, |x, _| {
        if x < 8 { Rgba([255, 255, 255, 255]) } else { Rgba([20, 20, 220, 255]) }
    })
}

#[tokio::test]
async fn snapshot_source_renders_through_texture_sampling() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::for_root(dir.path());
    let service = PublicMapService::new(cfg.clone());

    // pre-seed the texture disk cache so no network fetch happens
    let tex_path = cfg.texture_cache_dir().join("gfx_tiles_bands.png");
    std::fs::create_dir_all(tex_path.parent().unwrap()).unwrap();
    banded_texture().save(&tex_path).unwrap();

    let map = service.create_public_map("Snapshot Map", None, true, "op").unwrap();
    let source = service
        .save_hmap_source("world", "world.hmap", &snapshot_bytes("gfx/tiles/bands"))
        .unwrap();
    assert_eq!(source.total_grids, Some(1));
    assert_eq!(source.segment_count, Some(1));
    service.add_hmap_source_link(&map.id, source.id, 0).unwrap();

    let state = AppState::new(cfg.clone());
    state.orchestrator.start(&map.id).await.expect("run succeeds");

    let catalog = Catalog::open(&cfg.catalog_path).unwrap();
    let row = catalog.get_public_map(&map.id).unwrap().unwrap();
    assert_eq!(row.generation_status, GenerationStatus::Completed);
    assert_eq!((row.min_x, row.max_x, row.min_y, row.max_y), (Some(0), Some(0), Some(0), Some(0)));
    assert_eq!(row.tile_count, 1 + 6);

    let bytes = std::fs::read(cfg.public_tile(&map.id, 0, 0, 0)).unwrap();
    let img = webp::Decoder::new(&bytes).decode().unwrap().to_image().to_rgba8();
    assert_eq!((img.width(), img.height()), (400, 400));

    // the single grid fills the top-left 100x100 cell; texture repeats mod 16
    for (x, y, expected) in [(4u32, 4u32, [255u8, 255, 255]), (12, 4, [20, 20, 220]), (20, 4, [255, 255, 255])] {
        let px = *img.get_pixel(x, y);
        assert_eq!(px.0[3], 255);
        for c in 0..3 {
            assert!(
                (px.0[c] as i32 - expected[c] as i32).abs() <= 30,
                "pixel ({x},{y}) channel {c}: {:?} vs {expected:?}",
                px.0
            );
        }
    }
    assert_eq!(img.get_pixel(150, 150).0[3], 0, "cells outside the grid stay transparent");

    let markers: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(cfg.markers_path(&map.id)).unwrap()).unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0]["x"], 250);
    assert_eq!(markers[0]["y"], -30);
    assert_eq!(markers[0]["image"], "gfx/terobjs/mm/thingwall");
}

#[tokio::test]
async fn missing_texture_falls_back_to_grey() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::for_root(dir.path());
    let service = PublicMapService::new(cfg.clone());

    let map = service.create_public_map("Grey Map", None, true, "op").unwrap();
    let source = service
        .save_hmap_source("world", "world.hmap", &snapshot_bytes("gfx/tiles/nowhere"))
        .unwrap();
    service.add_hmap_source_link(&map.id, source.id, 0).unwrap();

    let state = AppState::new(cfg.clone());
    state.orchestrator.start(&map.id).await.expect("run succeeds");

    let bytes = std::fs::read(cfg.public_tile(&map.id, 0, 0, 0)).unwrap();
    let img = webp::Decoder::new(&bytes).decode().unwrap().to_image().to_rgba8();
    let px = *img.get_pixel(50, 50);
    for c in 0..3 {
        assert!((px.0[c] as i32 - 128).abs() <= 10, "{:?}", px.0);
    }
}
