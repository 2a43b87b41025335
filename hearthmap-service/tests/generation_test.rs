use hearthmap_core::models::GenerationStatus;
use hearthmap_core::Catalog;
use hearthmap_service::{AppState, Config};
use image::{Rgba, RgbaImage};

fn write_png(path: &std::path::Path, color: Rgba<u8>) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img = RgbaImage::from_pixel(100, 100, color);
    img.save(path).unwrap();
}

fn seed_map(catalog: &Catalog, id: &str) {
    catalog
        .insert_public_map(&hearthmap_core::db::PublicMapRow {
            id: id.to_string(),
            name: "Test Map".into(),
            is_active: true,
            created_at: 1,
            created_by: "op".into(),
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
        })
        .unwrap();
}

fn add_source(catalog: &Catalog, map: &str, tenant: &str, map_id: i64, priority: i64, added_at: i64) {
    catalog
        .insert_tenant_source(&hearthmap_core::db::TenantSourceRow {
            public_map_id: map.to_string(),
            tenant_id: tenant.to_string(),
            map_id,
            priority,
            added_at,
            added_by: "op".into(),
        })
        .unwrap();
}

fn assert_close(px: Rgba<u8>, expected: [u8; 3], tolerance: i32) {
    for c in 0..3 {
        let diff = (px.0[c] as i32 - expected[c] as i32).abs();
        assert!(diff <= tolerance, "channel {c}: {:?} vs {expected:?}", px.0);
    }
}

#[tokio::test]
async fn empty_public_map_completes_with_zero_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::for_root(dir.path());
    let catalog = Catalog::open(&cfg.catalog_path).unwrap();
    seed_map(&catalog, "test-map");

    let state = AppState::new(cfg.clone());
    state.orchestrator.start("test-map").await.expect("run succeeds");

    let row = catalog.get_public_map("test-map").unwrap().unwrap();
    assert_eq!(row.generation_status, GenerationStatus::Completed);
    assert_eq!(row.generation_progress, 100);
    assert_eq!(row.tile_count, 0);
    assert!(row.last_generated_at.is_some());
    assert!(row.min_x.is_none(), "bounds stay untouched");
    assert!(!cfg.public_dir("test-map").exists(), "no files created");
}

#[tokio::test]
async fn single_source_composes_one_tile_and_pyramid() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::for_root(dir.path());
    let catalog = Catalog::open(&cfg.catalog_path).unwrap();
    seed_map(&catalog, "m");
    add_source(&catalog, "m", "t", 1, 0, 1);

    write_png(&cfg.grid_file("grids/t/1/0_0.png"), Rgba([255, 0, 0, 255]));
    write_png(&cfg.grid_file("grids/t/1/1_0.png"), Rgba([0, 255, 0, 255]));
    catalog.upsert_tile("t", 1, 0, 0, "grids/t/1/0_0.png", 1).unwrap();
    catalog.upsert_tile("t", 1, 1, 0, "grids/t/1/1_0.png", 1).unwrap();

    let state = AppState::new(cfg.clone());
    state.orchestrator.start("m").await.expect("run succeeds");

    let tile_path = cfg.public_tile("m", 0, 0, 0);
    assert!(tile_path.exists());
    let bytes = std::fs::read(&tile_path).unwrap();
    assert_eq!(&bytes[0..4], b"RIFF");
    assert_eq!(&bytes[8..12], b"WEBP");

    let img = webp::Decoder::new(&bytes).decode().unwrap().to_image().to_rgba8();
    assert_eq!((img.width(), img.height()), (400, 400));
    assert_close(*img.get_pixel(0, 0), [255, 0, 0], 20);
    assert_close(*img.get_pixel(100, 0), [0, 255, 0], 20);
    assert_eq!(img.get_pixel(200, 0).0[3], 0, "uncovered cell stays transparent");

    let row = catalog.get_public_map("m").unwrap().unwrap();
    assert_eq!(row.generation_status, GenerationStatus::Completed);
    assert_eq!((row.min_x, row.max_x, row.min_y, row.max_y), (Some(0), Some(1), Some(0), Some(0)));
    // one zoom-0 tile plus one tile per pyramid level
    assert_eq!(row.tile_count, 1 + 6);
    for zoom in 1..=6u8 {
        assert!(cfg.public_tile("m", zoom, 0, 0).exists(), "zoom {zoom} parent");
    }
    assert!(cfg.markers_path("m").exists());
}

#[tokio::test]
async fn overlapping_sources_align_and_tie_break_on_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::for_root(dir.path());
    let catalog = Catalog::open(&cfg.catalog_path).unwrap();
    seed_map(&catalog, "m");
    // source a is the base (higher priority), b aligns through a shared grid
    add_source(&catalog, "m", "a", 1, 10, 1);
    add_source(&catalog, "m", "b", 1, 0, 2);
    catalog.upsert_grid("a", 1, "shared", 2, 2).unwrap();
    catalog.upsert_grid("b", 1, "shared", 0, 0).unwrap();

    write_png(&cfg.grid_file("grids/a/red.png"), Rgba([255, 0, 0, 255]));
    write_png(&cfg.grid_file("grids/b/green.png"), Rgba([0, 255, 0, 255]));
    for x in 0..4 {
        for y in 0..4 {
            catalog.upsert_tile("a", 1, x, y, "grids/a/red.png", 1).unwrap();
            catalog.upsert_tile("b", 1, x, y, "grids/b/green.png", 2).unwrap();
        }
    }

    let state = AppState::new(cfg.clone());
    state.orchestrator.start("m").await.expect("run succeeds");

    let row = catalog.get_public_map("m").unwrap().unwrap();
    // b's tiles shift by (2,2), extending the union to (5,5)
    assert_eq!((row.min_x, row.max_x, row.min_y, row.max_y), (Some(0), Some(5), Some(0), Some(5)));

    let bytes = std::fs::read(cfg.public_tile("m", 0, 0, 0)).unwrap();
    let img = webp::Decoder::new(&bytes).decode().unwrap().to_image().to_rgba8();
    // (0,0) is only covered by a
    assert_close(*img.get_pixel(50, 50), [255, 0, 0], 20);
    // (2,2) is covered by both; b wins with the greater cache timestamp
    assert_close(*img.get_pixel(250, 250), [0, 255, 0], 20);
}

#[tokio::test]
async fn concurrent_starts_are_single_flight() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::for_root(dir.path());
    let catalog = Catalog::open(&cfg.catalog_path).unwrap();
    seed_map(&catalog, "m");
    add_source(&catalog, "m", "t", 1, 0, 1);
    write_png(&cfg.grid_file("grids/t/tile.png"), Rgba([9, 9, 9, 255]));
    for x in 0..4 {
        for y in 0..4 {
            catalog.upsert_tile("t", 1, x, y, "grids/t/tile.png", 1).unwrap();
        }
    }

    let state = AppState::new(cfg.clone());
    let (first, second) =
        tokio::join!(state.orchestrator.start("m"), state.orchestrator.start("m"));
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "exactly one run succeeds");

    let row = catalog.get_public_map("m").unwrap().unwrap();
    assert_eq!(row.generation_status, GenerationStatus::Completed);
}
