use byteorder::{LittleEndian, WriteBytesExt};
use hearthmap_core::hmap::{GRID_TILES, HMAP_MAGIC};
use hearthmap_service::errors::ApiError;
use hearthmap_service::{Config, PublicMapService};
use std::io::Write;

fn service() -> (tempfile::TempDir, PublicMapService, Config) {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::for_root(dir.path());
    (dir, PublicMapService::new(cfg.clone()), cfg)
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_i32::<LittleEndian>(s.len() as i32).unwrap();
    buf.write_all(s.as_bytes()).unwrap();
}

fn snapshot_with_grids(coords: &[(i32, i32)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(HMAP_MAGIC);
    buf.write_i32::<LittleEndian>(1).unwrap();
    buf.write_i64::<LittleEndian>(1).unwrap();
    buf.write_i32::<LittleEndian>(coords.len() as i32).unwrap();
    for &(x, y) in coords {
        buf.write_i32::<LittleEndian>(x).unwrap();
        buf.write_i32::<LittleEndian>(y).unwrap();
        buf.write_i32::<LittleEndian>(1).unwrap();
        push_string(&mut buf, "gfx/tiles/grass");
        buf.extend(std::iter::repeat(0u8).take(GRID_TILES));
        for _ in 0..GRID_TILES {
            buf.write_f32::<LittleEndian>(0.0).unwrap();
        }
    }
    buf.write_i32::<LittleEndian>(0).unwrap(); // markers
    buf
}

#[test]
fn consecutive_creates_get_suffixed_slugs() {
    let (_dir, svc, _cfg) = service();
    let first = svc.create_public_map("My Map", None, true, "op").unwrap();
    let second = svc.create_public_map("My Map", None, true, "op").unwrap();
    assert_eq!(first.id, "my-map");
    assert_eq!(second.id, "my-map-1");
    let third = svc.create_public_map("My Map", None, true, "op").unwrap();
    assert_eq!(third.id, "my-map-2");
}

#[test]
fn explicit_short_slug_is_rejected() {
    let (_dir, svc, _cfg) = service();
    let err = svc.create_public_map("Fine Name", Some("a!"), true, "op").unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)), "{err}");
}

#[test]
fn update_changes_only_provided_fields() {
    let (_dir, svc, _cfg) = service();
    let map = svc.create_public_map("My Map", None, true, "op").unwrap();
    let updated = svc
        .update_public_map(
            &map.id,
            hearthmap_service::public_maps::PublicMapUpdate {
                auto_regenerate: Some(true),
                regenerate_interval_minutes: Some(Some(60)),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.name, "My Map");
    assert!(updated.auto_regenerate);
    assert_eq!(updated.regenerate_interval_minutes, Some(60));

    let err = svc
        .update_public_map(
            &map.id,
            hearthmap_service::public_maps::PublicMapUpdate {
                regenerate_interval_minutes: Some(Some(0)),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)));
}

#[test]
fn delete_removes_row_links_and_tile_tree() {
    let (_dir, svc, cfg) = service();
    let map = svc.create_public_map("Doomed", None, true, "op").unwrap();
    let tile_dir = cfg.public_dir(&map.id).join("0");
    std::fs::create_dir_all(&tile_dir).unwrap();
    std::fs::write(tile_dir.join("0_0.webp"), b"x").unwrap();

    svc.delete_public_map(&map.id).unwrap();
    assert!(!cfg.public_dir(&map.id).exists());
    assert!(matches!(svc.get_public_map(&map.id), Err(ApiError::NotFound(_))));
    assert!(matches!(svc.delete_public_map(&map.id), Err(ApiError::NotFound(_))));
}

#[test]
fn upload_rejects_wrong_magic_and_accepts_valid_files() {
    let (_dir, svc, cfg) = service();
    let err = svc.save_hmap_source("bad", "bad.hmap", b"Not A Mapfile 9 longer than magic").unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)));
    let err = svc.save_hmap_source("short", "s.hmap", b"tiny").unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)));

    let row = svc
        .save_hmap_source("world", "w.hmap", &snapshot_with_grids(&[(0, 0), (3, -2)]))
        .unwrap();
    assert_eq!(row.total_grids, Some(2));
    assert_eq!(row.segment_count, Some(1));
    assert_eq!((row.min_x, row.max_x), (Some(0), Some(3)));
    assert_eq!((row.min_y, row.max_y), (Some(-2), Some(0)));
    assert!(row.analyzed_at.is_some());
    assert!(cfg.grid_file(&row.file_path).exists());
    assert!(row.file_path.starts_with("hmap-sources/"));
    assert!(row.file_path.ends_with("_w.hmap"));
}

#[test]
fn referenced_snapshot_cannot_be_deleted() {
    let (_dir, svc, cfg) = service();
    let map = svc.create_public_map("Map", None, true, "op").unwrap();
    let row = svc.save_hmap_source("world", "w.hmap", &snapshot_with_grids(&[(0, 0)])).unwrap();
    svc.add_hmap_source_link(&map.id, row.id, 0).unwrap();

    let err = svc.delete_hmap_source(row.id).unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)), "{err}");

    svc.remove_hmap_source_link(&map.id, row.id).unwrap();
    svc.delete_hmap_source(row.id).unwrap();
    assert!(!cfg.grid_file(&row.file_path).exists());
}

#[test]
fn duplicate_links_are_rejected() {
    let (_dir, svc, _cfg) = service();
    let map = svc.create_public_map("Map", None, true, "op").unwrap();
    svc.add_tenant_source(&map.id, "t", 1, 0, "op").unwrap();
    let err = svc.add_tenant_source(&map.id, "t", 1, 5, "op").unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)));
    let err = svc.add_tenant_source("nope", "t", 1, 0, "op").unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[test]
fn contribution_analysis_counts_claims_in_priority_order() {
    let (_dir, svc, _cfg) = service();
    let map = svc.create_public_map("Map", None, true, "op").unwrap();
    let high = svc
        .save_hmap_source("high", "high.hmap", &snapshot_with_grids(&[(0, 0), (1, 0)]))
        .unwrap();
    let low = svc
        .save_hmap_source("low", "low.hmap", &snapshot_with_grids(&[(1, 0), (2, 0)]))
        .unwrap();
    svc.add_hmap_source_link(&map.id, high.id, 10).unwrap();
    svc.add_hmap_source_link(&map.id, low.id, 0).unwrap();

    let report = svc.analyze_contributions(&map.id).unwrap();
    assert_eq!(report.total_grids, 3);
    assert_eq!(report.sources.len(), 2);
    assert_eq!(report.sources[0].hmap_source_id, high.id);
    assert_eq!(report.sources[0].new_grids, 2);
    assert_eq!(report.sources[0].overlapping_grids, 0);
    assert_eq!(report.sources[1].new_grids, 1);
    assert_eq!(report.sources[1].overlapping_grids, 1);

    // counters are persisted on the linking rows
    let catalog = hearthmap_core::Catalog::open(&_cfg.catalog_path).unwrap();
    let links = catalog.list_hmap_links(&map.id).unwrap();
    assert_eq!(links[0].new_grids, Some(2));
    assert_eq!(links[1].overlapping_grids, Some(1));
}

#[test]
fn bounds_carry_the_tile_version() {
    let (_dir, svc, cfg) = service();
    let map = svc.create_public_map("Map", None, true, "op").unwrap();
    let bounds = svc.get_bounds(&map.id).unwrap();
    assert_eq!(bounds.tile_version, None, "never generated");

    let catalog = hearthmap_core::Catalog::open(&cfg.catalog_path).unwrap();
    catalog.complete_generation(&map.id, 3, None, 1_700_000_000, 2).unwrap();
    let bounds = svc.get_bounds(&map.id).unwrap();
    assert_eq!(bounds.tile_version, Some(1_700_000_000));
}

#[test]
fn available_tenant_maps_count_zoom0_tiles() {
    let (_dir, svc, cfg) = service();
    let catalog = hearthmap_core::Catalog::open(&cfg.catalog_path).unwrap();
    catalog
        .upsert_tenant(&hearthmap_core::db::TenantRow { id: "t".into(), name: "Tenant".into(), active: true })
        .unwrap();
    catalog
        .upsert_tenant(&hearthmap_core::db::TenantRow { id: "idle".into(), name: "Idle".into(), active: false })
        .unwrap();
    catalog.upsert_tile("t", 1, 0, 0, "grids/a.png", 1).unwrap();
    catalog.upsert_tile("t", 1, 1, 0, "grids/b.png", 1).unwrap();
    catalog.upsert_tile("t", 2, 0, 0, "grids/c.png", 1).unwrap();
    catalog.upsert_tile("idle", 9, 0, 0, "grids/d.png", 1).unwrap();

    let maps = svc.list_available_tenant_maps().unwrap();
    assert_eq!(maps.len(), 2, "inactive tenants are skipped");
    assert_eq!(maps[0].map_id, 1);
    assert_eq!(maps[0].tile_count, 2);
    assert_eq!(maps[1].map_id, 2);
    assert_eq!(maps[1].tile_count, 1);
}
