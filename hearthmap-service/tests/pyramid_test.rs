use std::collections::BTreeSet;

use hearthmap_service::codec::{encode_webp, read_webp_tile, write_tile};
use hearthmap_service::pyramid::{build_pyramid, compose_parent, MAX_ZOOM};
use image::imageops::FilterType;
use image::{Rgba, RgbaImage};

fn write_zoom0(dir: &std::path::Path, x: i32, y: i32, color: Rgba<u8>) {
    let img = RgbaImage::from_pixel(400, 400, color);
    let bytes = encode_webp(&img, 85.0).unwrap();
    write_tile(&dir.join("0").join(format!("{x}_{y}.webp")), &bytes).unwrap();
}

#[test]
fn quadrants_land_in_their_corners() {
    let child = RgbaImage::from_pixel(400, 400, Rgba([250, 0, 0, 255]));
    let img = compose_parent([None, None, None, Some(child)], FilterType::Nearest).unwrap();
    assert_eq!((img.width(), img.height()), (400, 400));
    assert_eq!(img.get_pixel(0, 0).0[3], 0, "empty quadrant is transparent");
    assert_eq!(*img.get_pixel(300, 300), Rgba([250, 0, 0, 255]));
}

#[test]
fn empty_children_produce_no_parent() {
    assert!(compose_parent([None, None, None, None], FilterType::Nearest).is_none());
}

#[test]
fn sparse_tile_walks_up_through_every_level() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path();
    write_zoom0(out, 5, 5, Rgba([10, 200, 10, 255]));

    let zoom0: BTreeSet<(i32, i32)> = [(5, 5)].into_iter().collect();
    let mut reported = Vec::new();
    let written =
        build_pyramid(out, &zoom0, 85.0, FilterType::Nearest, (50, 100), &mut |p| reported.push(p))
            .unwrap();
    assert_eq!(written, 6);

    let expected = [(1u8, 2, 2), (2, 1, 1), (3, 0, 0), (4, 0, 0), (5, 0, 0), (6, 0, 0)];
    for (zoom, x, y) in expected {
        let path = out.join(zoom.to_string()).join(format!("{x}_{y}.webp"));
        assert!(path.exists(), "zoom {zoom} tile ({x},{y})");
    }
    // the rest of zoom 1 stays absent
    for (x, y) in [(2, 3), (3, 2), (3, 3)] {
        assert!(!out.join("1").join(format!("{x}_{y}.webp")).exists());
    }
    // progress lands on the top of its range
    assert_eq!(reported.last(), Some(&100));
}

#[test]
fn every_written_tile_has_a_written_parent() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path();
    let mut zoom0 = BTreeSet::new();
    for (x, y) in [(-5, -5), (0, 0), (3, 7), (12, 1)] {
        write_zoom0(out, x, y, Rgba([70, 70, 200, 255]));
        zoom0.insert((x, y));
    }
    build_pyramid(out, &zoom0, 85.0, FilterType::Nearest, (50, 100), &mut |_| {}).unwrap();

    let mut level = zoom0;
    for zoom in 1..=MAX_ZOOM {
        let mut next = BTreeSet::new();
        for &(x, y) in &level {
            let parent = hearthmap_core::parent(x, y);
            let path = out.join(zoom.to_string()).join(format!("{}_{}.webp", parent.0, parent.1));
            assert!(path.exists(), "zoom {zoom} parent of ({x},{y})");
            next.insert(parent);
        }
        level = next;
    }
}

#[test]
fn parent_downsamples_child_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path();
    write_zoom0(out, 0, 0, Rgba([200, 40, 40, 255]));
    let zoom0: BTreeSet<(i32, i32)> = [(0, 0)].into_iter().collect();
    build_pyramid(out, &zoom0, 85.0, FilterType::Nearest, (50, 100), &mut |_| {}).unwrap();

    let parent = read_webp_tile(&out.join("1").join("0_0.webp")).unwrap().unwrap();
    // child (0,0) fills the top-left 200x200 quadrant; the rest is transparent
    assert!(parent.get_pixel(100, 100).0[3] == 255);
    let px = *parent.get_pixel(100, 100);
    assert!((px.0[0] as i32 - 200).abs() <= 20, "{px:?}");
    assert_eq!(parent.get_pixel(300, 300).0[3], 0);
}
