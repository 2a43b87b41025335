//! Image payload helpers shared by the composer, pyramid builder and the
//! large-tile cache. Published tiles are lossy WebP; tenant uploads are PNG.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbaImage;

/// Size of one published tile edge in pixels.
pub const TILE_PX: u32 = 400;

/// Size of one base (source) tile edge in pixels.
pub const BASE_PX: u32 = 100;

/// Quadrant edge when packing four children into a parent tile.
pub const QUAD_PX: u32 = 200;

pub fn encode_webp(img: &RgbaImage, quality: f32) -> Result<Vec<u8>> {
    let encoder = webp::Encoder::from_rgba(img.as_raw(), img.width(), img.height());
    Ok(encoder.encode(quality).to_vec())
}

pub fn decode_webp(bytes: &[u8]) -> Option<RgbaImage> {
    let decoded = webp::Decoder::new(bytes).decode()?;
    Some(decoded.to_image().to_rgba8())
}

/// Load a tenant-uploaded base tile. Any decodable format is accepted; the
/// uploads in practice are PNG.
pub fn load_base_tile(path: &Path) -> Result<RgbaImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to decode base tile {}", path.display()))?;
    Ok(img.to_rgba8())
}

/// Read and decode a previously written WebP tile, `None` when absent.
pub fn read_webp_tile(path: &Path) -> Result<Option<RgbaImage>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    decode_webp(&bytes)
        .map(Some)
        .ok_or_else(|| anyhow!("failed to decode webp tile {}", path.display()))
}

/// Write encoded tile bytes, creating parent directories as needed.
pub fn write_tile(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn webp_round_trip_keeps_dimensions_and_header() {
        let img = RgbaImage::from_pixel(TILE_PX, TILE_PX, Rgba([200, 10, 10, 255]));
        let bytes = encode_webp(&img, 85.0).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");
        let back = decode_webp(&bytes).unwrap();
        assert_eq!((back.width(), back.height()), (TILE_PX, TILE_PX));
    }

    #[test]
    fn missing_tile_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_webp_tile(&dir.path().join("0_0.webp")).unwrap().is_none());
    }
}
