use std::{fs::File, path::Path};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use super::{
    HmapAnalysis, HmapData, HmapGrid, HmapMarker, GRID_TILES, HMAP_MAGIC, MARKER_KIND_SURFACE,
};

#[derive(Debug, thiserror::Error)]
pub enum HmapError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("bad mapfile signature")]
    BadMagic,
    #[error("truncated mapfile while reading {0}")]
    Truncated(&'static str),
    #[error("negative length for {0}")]
    NegativeLength(&'static str),
    #[error("invalid utf-8 in {0}")]
    BadUtf8(&'static str),
}

/// Decode a mapfile from disk through an mmap.
pub fn decode_file(path: impl AsRef<Path>) -> Result<HmapData, HmapError> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    decode_bytes(&mmap)
}

/// Decode a mapfile held in memory.
pub fn decode_bytes(bytes: &[u8]) -> Result<HmapData, HmapError> {
    let mut r = Reader::new(bytes);
    if r.take(HMAP_MAGIC.len(), "signature")? != HMAP_MAGIC {
        return Err(HmapError::BadMagic);
    }

    let segment_count = r.read_len("segment count")?;
    let mut grids = Vec::new();
    for _ in 0..segment_count {
        let segment_id = r.read_i64("segment id")?;
        let grid_count = r.read_len("grid count")?;
        for _ in 0..grid_count {
            grids.push(read_grid(&mut r, segment_id)?);
        }
    }

    let marker_count = r.read_len("marker count")?;
    let mut markers = Vec::new();
    for _ in 0..marker_count {
        if let Some(m) = read_marker(&mut r)? {
            markers.push(m);
        }
    }

    Ok(HmapData { grids, markers })
}

/// Decode and summarise, for the upload analysis columns.
pub fn analyze_file(path: impl AsRef<Path>) -> Result<HmapAnalysis, HmapError> {
    Ok(decode_file(path)?.analysis())
}

fn read_grid(r: &mut Reader<'_>, segment_id: i64) -> Result<HmapGrid, HmapError> {
    let tile_x = r.read_i32("grid x")?;
    let tile_y = r.read_i32("grid y")?;
    let tileset_count = r.read_len("tileset count")?;
    let mut tilesets = Vec::with_capacity(tileset_count);
    for _ in 0..tileset_count {
        tilesets.push(r.read_string("tileset name")?);
    }
    let tile_indices = r.take(GRID_TILES, "tile indices")?.to_vec();
    let z_bytes = r.take(GRID_TILES * 4, "z map")?;
    let mut z_map = vec![0f32; GRID_TILES];
    LittleEndian::read_f32_into(z_bytes, &mut z_map);
    Ok(HmapGrid { segment_id, tile_x, tile_y, tile_indices, z_map, tilesets })
}

/// Markers are length-prefixed records so unknown kinds skip cleanly.
fn read_marker(r: &mut Reader<'_>) -> Result<Option<HmapMarker>, HmapError> {
    let record_len = r.read_len("marker record length")?;
    let record = r.take(record_len, "marker record")?;
    let mut m = Reader::new(record);
    let kind = m.read_u8("marker kind")?;
    if kind != MARKER_KIND_SURFACE {
        return Ok(None);
    }
    let object_id = m.read_u64("marker object id")?;
    let tile_x = m.read_i32("marker x")?;
    let tile_y = m.read_i32("marker y")?;
    let name = m.read_string("marker name")?;
    let resource_name = m.read_string("marker resource")?;
    Ok(Some(HmapMarker { object_id, tile_x, tile_y, name, resource_name }))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], HmapError> {
        let end = self.pos.checked_add(n).ok_or(HmapError::Truncated(what))?;
        if end > self.bytes.len() {
            return Err(HmapError::Truncated(what));
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, HmapError> {
        Ok(self.take(1, what)?[0])
    }

    fn read_i32(&mut self, what: &'static str) -> Result<i32, HmapError> {
        Ok(LittleEndian::read_i32(self.take(4, what)?))
    }

    fn read_i64(&mut self, what: &'static str) -> Result<i64, HmapError> {
        Ok(LittleEndian::read_i64(self.take(8, what)?))
    }

    fn read_u64(&mut self, what: &'static str) -> Result<u64, HmapError> {
        Ok(LittleEndian::read_u64(self.take(8, what)?))
    }

    fn read_len(&mut self, what: &'static str) -> Result<usize, HmapError> {
        let v = self.read_i32(what)?;
        if v < 0 {
            return Err(HmapError::NegativeLength(what));
        }
        Ok(v as usize)
    }

    fn read_string(&mut self, what: &'static str) -> Result<String, HmapError> {
        let len = self.read_len(what)?;
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| HmapError::BadUtf8(what))
    }
}
