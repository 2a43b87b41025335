//! Thingwall marker extraction for the published `markers.json`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use hearthmap_core::db::TenantSourceRow;
use hearthmap_core::hmap::HmapMarker;
use hearthmap_core::models::PublicMarker;
use hearthmap_core::Catalog;

use crate::align::SourceKey;

const PUBLIC_MARKER_NEEDLE: &str = "thingwall";

/// Collect public markers across tenant sources, shifted into unified space.
/// Duplicate absolute positions keep the first occurrence.
pub fn tenant_markers(
    catalog: &Catalog,
    sources: &[TenantSourceRow],
    offsets: &HashMap<SourceKey, (i32, i32)>,
) -> Result<Vec<PublicMarker>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for source in sources {
        let key = (source.tenant_id.clone(), source.map_id);
        let (dx, dy) = offsets.get(&key).copied().unwrap_or((0, 0));
        let grids: HashMap<String, (i32, i32)> = catalog
            .grids_for(&source.tenant_id, source.map_id)?
            .into_iter()
            .map(|g| (g.grid_id, (g.coord_x, g.coord_y)))
            .collect();
        for m in catalog.thingwall_markers(&source.tenant_id)? {
            // markers on grids outside this map belong to another source row
            let Some(&(gx, gy)) = grids.get(&m.grid_id) else { continue };
            let x = (gx + dx) * 100 + m.position_x;
            let y = (gy + dy) * 100 + m.position_y;
            if seen.insert((x, y)) {
                out.push(PublicMarker { id: m.id, name: m.name, x, y, image: m.image });
            }
        }
    }
    Ok(out)
}

/// Collect public markers from decoded snapshots. Marker coordinates are
/// already absolute world-tile positions.
pub fn hmap_markers(markers: &[HmapMarker]) -> Vec<PublicMarker> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for m in markers {
        if !m.resource_name.contains(PUBLIC_MARKER_NEEDLE) {
            continue;
        }
        if seen.insert((m.tile_x, m.tile_y)) {
            out.push(PublicMarker {
                id: m.object_id as i64,
                name: m.name.clone(),
                x: m.tile_x,
                y: m.tile_y,
                image: m.resource_name.clone(),
            });
        }
    }
    out
}

/// Serialise the marker list as a UTF-8 JSON array with camelCase keys.
pub fn write_markers(path: &Path, markers: &[PublicMarker]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_vec(markers).context("failed to serialise markers")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}
