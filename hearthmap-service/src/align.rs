//! Translate per-source grid coordinates into the unified space.
//!
//! The first source in composition order is the base and sits at (0,0).
//! Every other source is shifted so that a grid shared with the base lands
//! on the base's coordinates for that grid.

use std::collections::HashMap;

use anyhow::Result;
use hearthmap_core::db::TenantSourceRow;
use hearthmap_core::Catalog;
use tracing::warn;

pub type SourceKey = (String, i64);

/// Zoom-0 offsets per source, computed against the base source's grid ids.
pub fn compute_offsets(
    catalog: &Catalog,
    sources: &[TenantSourceRow],
) -> Result<HashMap<SourceKey, (i32, i32)>> {
    let mut offsets = HashMap::new();
    let Some(base) = sources.first() else {
        return Ok(offsets);
    };
    offsets.insert((base.tenant_id.clone(), base.map_id), (0, 0));

    let base_grids: HashMap<String, (i32, i32)> = catalog
        .grids_for(&base.tenant_id, base.map_id)?
        .into_iter()
        .map(|g| (g.grid_id, (g.coord_x, g.coord_y)))
        .collect();

    for source in &sources[1..] {
        let grids = catalog.grids_for(&source.tenant_id, source.map_id)?;
        // lexicographically first shared grid id, so the anchor is stable
        let anchor = grids
            .iter()
            .filter(|g| base_grids.contains_key(&g.grid_id))
            .min_by(|a, b| a.grid_id.cmp(&b.grid_id));
        let offset = match anchor {
            Some(g) => {
                let (bx, by) = base_grids[&g.grid_id];
                (bx - g.coord_x, by - g.coord_y)
            }
            None => {
                warn!(
                    tenant_id = %source.tenant_id,
                    map_id = source.map_id,
                    "no grid shared with the base source; keeping offset (0,0)"
                );
                (0, 0)
            }
        };
        offsets.insert((source.tenant_id.clone(), source.map_id), offset);
    }
    Ok(offsets)
}
