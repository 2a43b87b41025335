pub mod coords;
pub mod db;
pub mod hmap;
pub mod models;
pub mod render;
pub mod slug;

pub use coords::{block_parent, fdiv, parent, shift_offset, Bounds};
pub use db::Catalog;
pub use hmap::{HmapData, HmapError, HmapGrid, HmapMarker, GRID_TILES, HMAP_MAGIC};
pub use models::GenerationStatus;
pub use slug::slugify;
