//! The five-axis image stack and the machinery around it.
//!
//! - [`axes`] - axis names, canonical order and tile keys
//! - [`selector`] - selector algebra over axis labels
//! - [`coordinates`] - physical coordinates per tile
//! - [`provenance`] - append-only operation log
//! - [`image_stack`] - the tensor store
//! - [`parallel`] - apply/transform over disjoint blocks
//! - [`export`] - tiles out, manifest on disk

pub mod axes;
pub mod coordinates;
pub mod export;
pub mod image_stack;
pub mod parallel;
pub mod provenance;
pub mod selector;

pub use axes::{Axis, PhysicalAxis, TileKey};
pub use coordinates::{CoordinateEntry, CoordinateTable};
pub use export::{default_tile_name, ExportedTile, ExportedTileSet, TileNamer};
pub use image_stack::{ImageStack, StackStatistics, TileMetadata, ViewScaling};
pub use parallel::EngineOptions;
pub use provenance::{OperationKind, ProvenanceLog, ProvenanceRecord};
pub use selector::{AxisIndex, Indexer, Selector};
