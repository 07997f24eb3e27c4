//! # Image Stack
//!
//! A five-axis (round, channel, z-plane, y, x) float32 image tensor assembled from
//! independently sourced 2D tiles. Each tile keeps its physical stage coordinates,
//! every operation is recorded in a provenance log, and user functions run in
//! parallel over disjoint blocks of the shared buffer.
//!
//! ## Quick Start
//!
//! ```rust
//! use image_stack::{Axis, EngineOptions, ImageStack, Selector};
//!
//! let stack = ImageStack::synthetic_stack(2, 3, 1, 16, 16).unwrap();
//!
//! // Slice one channel of the single z-plane
//! let (data, axes) = stack
//!     .get_slice(&Selector::new().with(Axis::Ch, 1).with(Axis::ZPlane, 0))
//!     .unwrap();
//! assert_eq!(data.shape(), &[2, 16, 16]);
//! assert_eq!(axes, vec![Axis::Round, Axis::Y, Axis::X]);
//!
//! // Halve every tile on a copy
//! let halved = stack
//!     .apply(|tile| Ok(&tile * 0.5), &EngineOptions::default())
//!     .unwrap();
//! println!("{halved}: {:?}", halved.statistics());
//! ```
//!
//! ## Core Modules
//!
//! - [`config`] - Engine configuration via TOML
//! - [`stack`] - Image stack, selectors, coordinates and the parallel engine
//! - [`source`] - Tile sources the stack is built from
//! - [`logging`] - JSON line-delimited operation log

pub mod config;
pub mod error;
pub mod logging;
pub mod source;
pub mod stack;

pub use config::StackConfig;
pub use error::{StackError, StackResult, TaskError};
pub use source::{Tile, TilePixels, TileSource};
pub use stack::{
    Axis, EngineOptions, ExportedTileSet, ImageStack, Indexer, PhysicalAxis, Selector,
    StackStatistics, TileKey, ViewScaling,
};
