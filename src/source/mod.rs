//! Tile sources: where an image stack gets its 2D planes from.
//!
//! A [`TileSource`] exposes tile keys, per-tile pixels with physical coordinates,
//! and global extras. The stack converts pixels to float32 in `[0, 1]` while
//! loading and never retains the tiles themselves.

pub mod array;
pub mod synthetic;

use ndarray::{Array, Array2, ArrayView, Dimension, Zip};
use rayon::prelude::*;
use serde_json::{Map, Value};

pub use crate::stack::coordinates::TileCoordinates;
use crate::error::{StackError, StackResult};
use crate::stack::TileKey;

pub use array::ArrayTileSource;
pub use synthetic::SyntheticTileSource;

/// Key under which the provenance log travels in a source's extras.
pub const STACK_EXTRAS_KEY: &str = "image_stack";

/// Default physical extent given to tiles that come without coordinates.
pub const DEFAULT_EXTENT: (f64, f64) = (0.0, 0.0001);

pub trait TileSource {
    /// Every (round, channel, z-plane) combination available.
    fn keys(&self) -> Vec<TileKey>;

    fn get_tile(&self, key: TileKey) -> StackResult<Tile>;

    /// Global metadata; may carry a prior provenance log under [`STACK_EXTRAS_KEY`].
    fn extras(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// One externally sourced 2D plane.
#[derive(Clone, Debug)]
pub struct Tile {
    pub pixels: TilePixels,
    pub coordinates: TileCoordinates,
    pub extras: Map<String, Value>,
}

impl Tile {
    pub fn new(pixels: TilePixels, coordinates: TileCoordinates) -> Self {
        Self {
            pixels,
            coordinates,
            extras: Map::new(),
        }
    }

    pub fn with_extras(mut self, extras: Map<String, Value>) -> Self {
        self.extras = extras;
        self
    }
}

/// Raw pixel data as produced by a source.
#[derive(Clone, Debug, PartialEq)]
pub enum TilePixels {
    U8(Array2<u8>),
    U16(Array2<u16>),
    F32(Array2<f32>),
    F64(Array2<f64>),
}

impl TilePixels {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            TilePixels::U8(a) => a.dim(),
            TilePixels::U16(a) => a.dim(),
            TilePixels::F32(a) => a.dim(),
            TilePixels::F64(a) => a.dim(),
        }
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            TilePixels::U8(_) => u8::DTYPE,
            TilePixels::U16(_) => u16::DTYPE,
            TilePixels::F32(_) => f32::DTYPE,
            TilePixels::F64(_) => f64::DTYPE,
        }
    }

    /// Converts to float32 in `[0, 1]`: unsigned integers are divided by their
    /// maximum value, floats must already lie in range.
    pub fn to_float32(&self) -> StackResult<Array2<f32>> {
        match self {
            TilePixels::U8(a) => to_unit_float(a.view()),
            TilePixels::U16(a) => to_unit_float(a.view()),
            TilePixels::F32(a) => to_unit_float(a.view()),
            TilePixels::F64(a) => to_unit_float(a.view()),
        }
    }
}

/// Element types a source may deliver.
pub trait PixelType: Copy + Send + Sync + 'static {
    const DTYPE: &'static str;

    fn to_unit(self) -> f32;

    fn in_unit_range(self) -> bool {
        true
    }
}

impl PixelType for u8 {
    const DTYPE: &'static str = "uint8";

    fn to_unit(self) -> f32 {
        self as f32 / u8::MAX as f32
    }
}

impl PixelType for u16 {
    const DTYPE: &'static str = "uint16";

    fn to_unit(self) -> f32 {
        self as f32 / u16::MAX as f32
    }
}

impl PixelType for f32 {
    const DTYPE: &'static str = "float32";

    fn to_unit(self) -> f32 {
        self
    }

    fn in_unit_range(self) -> bool {
        (0.0..=1.0).contains(&self)
    }
}

impl PixelType for f64 {
    const DTYPE: &'static str = "float64";

    fn to_unit(self) -> f32 {
        self as f32
    }

    fn in_unit_range(self) -> bool {
        (0.0..=1.0).contains(&self)
    }
}

pub fn to_unit_float<T: PixelType, D: Dimension>(data: ArrayView<'_, T, D>) -> StackResult<Array<f32, D>> {
    if data.clone().into_par_iter().any(|value| !value.in_unit_range()) {
        return Err(StackError::invalid_data(format!(
            "{} data must lie in [0, 1]",
            T::DTYPE
        )));
    }
    Ok(Zip::from(&data).par_map_collect(|value| value.to_unit()))
}
