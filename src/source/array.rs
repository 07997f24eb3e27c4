use ndarray::{s, Array5};
use serde_json::{Map, Value};

use super::{Tile, TileCoordinates, TilePixels, TileSource, DEFAULT_EXTENT};
use crate::error::{StackError, StackResult};
use crate::stack::coordinates::CoordinateTable;
use crate::stack::{Axis, AxisIndex, TileKey};

/// Tile source over an in-memory (round, ch, zplane, y, x) float32 array.
#[derive(Clone, Debug)]
pub struct ArrayTileSource {
    data: Array5<f32>,
    index: AxisIndex,
    coordinates: Option<CoordinateTable>,
    extras: Map<String, Value>,
}

impl ArrayTileSource {
    /// `labels` lists (round, ch, zplane) labels in position order; `None` labels
    /// each axis `0..n`.
    pub fn new(
        data: Array5<f32>,
        labels: Option<[Vec<usize>; 3]>,
        coordinates: Option<CoordinateTable>,
    ) -> StackResult<Self> {
        let (n_round, n_ch, n_z, height, width) = data.dim();
        let [round, ch, zplane] =
            labels.unwrap_or_else(|| [(0..n_round).collect(), (0..n_ch).collect(), (0..n_z).collect()]);

        for (axis, labels, size) in [
            (Axis::Round, &round, n_round),
            (Axis::Ch, &ch, n_ch),
            (Axis::ZPlane, &zplane, n_z),
        ] {
            if labels.len() != size {
                return Err(StackError::shape(format!(
                    "{} labels given for axis {axis} of size {size}",
                    labels.len()
                )));
            }
            if labels.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(StackError::shape(format!(
                    "labels for axis {axis} must be strictly increasing"
                )));
            }
        }

        Ok(Self {
            data,
            index: AxisIndex::new(round, ch, zplane, (height, width)),
            coordinates,
            extras: Map::new(),
        })
    }

    pub fn with_extras(mut self, extras: Map<String, Value>) -> Self {
        self.extras = extras;
        self
    }

    pub fn tile_shape(&self) -> (usize, usize) {
        self.index.tile_shape()
    }

    fn position(&self, axis: Axis, label: usize) -> StackResult<usize> {
        self.index
            .labels(axis)
            .binary_search(&label)
            .map_err(|_| StackError::lookup(format!("label {label} not present on axis {axis}")))
    }
}

impl TileSource for ArrayTileSource {
    fn keys(&self) -> Vec<TileKey> {
        self.index.keys()
    }

    fn get_tile(&self, key: TileKey) -> StackResult<Tile> {
        let r = self.position(Axis::Round, key.round)?;
        let c = self.position(Axis::Ch, key.ch)?;
        let z = self.position(Axis::ZPlane, key.zplane)?;
        let pixels = self.data.slice(s![r, c, z, .., ..]).to_owned();

        let coordinates = match &self.coordinates {
            Some(table) => table
                .get(&key)
                .map(|entry| entry.to_tile_coordinates())
                .ok_or_else(|| StackError::lookup(format!("no coordinates for tile {key}")))?,
            None => TileCoordinates {
                x: DEFAULT_EXTENT,
                y: DEFAULT_EXTENT,
                z: Some(DEFAULT_EXTENT),
            },
        };

        Ok(Tile::new(TilePixels::F32(pixels), coordinates))
    }

    fn extras(&self) -> Map<String, Value> {
        self.extras.clone()
    }
}
