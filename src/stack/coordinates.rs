//! Physical stage coordinates per (round, channel, z-plane).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::axes::{Axis, PhysicalAxis, TileKey};
use super::selector::{Indexer, Selector};
use crate::error::{StackError, StackResult};

/// Physical bounds reported by a tile source for one tile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileCoordinates {
    pub x: (f64, f64),
    pub y: (f64, f64),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<(f64, f64)>,
}

/// Six physical bounds of one tile; z bounds are NaN when the source had none.
#[derive(Clone, Copy, Debug)]
pub struct CoordinateEntry {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub z_min: f64,
    pub z_max: f64,
}

impl CoordinateEntry {
    pub fn range(&self, axis: PhysicalAxis) -> (f64, f64) {
        match axis {
            PhysicalAxis::X => (self.x_min, self.x_max),
            PhysicalAxis::Y => (self.y_min, self.y_max),
            PhysicalAxis::Z => (self.z_min, self.z_max),
        }
    }

    pub fn z_range(&self) -> Option<(f64, f64)> {
        if self.z_min.is_nan() || self.z_max.is_nan() {
            None
        } else {
            Some((self.z_min, self.z_max))
        }
    }

    fn same_xy(&self, other: &Self) -> bool {
        self.x_min == other.x_min
            && self.x_max == other.x_max
            && self.y_min == other.y_min
            && self.y_max == other.y_max
    }

    pub fn to_tile_coordinates(&self) -> TileCoordinates {
        TileCoordinates {
            x: (self.x_min, self.x_max),
            y: (self.y_min, self.y_max),
            z: self.z_range(),
        }
    }
}

/// Missing z bounds compare equal to each other.
impl PartialEq for CoordinateEntry {
    fn eq(&self, other: &Self) -> bool {
        self.same_xy(other) && self.z_range() == other.z_range()
    }
}

impl From<TileCoordinates> for CoordinateEntry {
    fn from(value: TileCoordinates) -> Self {
        let (z_min, z_max) = value.z.unwrap_or((f64::NAN, f64::NAN));
        Self {
            x_min: value.x.0,
            x_max: value.x.1,
            y_min: value.y.0,
            y_max: value.y.1,
            z_min,
            z_max,
        }
    }
}

/// Coordinate entries keyed by tile, iterated in canonical order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoordinateTable {
    entries: BTreeMap<TileKey, CoordinateEntry>,
}

impl CoordinateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: TileKey, entry: CoordinateEntry) {
        self.entries.insert(key, entry);
    }

    pub fn get(&self, key: &TileKey) -> Option<&CoordinateEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TileKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TileKey, &CoordinateEntry)> {
        self.entries.iter()
    }

    /// True when every entry shares the X/Y bounds of the first entry in canonical order.
    pub fn aligned(&self) -> bool {
        let mut entries = self.entries.values();
        match entries.next() {
            None => true,
            Some(first) => entries.all(|entry| entry.same_xy(first)),
        }
    }

    /// Table for a sliced stack.
    ///
    /// Entries outside the selector's categorical ranges are dropped. X and Y bounds
    /// are rescaled to the selected pixel range of a `tile_shape` (height, width)
    /// tile; Z bounds pass through.
    pub fn recompute_for_slice(&self, tile_shape: (usize, usize), selector: &Selector) -> Self {
        let (height, width) = tile_shape;
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| selector.matches_key(key))
            .map(|(key, entry)| {
                let mut entry = *entry;
                if let Some(indexer) = selector.get(Axis::X) {
                    (entry.x_min, entry.x_max) =
                        rescale_range(entry.x_min, entry.x_max, width, indexer);
                }
                if let Some(indexer) = selector.get(Axis::Y) {
                    (entry.y_min, entry.y_max) =
                        rescale_range(entry.y_min, entry.y_max, height, indexer);
                }
                (*key, entry)
            })
            .collect();
        Self { entries }
    }

    /// Bounds along `axis` of the single tile `selector` resolves to.
    pub fn tile_coordinates(
        &self,
        selector: &Selector,
        axis: PhysicalAxis,
    ) -> StackResult<(f64, f64)> {
        let mut matches = self
            .entries
            .iter()
            .filter(|(key, _)| selector.matches_key(key));
        match (matches.next(), matches.next()) {
            (Some((_, entry)), None) => Ok(entry.range(axis)),
            (None, _) => Err(StackError::lookup(format!(
                "selector {selector} matches no tile"
            ))),
            (Some(_), Some(_)) => Err(StackError::lookup(format!(
                "selector {selector} matches more than one tile"
            ))),
        }
    }

    /// Envelope of the given entries: smallest minima and largest maxima.
    pub fn merged<'a>(&self, keys: impl IntoIterator<Item = &'a TileKey>) -> Option<CoordinateEntry> {
        keys.into_iter()
            .filter_map(|key| self.entries.get(key))
            .copied()
            .reduce(|acc, entry| CoordinateEntry {
                x_min: acc.x_min.min(entry.x_min),
                x_max: acc.x_max.max(entry.x_max),
                y_min: acc.y_min.min(entry.y_min),
                y_max: acc.y_max.max(entry.y_max),
                z_min: nan_aware(acc.z_min, entry.z_min, f64::min),
                z_max: nan_aware(acc.z_max, entry.z_max, f64::max),
            })
    }
}

fn nan_aware(a: f64, b: f64, pick: fn(f64, f64) -> f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        pick(a, b)
    }
}

/// Maps a pixel indexer over `size` pixels spanning `[min, max]` to physical bounds.
fn rescale_range(min: f64, max: f64, size: usize, indexer: &Indexer) -> (f64, f64) {
    if size == 0 {
        return (min, max);
    }
    let (start, end) = match *indexer {
        Indexer::Pin(pixel) => (pixel.min(size), (pixel + 1).min(size)),
        Indexer::Range { start, stop } => (
            start.unwrap_or(0).min(size),
            stop.unwrap_or(size).min(size),
        ),
    };
    let pixel_size = (max - min) / size as f64;
    (
        min + start as f64 * pixel_size,
        min + end as f64 * pixel_size,
    )
}
