//! Selector algebra: named-axis indexers resolved into buffer positions.
//!
//! A [`Selector`] maps axes to either a pinned label or a label range. Pinned
//! axes disappear from the result; omitted axes keep their full range. Labels on
//! ROUND/CH/ZPLANE are the stack's axis labels, labels on Y/X are pixel offsets.
//! Ranges are half-open: `start <= label < stop`.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use ndarray::{ArrayViewD, ArrayViewMutD, Axis as NdAxis, Slice};
use serde::{Deserialize, Serialize};

use super::axes::{Axis, TileKey, N_AXES};
use crate::error::{StackError, StackResult};

/// Value bound to one axis of a selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indexer {
    /// Selects a single label and drops the axis.
    Pin(usize),
    /// Keeps the axis restricted to labels in `[start, stop)`; `None` is unbounded.
    Range {
        start: Option<usize>,
        stop: Option<usize>,
    },
}

impl Indexer {
    pub fn range(start: Option<usize>, stop: Option<usize>) -> Self {
        Indexer::Range { start, stop }
    }

    pub fn full() -> Self {
        Indexer::Range {
            start: None,
            stop: None,
        }
    }

    pub fn is_pin(&self) -> bool {
        matches!(self, Indexer::Pin(_))
    }

    fn contains(&self, label: usize) -> bool {
        match *self {
            Indexer::Pin(value) => value == label,
            Indexer::Range { start, stop } => {
                start.map_or(true, |s| label >= s) && stop.map_or(true, |s| label < s)
            }
        }
    }
}

impl From<usize> for Indexer {
    fn from(value: usize) -> Self {
        Indexer::Pin(value)
    }
}

impl From<Range<usize>> for Indexer {
    fn from(value: Range<usize>) -> Self {
        Indexer::range(Some(value.start), Some(value.end))
    }
}

impl From<RangeFrom<usize>> for Indexer {
    fn from(value: RangeFrom<usize>) -> Self {
        Indexer::range(Some(value.start), None)
    }
}

impl From<RangeTo<usize>> for Indexer {
    fn from(value: RangeTo<usize>) -> Self {
        Indexer::range(None, Some(value.end))
    }
}

impl From<RangeFull> for Indexer {
    fn from(_: RangeFull) -> Self {
        Indexer::full()
    }
}

impl Display for Indexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Indexer::Pin(value) => write!(f, "{value}"),
            Indexer::Range { start, stop } => {
                if let Some(start) = start {
                    write!(f, "{start}")?;
                }
                f.write_str("..")?;
                if let Some(stop) = stop {
                    write!(f, "{stop}")?;
                }
                Ok(())
            }
        }
    }
}

/// Mapping from axes to indexers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    entries: BTreeMap<Axis, Indexer>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Selector::insert`].
    pub fn with(mut self, axis: Axis, indexer: impl Into<Indexer>) -> Self {
        self.insert(axis, indexer);
        self
    }

    pub fn insert(&mut self, axis: Axis, indexer: impl Into<Indexer>) {
        self.entries.insert(axis, indexer.into());
    }

    pub fn get(&self, axis: Axis) -> Option<&Indexer> {
        self.entries.get(&axis)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Axis, &Indexer)> {
        self.entries.iter().map(|(axis, indexer)| (*axis, indexer))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Selector pinning all three categorical axes to `key`.
    pub fn for_tile(key: TileKey) -> Self {
        Self::new()
            .with(Axis::Round, key.round)
            .with(Axis::Ch, key.ch)
            .with(Axis::ZPlane, key.zplane)
    }

    /// Axes that remain after applying this selector, in canonical order.
    pub fn surviving_axes(&self) -> Vec<Axis> {
        Axis::ALL
            .iter()
            .copied()
            .filter(|axis| !self.get(*axis).map_or(false, Indexer::is_pin))
            .collect()
    }

    /// Whether the categorical labels of `key` satisfy this selector.
    pub fn matches_key(&self, key: &TileKey) -> bool {
        Axis::CATEGORICAL.iter().all(|axis| match (self.get(*axis), key.label(*axis)) {
            (Some(indexer), Some(label)) => indexer.contains(label),
            _ => true,
        })
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (axis, indexer)) in self.entries.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{axis}: {indexer}")?;
        }
        f.write_str("}")
    }
}

/// Positional slice of one buffer axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AxisSlice {
    Index(usize),
    Range { start: usize, end: usize },
}

impl AxisSlice {
    pub fn bounds(&self) -> (usize, usize) {
        match *self {
            AxisSlice::Index(idx) => (idx, idx + 1),
            AxisSlice::Range { start, end } => (start, end),
        }
    }
}

/// A selector resolved against a concrete stack: one positional slice per axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceExpr {
    slices: [AxisSlice; N_AXES],
}

impl SliceExpr {
    pub fn get(&self, axis: Axis) -> AxisSlice {
        self.slices[axis.order()]
    }

    pub fn surviving_axes(&self) -> Vec<Axis> {
        Axis::ALL
            .iter()
            .copied()
            .filter(|axis| matches!(self.get(*axis), AxisSlice::Range { .. }))
            .collect()
    }

    /// Shape of the selected region with pinned axes removed.
    pub fn shape(&self) -> Vec<usize> {
        self.slices
            .iter()
            .filter_map(|slice| match *slice {
                AxisSlice::Index(_) => None,
                AxisSlice::Range { start, end } => Some(end - start),
            })
            .collect()
    }

    pub fn view<'a>(&self, full: ArrayViewD<'a, f32>) -> ArrayViewD<'a, f32> {
        let mut view = full;
        // Walk from the last axis so earlier axis numbers stay valid after collapsing.
        for order in (0..N_AXES).rev() {
            match self.slices[order] {
                AxisSlice::Index(idx) => view = view.index_axis_move(NdAxis(order), idx),
                AxisSlice::Range { start, end } => {
                    view.slice_axis_inplace(NdAxis(order), Slice::from(start..end))
                }
            }
        }
        view
    }

    /// Like [`SliceExpr::view`] but pinned axes are kept with length one.
    pub fn region<'a>(&self, full: ArrayViewD<'a, f32>) -> ArrayViewD<'a, f32> {
        let mut view = full;
        for (order, slice) in self.slices.iter().enumerate() {
            let (start, end) = slice.bounds();
            view.slice_axis_inplace(NdAxis(order), Slice::from(start..end));
        }
        view
    }

    pub fn view_mut<'a>(&self, full: ArrayViewMutD<'a, f32>) -> ArrayViewMutD<'a, f32> {
        let mut view = full;
        for order in (0..N_AXES).rev() {
            match self.slices[order] {
                AxisSlice::Index(idx) => view = view.index_axis_move(NdAxis(order), idx),
                AxisSlice::Range { start, end } => {
                    view.slice_axis_inplace(NdAxis(order), Slice::from(start..end))
                }
            }
        }
        view
    }
}

/// Label tables and tile extent of a stack; resolves selectors to buffer positions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisIndex {
    round: Vec<usize>,
    ch: Vec<usize>,
    zplane: Vec<usize>,
    tile_shape: (usize, usize),
}

impl AxisIndex {
    /// Builds the index from label lists; labels are sorted and deduplicated.
    pub fn new(
        round: Vec<usize>,
        ch: Vec<usize>,
        zplane: Vec<usize>,
        tile_shape: (usize, usize),
    ) -> Self {
        let normalise = |mut labels: Vec<usize>| {
            labels.sort_unstable();
            labels.dedup();
            labels
        };
        Self {
            round: normalise(round),
            ch: normalise(ch),
            zplane: normalise(zplane),
            tile_shape,
        }
    }

    pub fn from_keys<'a>(
        keys: impl IntoIterator<Item = &'a TileKey>,
        tile_shape: (usize, usize),
    ) -> Self {
        let (mut round, mut ch, mut zplane) = (Vec::new(), Vec::new(), Vec::new());
        for key in keys {
            round.push(key.round);
            ch.push(key.ch);
            zplane.push(key.zplane);
        }
        Self::new(round, ch, zplane, tile_shape)
    }

    pub fn tile_shape(&self) -> (usize, usize) {
        self.tile_shape
    }

    pub fn len(&self, axis: Axis) -> usize {
        match axis {
            Axis::Round => self.round.len(),
            Axis::Ch => self.ch.len(),
            Axis::ZPlane => self.zplane.len(),
            Axis::Y => self.tile_shape.0,
            Axis::X => self.tile_shape.1,
        }
    }

    pub fn raw_shape(&self) -> [usize; N_AXES] {
        Axis::ALL.map(|axis| self.len(axis))
    }

    /// Labels of an axis: stored labels for categorical axes, pixel offsets for Y/X.
    pub fn labels(&self, axis: Axis) -> Vec<usize> {
        match axis {
            Axis::Round => self.round.clone(),
            Axis::Ch => self.ch.clone(),
            Axis::ZPlane => self.zplane.clone(),
            Axis::Y | Axis::X => (0..self.len(axis)).collect(),
        }
    }

    pub fn label_at(&self, axis: Axis, position: usize) -> usize {
        match axis {
            Axis::Round => self.round[position],
            Axis::Ch => self.ch[position],
            Axis::ZPlane => self.zplane[position],
            Axis::Y | Axis::X => position,
        }
    }

    /// All tile keys in canonical nested order (round slowest).
    pub fn keys(&self) -> Vec<TileKey> {
        let mut keys = Vec::with_capacity(self.round.len() * self.ch.len() * self.zplane.len());
        for &round in &self.round {
            for &ch in &self.ch {
                for &zplane in &self.zplane {
                    keys.push(TileKey::new(round, ch, zplane));
                }
            }
        }
        keys
    }

    fn position(&self, axis: Axis, label: usize) -> StackResult<usize> {
        match axis {
            Axis::Y | Axis::X => {
                if label < self.len(axis) {
                    Ok(label)
                } else {
                    Err(StackError::lookup(format!(
                        "pixel {label} out of range for axis {axis} of size {}",
                        self.len(axis)
                    )))
                }
            }
            _ => {
                let labels = self.categorical(axis);
                labels.binary_search(&label).map_err(|_| {
                    StackError::lookup(format!("label {label} not present on axis {axis}"))
                })
            }
        }
    }

    fn categorical(&self, axis: Axis) -> &[usize] {
        match axis {
            Axis::Round => &self.round,
            Axis::Ch => &self.ch,
            _ => &self.zplane,
        }
    }

    fn range_positions(
        &self,
        axis: Axis,
        start: Option<usize>,
        stop: Option<usize>,
    ) -> StackResult<(usize, usize)> {
        let (lo, hi) = match axis {
            Axis::Y | Axis::X => {
                let len = self.len(axis);
                (start.unwrap_or(0).min(len), stop.unwrap_or(len).min(len))
            }
            _ => {
                let labels = self.categorical(axis);
                let lo = start.map_or(0, |s| labels.partition_point(|l| *l < s));
                let hi = stop.map_or(labels.len(), |s| labels.partition_point(|l| *l < s));
                (lo, hi)
            }
        };
        if lo >= hi {
            return Err(StackError::lookup(format!(
                "range {} selects nothing on axis {axis}",
                Indexer::range(start, stop)
            )));
        }
        Ok((lo, hi))
    }

    /// Resolves `selector` into positional slices; omitted axes keep their full extent.
    pub fn resolve(&self, selector: &Selector) -> StackResult<SliceExpr> {
        let mut slices = [AxisSlice::Range { start: 0, end: 0 }; N_AXES];
        for axis in Axis::ALL {
            slices[axis.order()] = match selector.get(axis) {
                None => AxisSlice::Range {
                    start: 0,
                    end: self.len(axis),
                },
                Some(Indexer::Pin(label)) => AxisSlice::Index(self.position(axis, *label)?),
                Some(Indexer::Range { start, stop }) => {
                    let (start, end) = self.range_positions(axis, *start, *stop)?;
                    AxisSlice::Range { start, end }
                }
            };
        }
        Ok(SliceExpr { slices })
    }

    /// Index restricted to the labels a resolved slice keeps; pinned axes keep one label.
    pub fn restrict(&self, expr: &SliceExpr) -> Self {
        let keep = |axis: Axis| -> Vec<usize> {
            let (start, end) = expr.get(axis).bounds();
            (start..end).map(|pos| self.label_at(axis, pos)).collect()
        };
        let span = |axis: Axis| {
            let (start, end) = expr.get(axis).bounds();
            end - start
        };
        Self {
            round: keep(Axis::Round),
            ch: keep(Axis::Ch),
            zplane: keep(Axis::ZPlane),
            tile_shape: (span(Axis::Y), span(Axis::X)),
        }
    }

    /// Enumerates one pinning selector per combination of labels on `axes`.
    ///
    /// Axes are visited in canonical order with the first one varying slowest.
    pub fn iter_axes(&self, axes: &[Axis]) -> Vec<Selector> {
        let ordered = super::axes::canonical(axes);
        let mut selectors = vec![Selector::new()];
        for axis in ordered {
            let labels = self.labels(axis);
            let mut next = Vec::with_capacity(selectors.len() * labels.len());
            for selector in &selectors {
                for label in &labels {
                    next.push(selector.clone().with(axis, *label));
                }
            }
            selectors = next;
        }
        selectors
    }
}
