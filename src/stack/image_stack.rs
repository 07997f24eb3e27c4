use std::collections::BTreeMap;
use std::fmt::{self, Display};

use ndarray::{s, Array3, Array5, ArrayD, ArrayViewD, Axis as NdAxis, Ix5};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::axes::{canonical, Axis, PhysicalAxis, TileKey};
use super::coordinates::{CoordinateEntry, CoordinateTable};
use super::provenance::{arguments, OperationKind, ProvenanceLog};
use super::selector::{AxisIndex, Indexer, Selector};
use crate::error::{StackError, StackResult};
use crate::logging;
use crate::source::{self, ArrayTileSource, PixelType, SyntheticTileSource, TileSource};

/// Five-axis (round, ch, zplane, y, x) float32 image tensor assembled from tiles.
///
/// Every element lies in `[0, 1]`. The buffer, the coordinate table and the
/// provenance log form one value: cloning the stack deep-copies all of them.
#[derive(Clone, Debug)]
pub struct ImageStack {
    pub(crate) data: Array5<f32>,
    pub(crate) index: AxisIndex,
    pub(crate) coordinates: CoordinateTable,
    pub(crate) tiles_aligned: bool,
    pub(crate) log: ProvenanceLog,
    pub(crate) extras: Map<String, Value>,
    pub(crate) tile_extras: BTreeMap<TileKey, Map<String, Value>>,
}

impl ImageStack {
    /// Loads every tile of `source` into a new stack of `tile_height` x `tile_width` tiles.
    ///
    /// Tiles are visited once each in canonical order (round, then channel, then
    /// z-plane). Integer pixels are scaled into `[0, 1]`; float pixels outside that
    /// range fail with [`StackError::InvalidData`].
    pub fn new<S: TileSource + ?Sized>(
        tile_height: usize,
        tile_width: usize,
        source: &S,
    ) -> StackResult<Self> {
        let keys = source.keys();
        if keys.is_empty() {
            return Err(StackError::shape("tile source provides no tiles"));
        }
        let index = AxisIndex::from_keys(&keys, (tile_height, tile_width));
        let expected = index.keys();
        let mut provided = keys;
        provided.sort_unstable();
        provided.dedup();
        if provided != expected {
            return Err(StackError::shape(format!(
                "tile source provides {} distinct tiles but its axis labels span {}",
                provided.len(),
                expected.len()
            )));
        }

        let extras = source.extras();
        let log = match extras.get(source::STACK_EXTRAS_KEY) {
            Some(Value::String(text)) => ProvenanceLog::from_json(text)?,
            Some(other) => {
                return Err(StackError::invalid_data(format!(
                    "extras key {} must hold the provenance log as a JSON string, found {other}",
                    source::STACK_EXTRAS_KEY
                )))
            }
            None => ProvenanceLog::new(),
        };

        let [n_round, n_ch, n_z, _, _] = index.raw_shape();
        let mut data = Array5::<f32>::zeros((n_round, n_ch, n_z, tile_height, tile_width));
        let mut coordinates = CoordinateTable::new();
        let mut tile_extras = BTreeMap::new();

        for (position, key) in expected.iter().enumerate() {
            let tile = source.get_tile(*key)?;
            if tile.pixels.shape() != (tile_height, tile_width) {
                return Err(StackError::shape(format!(
                    "tile {key} has shape {:?}, expected ({tile_height}, {tile_width})",
                    tile.pixels.shape()
                )));
            }
            let pixels = tile.pixels.to_float32()?;

            let z = position % n_z;
            let c = (position / n_z) % n_ch;
            let r = position / (n_z * n_ch);
            data.slice_mut(s![r, c, z, .., ..]).assign(&pixels);

            coordinates.insert(*key, CoordinateEntry::from(tile.coordinates));
            tile_extras.insert(*key, tile.extras);
        }

        let stack = Self::from_parts(data, index, coordinates, log, extras, tile_extras);
        stack.log_stats("construct");
        Ok(stack)
    }

    /// Builds a stack from a (round, ch, zplane, y, x) array.
    ///
    /// Non-float32 input is converted with a warning. `labels` gives the
    /// (round, ch, zplane) labels in position order; `coordinates` defaults to a
    /// placeholder extent for every tile.
    pub fn from_array<T: PixelType>(
        array: Array5<T>,
        labels: Option<[Vec<usize>; 3]>,
        coordinates: Option<CoordinateTable>,
    ) -> StackResult<Self> {
        if T::DTYPE != f32::DTYPE {
            tracing::warn!(dtype = T::DTYPE, "image stack data is not float32, converting");
        }
        let data = source::to_unit_float(array.view())?;
        let (_, _, _, height, width) = data.dim();
        let source = ArrayTileSource::new(data, labels, coordinates)?;
        Self::new(height, width, &source)
    }

    /// All-ones stack labelled `0..n` on every categorical axis.
    pub fn synthetic_stack(
        num_round: usize,
        num_ch: usize,
        num_z: usize,
        tile_height: usize,
        tile_width: usize,
    ) -> StackResult<Self> {
        let source = SyntheticTileSource {
            num_round,
            num_ch,
            num_z,
            tile_height,
            tile_width,
        };
        Self::new(tile_height, tile_width, &source)
    }

    pub(crate) fn from_parts(
        data: Array5<f32>,
        index: AxisIndex,
        coordinates: CoordinateTable,
        log: ProvenanceLog,
        extras: Map<String, Value>,
        tile_extras: BTreeMap<TileKey, Map<String, Value>>,
    ) -> Self {
        let tiles_aligned = coordinates.aligned();
        Self {
            data,
            index,
            coordinates,
            tiles_aligned,
            log,
            extras,
            tile_extras,
        }
    }

    /// Read view of the selected region and the axes it keeps, in canonical order.
    pub fn slice_view(&self, selector: &Selector) -> StackResult<(ArrayViewD<'_, f32>, Vec<Axis>)> {
        let expr = self.index.resolve(selector)?;
        let view = expr.view(self.data.view().into_dyn());
        Ok((view, expr.surviving_axes()))
    }

    /// Owned copy of the selected region and the axes it keeps, in canonical order.
    pub fn get_slice(&self, selector: &Selector) -> StackResult<(ArrayD<f32>, Vec<Axis>)> {
        let (view, axes) = self.slice_view(selector)?;
        Ok((view.to_owned(), axes))
    }

    /// Writes `data` into the selected region.
    ///
    /// The last two axes of `data` are (Y, X); `axes` names its leading axes in
    /// any order and they are permuted into canonical order before writing.
    pub fn set_slice(
        &mut self,
        selector: &Selector,
        data: ArrayViewD<'_, f32>,
        axes: &[Axis],
    ) -> StackResult<()> {
        validate_unit_range(&data)?;
        let expr = self.index.resolve(selector)?;

        if data.ndim() < 2 || axes.len() != data.ndim() - 2 {
            return Err(StackError::shape(format!(
                "data shape {:?} should be the axes {:?} followed by (y, x)",
                data.shape(),
                axes
            )));
        }

        let leading: Vec<Axis> = expr
            .surviving_axes()
            .into_iter()
            .filter(|axis| axis.is_categorical())
            .collect();
        for (idx, axis) in axes.iter().enumerate() {
            if !leading.contains(axis) || axes[..idx].contains(axis) {
                return Err(StackError::shape(format!(
                    "unexpected axis {axis}, expecting only {leading:?}"
                )));
            }
        }

        let mut permutation: Vec<usize> = leading
            .iter()
            .filter_map(|axis| axes.iter().position(|a| a == axis))
            .collect();
        permutation.extend([data.ndim() - 2, data.ndim() - 1]);
        let data = data.permuted_axes(permutation);

        let mut destination = expr.view_mut(self.data.view_mut().into_dyn());
        if destination.shape() != data.shape() {
            return Err(StackError::shape(format!(
                "source shape {:?} mismatches destination shape {:?}",
                data.shape(),
                destination.shape()
            )));
        }
        destination.assign(&data);
        Ok(())
    }

    /// New stack restricted to `selector`; pinned axes are kept with one label.
    ///
    /// Physical coordinates are recomputed for the selected pixel range.
    pub fn sel(&self, selector: &Selector) -> StackResult<Self> {
        let expr = self.index.resolve(selector)?;
        let data = expr
            .region(self.data.view().into_dyn())
            .to_owned()
            .into_dimensionality::<Ix5>()
            .map_err(|err| StackError::shape(err.to_string()))?;
        let index = self.index.restrict(&expr);
        let coordinates = self
            .coordinates
            .recompute_for_slice(self.tile_shape(), selector);
        let tile_extras = self
            .tile_extras
            .iter()
            .filter(|(key, _)| selector.matches_key(key))
            .map(|(key, extras)| (*key, extras.clone()))
            .collect();

        let mut log = self.log.clone();
        log.record(
            OperationKind::Select,
            arguments(json!({ "selector": serde_json::to_value(selector)? })),
        );

        let stack = Self::from_parts(data, index, coordinates, log, self.extras.clone(), tile_extras);
        stack.log_stats("sel");
        Ok(stack)
    }

    /// Maximum projection over `axes`; projected axes are kept with length one.
    ///
    /// A projected categorical axis keeps its first label and the coordinates of
    /// the merged tiles are combined into their envelope.
    pub fn max_proj(&self, axes: &[Axis]) -> StackResult<Self> {
        let axes = canonical(axes);
        let mut data = self.data.clone();
        for axis in &axes {
            data = data
                .fold_axis(NdAxis(axis.order()), 0.0f32, |acc, &value| acc.max(value))
                .insert_axis(NdAxis(axis.order()));
        }

        let projected = |key: &TileKey| {
            let mut key = *key;
            for axis in &axes {
                let first = self.index.label_at(*axis, 0);
                match axis {
                    Axis::Round => key.round = first,
                    Axis::Ch => key.ch = first,
                    Axis::ZPlane => key.zplane = first,
                    Axis::Y | Axis::X => {}
                }
            }
            key
        };

        let mut groups: BTreeMap<TileKey, Vec<TileKey>> = BTreeMap::new();
        for key in self.coordinates.keys() {
            groups.entry(projected(key)).or_default().push(*key);
        }
        let mut coordinates = CoordinateTable::new();
        for (target, members) in &groups {
            if let Some(entry) = self.coordinates.merged(members) {
                coordinates.insert(*target, entry);
            }
        }

        let keep = |axis: Axis| -> Vec<usize> {
            if axes.contains(&axis) {
                vec![self.index.label_at(axis, 0)]
            } else {
                self.index.labels(axis)
            }
        };
        let (_, _, _, height, width) = data.dim();
        let index = AxisIndex::new(
            keep(Axis::Round),
            keep(Axis::Ch),
            keep(Axis::ZPlane),
            (height, width),
        );
        let tile_extras = groups
            .keys()
            .map(|key| (*key, self.tile_extras.get(key).cloned().unwrap_or_default()))
            .collect();

        let mut log = self.log.clone();
        log.record(
            OperationKind::MaxProjection,
            arguments(json!({ "axes": axes })),
        );

        let stack = Self::from_parts(data, index, coordinates, log, self.extras.clone(), tile_extras);
        stack.log_stats("max_proj");
        Ok(stack)
    }

    /// Buffer with the given length-one axes removed.
    pub fn squeezed(&self, axes: &[Axis]) -> StackResult<ArrayD<f32>> {
        let mut view = self.data.view().into_dyn();
        for axis in canonical(axes).into_iter().rev() {
            let len = self.index.len(axis);
            if len != 1 {
                return Err(StackError::shape(format!(
                    "cannot squeeze axis {axis} of length {len}"
                )));
            }
            view = view.index_axis_move(NdAxis(axis.order()), 0);
        }
        Ok(view.to_owned())
    }

    /// One row per tile with its labels, barcode index and extras.
    pub fn tile_metadata(&self) -> StackResult<Vec<TileMetadata>> {
        let mut rows = Vec::with_capacity(self.tile_extras.len());
        for key in self.index.keys() {
            let extras = self.tile_extras.get(&key).cloned().unwrap_or_default();
            if let Some(axis) = Axis::CATEGORICAL.iter().find(|a| extras.contains_key(a.name())) {
                return Err(StackError::invalid_data(format!(
                    "extras of tile {key} duplicate the axis key {axis}"
                )));
            }
            let barcode_index = extras
                .get("barcode_index")
                .and_then(Value::as_u64)
                .map(|value| value as usize)
                .unwrap_or_else(|| {
                    ((key.zplane * self.num_rounds() + key.round) * self.num_chs()) + key.ch
                });
            rows.push(TileMetadata {
                round: key.round,
                ch: key.ch,
                zplane: key.zplane,
                barcode_index,
                extras,
            });
        }
        Ok(rows)
    }

    /// Linearised `(n_tiles, y, x)` copy of a slice with one label per tile.
    ///
    /// `scaling` optionally rescales intensities between the 0.5th and 99.5th
    /// percentiles, or clips them to percentile bounds.
    pub fn linear_view(
        &self,
        selector: &Selector,
        scaling: &ViewScaling,
    ) -> StackResult<(Array3<f32>, Vec<String>)> {
        if scaling.rescale && (scaling.p_min.is_some() || scaling.p_max.is_some()) {
            return Err(StackError::config(
                "select one of rescale and p_min/p_max to rescale image, not both",
            ));
        }
        for p in [scaling.p_min, scaling.p_max].into_iter().flatten() {
            if !(0.0..=100.0).contains(&p) {
                return Err(StackError::config(format!("percentile {p} outside [0, 100]")));
            }
        }

        if let Some(axis) = [Axis::Y, Axis::X]
            .into_iter()
            .find(|axis| selector.get(*axis).map_or(false, Indexer::is_pin))
        {
            return Err(StackError::shape(format!(
                "linear view needs whole (y, x) planes, the selector pins axis {axis}"
            )));
        }
        let (data, axes) = self.get_slice(selector)?;
        if data.ndim() < 3 {
            return Err(StackError::shape(format!(
                "a stack with dimensionality >= 3 is required, the selector produced shape {:?}",
                data.shape()
            )));
        }
        let (height, width) = (data.shape()[data.ndim() - 2], data.shape()[data.ndim() - 1]);
        let n_tiles: usize = data.shape()[..data.ndim() - 2].iter().product();

        let expr = self.index.resolve(selector)?;
        let restricted = self.index.restrict(&expr);
        let mut labels = vec![String::new()];
        for axis in axes.iter().filter(|axis| axis.is_categorical()) {
            labels = labels
                .iter()
                .flat_map(|prefix| {
                    restricted.labels(*axis).into_iter().map(move |label| {
                        if prefix.is_empty() {
                            format!("{axis}{label}")
                        } else {
                            format!("{prefix} {axis}{label}")
                        }
                    })
                })
                .collect();
        }

        let mut linear = data
            .as_standard_layout()
            .into_owned()
            .into_shape((n_tiles, height, width))
            .map_err(|err| StackError::shape(err.to_string()))?;

        if scaling.rescale {
            let (vmin, vmax) = percentiles(&linear, 0.5, 99.5);
            let span = vmax - vmin;
            if span > f32::EPSILON {
                linear.par_mapv_inplace(|value| ((value - vmin) / span).clamp(0.0, 1.0));
            }
        } else if scaling.p_min.is_some() || scaling.p_max.is_some() {
            let (a_min, a_max) = percentiles(
                &linear,
                scaling.p_min.unwrap_or(0.0),
                scaling.p_max.unwrap_or(100.0),
            );
            linear.par_mapv_inplace(|value| value.clamp(a_min, a_max));
        }

        Ok((linear, labels))
    }

    /// Records a pipeline component in the provenance log.
    pub fn update_log(&mut self, component: &str, parameters: Map<String, Value>) {
        self.log
            .record(OperationKind::Component(component.to_string()), parameters);
    }

    pub fn log(&self) -> &ProvenanceLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut ProvenanceLog {
        &mut self.log
    }

    pub fn data(&self) -> &Array5<f32> {
        &self.data
    }

    pub fn coordinates(&self) -> &CoordinateTable {
        &self.coordinates
    }

    pub fn tile_coordinates(&self, selector: &Selector, axis: PhysicalAxis) -> StackResult<(f64, f64)> {
        self.coordinates.tile_coordinates(selector, axis)
    }

    pub fn tiles_aligned(&self) -> bool {
        self.tiles_aligned
    }

    pub fn extras(&self) -> &Map<String, Value> {
        &self.extras
    }

    pub fn axis_labels(&self, axis: Axis) -> Vec<usize> {
        self.index.labels(axis)
    }

    pub fn axis_index(&self) -> &AxisIndex {
        &self.index
    }

    pub fn raw_shape(&self) -> (usize, usize, usize, usize, usize) {
        self.data.dim()
    }

    /// Per-axis sizes in canonical order.
    pub fn shape(&self) -> Vec<(Axis, usize)> {
        Axis::ALL
            .iter()
            .map(|axis| (*axis, self.index.len(*axis)))
            .collect()
    }

    pub fn num_rounds(&self) -> usize {
        self.index.len(Axis::Round)
    }

    pub fn num_chs(&self) -> usize {
        self.index.len(Axis::Ch)
    }

    pub fn num_zplanes(&self) -> usize {
        self.index.len(Axis::ZPlane)
    }

    pub fn tile_shape(&self) -> (usize, usize) {
        self.index.tile_shape()
    }

    pub fn statistics(&self) -> StackStatistics {
        let element_count = self.data.len();
        if element_count == 0 {
            return StackStatistics {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                element_count,
            };
        }
        let min = self.data.par_iter().cloned().reduce(|| f32::INFINITY, f32::min);
        let max = self
            .data
            .par_iter()
            .cloned()
            .reduce(|| f32::NEG_INFINITY, f32::max);
        let sum = self.data.par_iter().map(|value| *value as f64).sum::<f64>();
        StackStatistics {
            min,
            max,
            mean: (sum / element_count as f64) as f32,
            element_count,
        }
    }

    pub(crate) fn log_stats(&self, operation: &str) {
        if !logging::enabled() {
            return;
        }
        if let Err(err) = logging::log_operation(operation, &self.statistics()) {
            tracing::warn!(operation, %err, "failed to log stack operation");
        }
    }
}

impl Display for ImageStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = self
            .shape()
            .iter()
            .map(|(axis, size)| format!("{axis}: {size}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "<ImageStack ({shape})>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StackStatistics {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub element_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileMetadata {
    pub round: usize,
    pub ch: usize,
    pub zplane: usize,
    pub barcode_index: usize,
    pub extras: Map<String, Value>,
}

/// Intensity scaling for [`ImageStack::linear_view`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewScaling {
    pub rescale: bool,
    pub p_min: Option<f32>,
    pub p_max: Option<f32>,
}

pub(crate) fn validate_unit_range(data: &ArrayViewD<'_, f32>) -> StackResult<()> {
    if data.clone().into_par_iter().any(|value| !(0.0..=1.0).contains(value)) {
        return Err(StackError::invalid_data(
            "image stack data must be float32 in the range [0, 1]",
        ));
    }
    Ok(())
}

/// Two percentiles of `data` with linear interpolation between ranks.
fn percentiles(data: &Array3<f32>, low: f32, high: f32) -> (f32, f32) {
    let mut values: Vec<f32> = data.iter().copied().collect();
    values.par_sort_unstable_by(|a, b| a.total_cmp(b));
    (percentile(&values, low), percentile(&values, high))
}

fn percentile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q / 100.0) * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Tile, TileCoordinates, TilePixels};
    use approx::assert_relative_eq;
    use ndarray::{Array2, ArrayD, IxDyn};

    /// Tiles filled with `round / 2`, with per-tile coordinates.
    struct RoundSource {
        rounds: usize,
        chs: usize,
        zplanes: usize,
        shift_tile: Option<TileKey>,
    }

    impl TileSource for RoundSource {
        fn keys(&self) -> Vec<TileKey> {
            let mut keys = Vec::new();
            for r in 0..self.rounds {
                for c in 0..self.chs {
                    for z in 0..self.zplanes {
                        keys.push(TileKey::new(r, c, z));
                    }
                }
            }
            keys
        }

        fn get_tile(&self, key: TileKey) -> StackResult<Tile> {
            let pixels = Array2::from_elem((10, 10), key.round as f32 / 2.0);
            let x_shift = if Some(key) == self.shift_tile { 1.0 } else { 0.0 };
            let mut extras = Map::new();
            extras.insert("exposure".into(), json!(key.ch * 10));
            Ok(Tile::new(
                TilePixels::F32(pixels),
                TileCoordinates {
                    x: (x_shift, 10.0 + x_shift),
                    y: (0.0, 10.0),
                    z: Some((key.zplane as f64, key.zplane as f64 + 1.0)),
                },
            )
            .with_extras(extras))
        }
    }

    fn round_stack(rounds: usize) -> ImageStack {
        let source = RoundSource {
            rounds,
            chs: 3,
            zplanes: 1,
            shift_tile: None,
        };
        ImageStack::new(10, 10, &source).unwrap()
    }

    #[test]
    fn get_slice_by_channel_and_zplane() {
        let stack = round_stack(2);
        let selector = Selector::new().with(Axis::ZPlane, 0).with(Axis::Ch, 1);
        let (data, axes) = stack.get_slice(&selector).unwrap();
        assert_eq!(data.shape(), &[2, 10, 10]);
        assert_eq!(axes, vec![Axis::Round, Axis::Y, Axis::X]);
        assert!(data.index_axis(NdAxis(0), 0).iter().all(|v| *v == 0.0));
        assert!(data.index_axis(NdAxis(0), 1).iter().all(|v| *v == 0.5));
    }

    #[test]
    fn construction_records_alignment() {
        assert!(round_stack(2).tiles_aligned());
        let shifted = RoundSource {
            rounds: 2,
            chs: 3,
            zplanes: 1,
            shift_tile: Some(TileKey::new(1, 2, 0)),
        };
        let stack = ImageStack::new(10, 10, &shifted).unwrap();
        assert!(!stack.tiles_aligned());
    }

    #[test]
    fn construction_rejects_wrong_tile_shape() {
        let source = RoundSource {
            rounds: 1,
            chs: 1,
            zplanes: 1,
            shift_tile: None,
        };
        let err = ImageStack::new(8, 10, &source).unwrap_err();
        assert!(matches!(err, StackError::Shape { .. }));
    }

    #[test]
    fn construction_rejects_out_of_range_tiles() {
        let source = RoundSource {
            rounds: 4,
            chs: 1,
            zplanes: 1,
            shift_tile: None,
        };
        // round 3 is filled with 1.5
        let err = ImageStack::new(10, 10, &source).unwrap_err();
        assert!(matches!(err, StackError::InvalidData { .. }));
    }

    #[test]
    fn set_slice_reorders_axes() {
        let mut stack = ImageStack::synthetic_stack(3, 4, 5, 20, 10).unwrap();
        let mut data = ArrayD::<f32>::zeros(IxDyn(&[4, 3, 20, 10]));
        data.index_axis_mut(NdAxis(0), 2).fill(0.25);
        let selector = Selector::new().with(Axis::ZPlane, 2);
        stack
            .set_slice(&selector, data.view(), &[Axis::Ch, Axis::Round])
            .unwrap();

        let (written, axes) = stack.get_slice(&selector).unwrap();
        assert_eq!(axes, vec![Axis::Round, Axis::Ch, Axis::Y, Axis::X]);
        assert_eq!(written.shape(), &[3, 4, 20, 10]);
        assert!(written.index_axis(NdAxis(1), 2).iter().all(|v| *v == 0.25));
        assert!(written.index_axis(NdAxis(1), 0).iter().all(|v| *v == 0.0));

        let (untouched, _) = stack
            .get_slice(&Selector::new().with(Axis::ZPlane, 1))
            .unwrap();
        assert!(untouched.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn set_then_get_round_trips_with_ranges() {
        let mut stack = ImageStack::synthetic_stack(3, 4, 5, 20, 10).unwrap();
        let data = ArrayD::<f32>::from_shape_fn(IxDyn(&[3, 2, 20, 10]), |idx| {
            (idx[0] * 2 + idx[1]) as f32 / 10.0
        });
        let selector = Selector::new().with(Axis::ZPlane, 4).with(Axis::Ch, 2..4);
        stack
            .set_slice(&selector, data.view(), &[Axis::Round, Axis::Ch])
            .unwrap();
        let (read, _) = stack.get_slice(&selector).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn set_slice_validates_range_and_leaves_store_unchanged() {
        let mut stack = ImageStack::synthetic_stack(1, 1, 1, 4, 4).unwrap();
        let selector = Selector::for_tile(TileKey::new(0, 0, 0));
        let bad = ArrayD::<f32>::from_elem(IxDyn(&[4, 4]), 1.5);
        let err = stack.set_slice(&selector, bad.view(), &[]).unwrap_err();
        assert!(matches!(err, StackError::InvalidData { .. }));
        let nan = ArrayD::<f32>::from_elem(IxDyn(&[4, 4]), f32::NAN);
        assert!(stack.set_slice(&selector, nan.view(), &[]).is_err());
        assert!(stack.data().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn set_slice_validates_axes_and_shape() {
        let mut stack = ImageStack::synthetic_stack(2, 2, 1, 4, 4).unwrap();
        let selector = Selector::new().with(Axis::ZPlane, 0);

        let data = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 4, 4]));
        let err = stack.set_slice(&selector, data.view(), &[Axis::Round]).unwrap_err();
        assert!(matches!(err, StackError::Shape { .. }));

        let err = stack
            .set_slice(&selector, data.view(), &[Axis::Round, Axis::ZPlane])
            .unwrap_err();
        assert!(matches!(err, StackError::Shape { .. }));

        let err = stack
            .set_slice(&selector, data.view(), &[Axis::Round, Axis::Round])
            .unwrap_err();
        assert!(matches!(err, StackError::Shape { .. }));

        let wrong_tile = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 4, 3]));
        let err = stack
            .set_slice(&selector, wrong_tile.view(), &[Axis::Round, Axis::Ch])
            .unwrap_err();
        assert!(matches!(err, StackError::Shape { .. }));
    }

    #[test]
    fn sel_drops_rounds_and_coordinates() {
        let four = ImageStack::synthetic_stack(4, 2, 1, 6, 6).unwrap();
        let selected = four.sel(&Selector::new().with(Axis::Round, 1..)).unwrap();
        assert_eq!(selected.num_rounds(), 3);
        assert_eq!(selected.axis_labels(Axis::Round), vec![1, 2, 3]);
        assert_eq!(selected.coordinates().len(), 6);
        assert!(selected.coordinates().keys().all(|key| key.round >= 1));
        assert_eq!(selected.log().len(), four.log().len() + 1);
        assert_eq!(four.num_rounds(), 4);
    }

    #[test]
    fn sel_recomputes_pixel_coordinates() {
        let stack = round_stack(1);
        let selected = stack
            .sel(&Selector::new().with(Axis::Ch, 0).with(Axis::X, 2..6))
            .unwrap();
        assert_eq!(selected.raw_shape(), (1, 1, 1, 10, 4));
        let x = selected
            .tile_coordinates(&Selector::for_tile(TileKey::new(0, 0, 0)), PhysicalAxis::X)
            .unwrap();
        assert_relative_eq!(x.0, 2.0);
        assert_relative_eq!(x.1, 6.0);
        assert_eq!(selected.to_string(), "<ImageStack (r: 1, c: 1, z: 1, y: 10, x: 4)>");
    }

    #[test]
    fn max_projection_over_rounds() {
        let stack = round_stack(3);
        let projected = stack.max_proj(&[Axis::Round]).unwrap();
        assert_eq!(projected.raw_shape(), (1, 3, 1, 10, 10));
        assert!(projected.data().iter().all(|v| *v == 1.0));
        assert_eq!(projected.coordinates().len(), 3);
        assert_eq!(projected.axis_labels(Axis::Round), vec![0]);
        assert_eq!(
            projected.log().entries().last().unwrap().method,
            OperationKind::MaxProjection
        );
        assert_eq!(stack.raw_shape(), (3, 3, 1, 10, 10));
    }

    #[test]
    fn squeeze_removes_unit_axes() {
        let stack = round_stack(2);
        let squeezed = stack.squeezed(&[Axis::ZPlane]).unwrap();
        assert_eq!(squeezed.shape(), &[2, 3, 10, 10]);
        assert!(stack.squeezed(&[Axis::Round]).is_err());
    }

    #[test]
    fn tile_metadata_rows() {
        let stack = round_stack(2);
        let rows = stack.tile_metadata().unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[4].round, 1);
        assert_eq!(rows[4].ch, 1);
        assert_eq!(rows[4].barcode_index, 4);
        assert_eq!(rows[4].extras["exposure"], json!(10));
    }

    #[test]
    fn linear_view_rejects_conflicting_scaling() {
        let stack = round_stack(2);
        let scaling = ViewScaling {
            rescale: true,
            p_min: Some(1.0),
            p_max: None,
        };
        let err = stack.linear_view(&Selector::new(), &scaling).unwrap_err();
        assert!(matches!(err, StackError::Config { .. }));
    }

    #[test]
    fn linear_view_labels_and_rescales() {
        let stack = round_stack(2);
        let scaling = ViewScaling {
            rescale: true,
            ..ViewScaling::default()
        };
        let (linear, labels) = stack
            .linear_view(&Selector::new().with(Axis::ZPlane, 0), &scaling)
            .unwrap();
        assert_eq!(linear.dim(), (6, 10, 10));
        assert_eq!(labels[0], "r0 c0");
        assert_eq!(labels[5], "r1 c2");
        assert!(linear.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(linear[[5, 0, 0]], 1.0);

        let pinned = Selector::for_tile(TileKey::new(0, 0, 0));
        assert!(stack.linear_view(&pinned, &ViewScaling::default()).is_err());
    }

    #[test]
    fn linear_view_rejects_pinned_pixels() {
        let stack = round_stack(2);
        let row = Selector::new().with(Axis::Y, 3);
        let err = stack.linear_view(&row, &ViewScaling::default()).unwrap_err();
        assert!(matches!(err, StackError::Shape { .. }));

        let column = Selector::new().with(Axis::ZPlane, 0).with(Axis::X, 0);
        let err = stack.linear_view(&column, &ViewScaling::default()).unwrap_err();
        assert!(matches!(err, StackError::Shape { .. }));

        let cropped = Selector::new().with(Axis::ZPlane, 0).with(Axis::X, 2..5);
        let (linear, _) = stack.linear_view(&cropped, &ViewScaling::default()).unwrap();
        assert_eq!(linear.dim(), (6, 10, 3));
    }

    #[test]
    fn non_string_provenance_extras_are_rejected() {
        let data = Array5::<f32>::zeros((1, 1, 1, 2, 2));
        let mut extras = Map::new();
        extras.insert(source::STACK_EXTRAS_KEY.into(), json!({ "log": [] }));
        let source = ArrayTileSource::new(data, None, None)
            .unwrap()
            .with_extras(extras);
        let err = ImageStack::new(2, 2, &source).unwrap_err();
        assert!(matches!(err, StackError::InvalidData { .. }));
    }

    #[test]
    fn unit_range_check_covers_views() {
        let data = ArrayD::<f32>::from_shape_fn(IxDyn(&[3, 4]), |idx| idx[1] as f32 / 4.0);
        assert!(validate_unit_range(&data.view()).is_ok());
        let mut bad = data.clone();
        bad[[2, 3]] = -0.1;
        let err = validate_unit_range(&bad.view()).unwrap_err();
        assert!(matches!(err, StackError::InvalidData { .. }));
    }

    #[test]
    fn from_array_converts_integers() {
        let array = Array5::<u16>::from_elem((1, 2, 1, 3, 3), u16::MAX);
        let stack = ImageStack::from_array(array, None, None).unwrap();
        assert!(stack.data().iter().all(|v| *v == 1.0));
        assert_eq!(stack.axis_labels(Axis::Ch), vec![0, 1]);
    }

    #[test]
    fn clone_is_deep() {
        let stack = round_stack(2);
        let mut copy = stack.clone();
        copy.update_log("Clip", Map::new());
        let tile = ArrayD::<f32>::zeros(IxDyn(&[10, 10]));
        copy.set_slice(&Selector::for_tile(TileKey::new(1, 0, 0)), tile.view(), &[])
            .unwrap();
        assert!(stack.log().is_empty());
        let (original, _) = stack
            .get_slice(&Selector::for_tile(TileKey::new(1, 0, 0)))
            .unwrap();
        assert!(original.iter().all(|v| *v == 0.5));
    }

    #[test]
    fn statistics_summarise_buffer() {
        let stats = round_stack(2).statistics();
        assert_eq!(stats.element_count, 600);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 0.5);
        assert_relative_eq!(stats.mean, 0.25);
    }
}
