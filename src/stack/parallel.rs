//! Parallel apply/transform engine.
//!
//! The stack is split along a caller-chosen set of axes into one block per label
//! combination. `transform` hands each worker a read-only view; `apply` hands each
//! worker a mutable view carved out of the single backing buffer with
//! `split_at`, so blocks are disjoint by construction and no locking is needed.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Axis as NdAxis};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde_json::json;

use super::axes::{canonical, Axis};
use super::image_stack::{validate_unit_range, ImageStack};
use super::provenance::{arguments, OperationKind};
use super::selector::Selector;
use crate::config::{default_workers, StackConfig};
use crate::error::{StackError, StackResult, TaskError};

/// How a parallel call splits the stack and how many workers run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub group_by: Vec<Axis>,
    pub n_workers: usize,
    pub verbose: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            group_by: Axis::CATEGORICAL.to_vec(),
            n_workers: default_workers(),
            verbose: false,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &StackConfig) -> Self {
        Self {
            n_workers: config.n_workers.max(1),
            verbose: config.verbose,
            ..Self::default()
        }
    }

    pub fn with_group_by(mut self, axes: &[Axis]) -> Self {
        self.group_by = axes.to_vec();
        self
    }

    pub fn with_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers.max(1);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl ImageStack {
    /// Runs `func` once per block and returns its results paired with the block's
    /// selector, in enumeration order.
    pub fn transform<R, F>(&self, func: F, options: &EngineOptions) -> StackResult<Vec<(R, Selector)>>
    where
        R: Send,
        F: Fn(ArrayViewD<'_, f32>) -> Result<R, TaskError> + Sync,
    {
        let selectors = self.index.iter_axes(&options.group_by);
        dispatch(options, selectors, |selector| {
            let (view, _) = self.slice_view(&selector)?;
            let value = guarded(&selector, || func(view))?;
            Ok((value, selector))
        })
    }

    /// Returns a copy of the stack with every block replaced by `func(block)`.
    ///
    /// The receiver is left untouched, including when a task fails.
    pub fn apply<F>(&self, func: F, options: &EngineOptions) -> StackResult<ImageStack>
    where
        F: Fn(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, TaskError> + Sync,
    {
        let mut copy = self.clone();
        copy.apply_in_place(func, options)?;
        Ok(copy)
    }

    /// Replaces every block with `func(block)` in the shared buffer.
    ///
    /// Results must match the block shape and lie in `[0, 1]`. After an error
    /// some blocks may already have been written.
    pub fn apply_in_place<F>(&mut self, func: F, options: &EngineOptions) -> StackResult<()>
    where
        F: Fn(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, TaskError> + Sync,
    {
        let group_by = canonical(&options.group_by);
        let selectors = self.index.iter_axes(&group_by);
        let blocks = split_blocks(self.data.view_mut().into_dyn(), &group_by);
        debug_assert_eq!(selectors.len(), blocks.len());

        let work: Vec<(Selector, ArrayViewMutD<'_, f32>)> =
            selectors.into_iter().zip(blocks).collect();
        dispatch(options, work, |(selector, mut block)| {
            let result = guarded(&selector, || func(block.view()))?;
            if result.shape() != block.shape() {
                return Err(StackError::shape(format!(
                    "function returned shape {:?} for block {selector} of shape {:?}",
                    result.shape(),
                    block.shape()
                )));
            }
            validate_unit_range(&result.view())?;
            block.assign(&result);
            Ok(())
        })?;

        self.log.record(
            OperationKind::Apply,
            arguments(json!({ "group_by": group_by, "n_workers": options.n_workers })),
        );
        self.log_stats("apply");
        Ok(())
    }
}

/// Mutable block views for every label combination of `group_by`, in the same
/// order as [`super::selector::AxisIndex::iter_axes`].
///
/// `group_by` must be canonical. Grouped axes are moved to the front and peeled
/// off one position at a time, so each block keeps the remaining axes in
/// canonical order.
fn split_blocks<'a>(view: ArrayViewMutD<'a, f32>, group_by: &[Axis]) -> Vec<ArrayViewMutD<'a, f32>> {
    let mut order: Vec<usize> = group_by.iter().map(|axis| axis.order()).collect();
    order.extend(
        Axis::ALL
            .iter()
            .filter(|axis| !group_by.contains(axis))
            .map(|axis| axis.order()),
    );
    let mut blocks = Vec::new();
    split_leading(view.permuted_axes(order), group_by.len(), &mut blocks);
    blocks
}

fn split_leading<'a>(
    view: ArrayViewMutD<'a, f32>,
    depth: usize,
    out: &mut Vec<ArrayViewMutD<'a, f32>>,
) {
    if depth == 0 {
        out.push(view);
        return;
    }
    let mut rest = view;
    while rest.len_of(NdAxis(0)) > 0 {
        let (head, tail) = rest.split_at(NdAxis(0), 1);
        split_leading(head.index_axis_move(NdAxis(0), 0), depth - 1, out);
        rest = tail;
    }
}

/// Runs `task` over `items` on a pool of `n_workers` threads and collects the
/// results in input order. The first error stops further dispatch.
fn dispatch<I, T, F>(options: &EngineOptions, items: Vec<I>, task: F) -> StackResult<Vec<T>>
where
    I: Send,
    T: Send,
    F: Fn(I) -> StackResult<T> + Sync,
{
    let total = items.len();
    let completed = AtomicUsize::new(0);
    let run = |item: I| {
        let result = task(item);
        if options.verbose {
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(done, total, "block finished");
        }
        result
    };

    if options.n_workers <= 1 {
        return items.into_iter().map(run).collect();
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(options.n_workers)
        .build()
        .map_err(|err| StackError::config(format!("failed to build worker pool: {err}")))?;
    pool.install(|| items.into_par_iter().map(run).collect())
}

/// Calls a user function, turning both its error and a panic into [`StackError::Worker`].
fn guarded<T>(selector: &Selector, task: impl FnOnce() -> Result<T, TaskError>) -> StackResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(StackError::worker(selector.to_string(), source)),
        Err(payload) => Err(StackError::worker(
            selector.to_string(),
            panic_message(payload).into(),
        )),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array5;

    fn gradient_stack() -> ImageStack {
        let data = Array5::from_shape_fn((2, 3, 2, 4, 5), |(r, c, z, y, x)| {
            ((r * 31 + c * 17 + z * 7 + y * 5 + x) % 50) as f32 / 50.0
        });
        ImageStack::from_array(data, None, None).unwrap()
    }

    fn options() -> EngineOptions {
        EngineOptions::default().with_workers(4)
    }

    #[test]
    fn identity_apply_is_bit_identical() {
        let mut stack = gradient_stack();
        let before = stack.data().clone();
        stack
            .apply_in_place(|block| Ok(block.to_owned()), &options())
            .unwrap();
        assert_eq!(stack.data(), &before);
        assert_eq!(stack.log().entries().last().unwrap().method, OperationKind::Apply);
    }

    #[test]
    fn apply_not_in_place_leaves_original() {
        let stack = gradient_stack();
        let zeroed = stack.apply(|block| Ok(&block * 0.0), &options()).unwrap();
        assert!(zeroed.data().iter().all(|v| *v == 0.0));
        assert!(stack.data().iter().any(|v| *v > 0.0));
        assert!(stack.log().is_empty());
        assert_eq!(zeroed.log().len(), 1);
    }

    #[test]
    fn blocks_follow_group_by() {
        let stack = ImageStack::synthetic_stack(2, 3, 2, 4, 5).unwrap();
        let opts = options().with_group_by(&[Axis::Ch, Axis::X]);
        let shapes = stack
            .transform(|block| Ok(block.shape().to_vec()), &opts)
            .unwrap();
        assert_eq!(shapes.len(), 15);
        assert!(shapes.iter().all(|(shape, _)| shape == &vec![2, 2, 4]));
        assert_eq!(shapes[0].1.to_string(), "{c: 0, x: 0}");
        assert_eq!(shapes[5].1.to_string(), "{c: 1, x: 0}");

        let mut stack = stack.apply(|block| Ok(&block * 0.5), &opts).unwrap();
        assert!(stack.data().iter().all(|v| *v == 0.5));
        stack
            .apply_in_place(|block| Ok(block.mapv(|v| v * 2.0)), &options().with_group_by(&[]))
            .unwrap();
        assert!(stack.data().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn transform_results_are_ordered() {
        let stack = gradient_stack();
        let opts = options().with_group_by(&[Axis::Round]);
        let sums = stack
            .transform(|block| Ok(block.sum()), &opts)
            .unwrap();
        assert_eq!(sums.len(), 2);
        for (round, (sum, selector)) in sums.iter().enumerate() {
            assert_eq!(selector, &Selector::new().with(Axis::Round, round));
            let (expected, _) = stack.get_slice(selector).unwrap();
            assert_eq!(*sum, expected.sum());
        }
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let stack = gradient_stack();
        let parallel = stack
            .transform(|block| Ok(block.sum()), &options())
            .unwrap();
        let sequential = stack
            .transform(|block| Ok(block.sum()), &options().with_workers(1))
            .unwrap();
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.len(), 12);
    }

    #[test]
    fn task_error_surfaces_with_selector() {
        let stack = gradient_stack();
        let err = stack
            .transform(
                |block| {
                    if block.iter().any(|v| *v > 0.9) {
                        Err("too bright".into())
                    } else {
                        Ok(())
                    }
                },
                &options(),
            )
            .unwrap_err();
        match err {
            StackError::Worker { source, .. } => assert_eq!(source.to_string(), "too bright"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn task_panic_becomes_worker_error() {
        let stack = gradient_stack();
        let err = stack
            .apply(
                |_block| -> Result<ArrayD<f32>, TaskError> { panic!("boom") },
                &options().with_workers(2),
            )
            .unwrap_err();
        assert!(matches!(err, StackError::Worker { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn apply_validates_results() {
        let stack = gradient_stack();
        let err = stack
            .apply(
                |block| Ok(block.slice_axis(NdAxis(1), ndarray::Slice::from(1..)).to_owned()),
                &options(),
            )
            .unwrap_err();
        assert!(matches!(err, StackError::Shape { .. }));

        let err = stack
            .apply(|block| Ok(&block + 2.0), &options())
            .unwrap_err();
        assert!(matches!(err, StackError::InvalidData { .. }));
    }

    #[test]
    fn options_from_config() {
        let config = StackConfig::from_str("[parallel]\nn_workers = 3\nverbose = true").unwrap();
        let options = EngineOptions::from_config(&config);
        assert_eq!(options.n_workers, 3);
        assert!(options.verbose);
        assert_eq!(options.group_by, Axis::CATEGORICAL.to_vec());
    }
}
