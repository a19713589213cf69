// ========================================================================================
//
//                     DISTRIBUTED DENSE LINEAR ALGEBRA PRIMITIVES
//
// ========================================================================================
//
// Vectors are flat row-major `N x D` buffers replicated on every process. A
// primitive computes the rows (or the partial sum) owned by each worker thread,
// merges the thread results inside the process, then all-reduces across
// processes so every rank ends up with the same global value.
//
// Multiply: threads write disjoint row chunks of a zeroed buffer, so the thread
// merge is a concatenation and the process reduce is a sum in which every row
// has exactly one non-zero contributor.
//
// Inner product: each thread returns its partial sum in its own slot, the
// slots are added in thread-id order, then the per-process scalars are summed.

use crate::parallel::ParallelContext;
use crate::shared::{DistanceBlock, WeightMatrix};
use crate::timing::{Phase, PhaseTimer, timed};
use crate::types::DamdsError;
use itertools::izip;
use std::ops::Range;

/// Anything that can produce rows of `M x` for the rows a worker owns.
pub trait RowKernel: Sync {
    /// Writes rows `rows` of `M x` into `out` (`rows.len() x width`). `x` is
    /// the full replicated `N x width` operand.
    fn apply_rows(&self, rows: Range<usize>, x: &[f64], width: usize, out: &mut [f64]);
}

/// Distributed `out = M x`, replicated on every process.
pub fn multiply(
    ctx: &ParallelContext,
    kernel: &dyn RowKernel,
    x: &[f64],
    width: usize,
    out: &mut [f64],
    phase: Phase,
    timer: &dyn PhaseTimer,
) -> Result<(), DamdsError> {
    debug_assert_eq!(x.len(), out.len());
    out.fill(0.0);
    let rows = ctx.process_rows();
    let block = &mut out[rows.start * width..rows.end * width];
    ctx.for_each_thread_rows(block, width, |unit, chunk| {
        timed(timer, phase, unit.index, || {
            kernel.apply_rows(unit.rows.clone(), x, width, chunk)
        })
    });
    timed(timer, Phase::Communication, 0, || ctx.all_reduce_sum(out))
}

/// Distributed `a . b` over flat `N x width` buffers.
pub fn inner_product(
    ctx: &ParallelContext,
    a: &[f64],
    b: &[f64],
    width: usize,
    timer: &dyn PhaseTimer,
) -> Result<f64, DamdsError> {
    let partials = ctx.for_each_thread(|unit| {
        timed(timer, Phase::CgInnerProduct, unit.index, || {
            let span = unit.rows.start * width..unit.rows.end * width;
            a[span.clone()]
                .iter()
                .zip(&b[span])
                .map(|(x, y)| x * y)
                .sum::<f64>()
        })
    });
    let local: f64 = partials.iter().sum();
    timed(timer, Phase::Communication, 0, || ctx.all_reduce_scalar(local))
}

/// `out += scale * v`, applied to the full replicated buffer.
pub fn axpy(out: &mut [f64], scale: f64, v: &[f64]) {
    for (o, x) in out.iter_mut().zip(v) {
        *o += scale * x;
    }
}

/// The operator `V + 1 1^T`, where `V` is the weighted Laplacian of the
/// effective weights: off-diagonal `-w_ij`, diagonal `sum_{j != i} w_ij`.
///
/// A row of the product is `sum_j w_ij (x_i - x_j) + sum_j x_j`, evaluated in
/// one pass over the row. Entries whose distance is missing have weight 0.
pub struct WeightedLaplacian<'a> {
    distances: &'a DistanceBlock,
    weights: &'a WeightMatrix,
    block_size: usize,
}

impl<'a> WeightedLaplacian<'a> {
    pub fn new(distances: &'a DistanceBlock, weights: &'a WeightMatrix, block_size: usize) -> Self {
        Self {
            distances,
            weights,
            block_size: block_size.max(1),
        }
    }

    #[inline]
    fn effective_weight(&self, row: usize, col: usize, q: i16) -> f64 {
        if row == col || q < 0 {
            0.0
        } else {
            self.weights.weight(row, col)
        }
    }
}

impl RowKernel for WeightedLaplacian<'_> {
    fn apply_rows(&self, rows: Range<usize>, x: &[f64], width: usize, out: &mut [f64]) {
        let points = self.distances.points();
        out.fill(0.0);
        // Column tiles keep a slab of `x` hot while every owned row visits it.
        for tile_start in (0..points).step_by(self.block_size) {
            let tile = tile_start..(tile_start + self.block_size).min(points);
            for (row, acc) in rows.clone().zip(out.chunks_exact_mut(width)) {
                let xi = &x[row * width..(row + 1) * width];
                let quantized = &self.distances.row(row)[tile.clone()];
                for (col, &q) in tile.clone().zip(quantized) {
                    let w = self.effective_weight(row, col, q);
                    let xj = &x[col * width..(col + 1) * width];
                    for (a, &xik, &xjk) in izip!(acc.iter_mut(), xi, xj) {
                        *a += w * (xik - xjk) + xjk;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessLayout;
    use crate::parallel::SelfComm;
    use crate::shared::Quantizer;
    use crate::timing::NoopTimer;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn context(points: usize, threads: usize) -> ParallelContext {
        ParallelContext::from_layout(
            Box::new(SelfComm),
            points,
            points * 2,
            &ProcessLayout::single_process(threads),
            "linalg",
        )
        .unwrap()
    }

    #[test]
    fn laplacian_matches_dense_product() {
        let n = 5;
        let mut delta = Array2::from_shape_fn((n, n), |(i, j)| if i == j { 0.0 } else { 0.5 });
        delta[[1, 3]] = -1.0;
        delta[[3, 1]] = -1.0;
        let distances = DistanceBlock::from_matrix(delta.view(), 0..n, Quantizer::new(1.0), None);
        let weights = WeightMatrix::Uniform(2.0);

        let mut dense = Array2::<f64>::from_elem((n, n), 1.0);
        for i in 0..n {
            for j in 0..n {
                if i != j && delta[[i, j]] >= 0.0 {
                    dense[[i, j]] -= 2.0;
                    dense[[i, i]] += 2.0;
                }
            }
        }

        let x: Vec<f64> = (0..n * 2).map(|k| (k as f64 * 0.37).sin()).collect();
        let xs = Array2::from_shape_vec((n, 2), x.clone()).unwrap();
        let expected = dense.dot(&xs);

        let ctx = context(n, 2);
        for block_size in [1, 2, 64] {
            let kernel = WeightedLaplacian::new(&distances, &weights, block_size);
            let mut out = vec![0.0; n * 2];
            multiply(&ctx, &kernel, &x, 2, &mut out, Phase::CgMultiply, &NoopTimer).unwrap();
            for (got, want) in out.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn inner_product_sums_every_row() {
        let ctx = context(7, 3);
        let a: Vec<f64> = (0..14).map(|k| k as f64).collect();
        let b = vec![2.0; 14];
        let dot = inner_product(&ctx, &a, &b, 2, &NoopTimer).unwrap();
        assert_abs_diff_eq!(dot, 2.0 * 91.0, epsilon = 1e-12);
    }

    #[test]
    fn axpy_scales_and_adds() {
        let mut out = vec![1.0, 2.0];
        axpy(&mut out, -0.5, &[2.0, 2.0]);
        assert_eq!(out, vec![0.0, 1.0]);
    }
}
