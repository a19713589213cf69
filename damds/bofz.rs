use crate::linalg::RowKernel;
use crate::parallel::ParallelContext;
use crate::shared::{DistanceBlock, WeightMatrix};
use crate::timing::{Phase, PhaseTimer, timed};
use std::ops::Range;

/// Point distances at or below this are treated as coincident points.
pub const DISTANCE_EPSILON: f64 = 1e-10;
/// Temperatures at or below this count as zero.
pub const TEMPERATURE_EPSILON: f64 = 1e-10;

/// How far the annealing temperature pulls every target distance in:
/// `sqrt(2D) * T`, or 0 once the temperature is effectively zero.
pub fn temperature_shift(temperature: f64, dimension: usize) -> f64 {
    if temperature > TEMPERATURE_EPSILON {
        (2.0 * dimension as f64).sqrt() * temperature
    } else {
        0.0
    }
}

/// Euclidean distance between rows `i` and `j` of a flat `N x width` buffer.
#[inline]
pub fn point_distance(x: &[f64], width: usize, i: usize, j: usize) -> f64 {
    let xi = &x[i * width..(i + 1) * width];
    let xj = &x[j * width..(j + 1) * width];
    xi.iter()
        .zip(xj)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt()
}

/// The process's row block of the majorization matrix `B(Z)`.
///
/// Off-diagonal entries are `-w_ij * dhat_ij / d_ij(X)` with
/// `dhat_ij = max(delta_ij - shift(T), 0)`; they are 0 when the pair is
/// missing, unweighted, or the two points coincide. The diagonal holds the
/// negated sum of the row's off-diagonal entries. The buffer is allocated once
/// and rebuilt in place every iteration.
pub struct BoundMatrix {
    rows: Range<usize>,
    points: usize,
    values: Vec<f64>,
    block_size: usize,
}

impl BoundMatrix {
    pub fn new(rows: Range<usize>, points: usize, block_size: usize) -> Self {
        Self {
            values: vec![0.0; rows.len() * points],
            rows,
            points,
            block_size: block_size.max(1),
        }
    }

    /// Entry `(row, col)`; `row` must be owned by this block.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[(row - self.rows.start) * self.points + col]
    }

    /// Recomputes every owned row from the current configuration `x`, each
    /// worker thread filling the rows it owns.
    pub fn build(
        &mut self,
        ctx: &ParallelContext,
        distances: &DistanceBlock,
        weights: &WeightMatrix,
        x: &[f64],
        width: usize,
        temperature: f64,
        timer: &dyn PhaseTimer,
    ) {
        let shift = temperature_shift(temperature, width);
        let points = self.points;
        ctx.for_each_thread_rows(&mut self.values, points, |unit, chunk| {
            timed(timer, Phase::BofZ, unit.index, || {
                for (row, out) in unit.rows.clone().zip(chunk.chunks_exact_mut(points)) {
                    let mut row_sum = 0.0;
                    for (col, (b, &q)) in out.iter_mut().zip(distances.row(row)).enumerate() {
                        *b = 0.0;
                        if col == row {
                            continue;
                        }
                        let Some(delta) = distances.delta(q) else {
                            continue;
                        };
                        let w = weights.weight(row, col);
                        let target = (delta - shift).max(0.0);
                        let d = point_distance(x, width, row, col);
                        if w > 0.0 && target > 0.0 && d > DISTANCE_EPSILON {
                            *b = -w * target / d;
                            row_sum += *b;
                        }
                    }
                    out[row] = -row_sum;
                }
            })
        });
    }
}

impl RowKernel for BoundMatrix {
    fn apply_rows(&self, rows: Range<usize>, x: &[f64], width: usize, out: &mut [f64]) {
        out.fill(0.0);
        for tile_start in (0..self.points).step_by(self.block_size) {
            let tile = tile_start..(tile_start + self.block_size).min(self.points);
            for (row, acc) in rows.clone().zip(out.chunks_exact_mut(width)) {
                let local = (row - self.rows.start) * self.points;
                let coefficients = &self.values[local + tile.start..local + tile.end];
                for (col, &b) in tile.clone().zip(coefficients) {
                    if b == 0.0 {
                        continue;
                    }
                    let xj = &x[col * width..(col + 1) * width];
                    for (a, &v) in acc.iter_mut().zip(xj) {
                        *a += b * v;
                    }
                }
            }
        }
    }
}
