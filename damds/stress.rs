use crate::bofz::{point_distance, temperature_shift};
use crate::parallel::ParallelContext;
use crate::shared::{DistanceBlock, WeightMatrix};
use crate::timing::{Phase, PhaseTimer, timed};
use crate::types::DamdsError;

/// Normalized weighted stress
/// `sum w_ij (dhat_ij - d_ij(X))^2 / sum w_ij delta_ij^2`.
///
/// The denominator uses the raw distances and is computed once per run. At
/// T = 0 `dhat = delta` and this is the plain normalized stress. Missing or
/// zero-weight pairs drop out of both sums.
pub struct StressEvaluator<'a> {
    distances: &'a DistanceBlock,
    weights: &'a WeightMatrix,
    inv_sum_of_squares: f64,
}

impl<'a> StressEvaluator<'a> {
    /// Collective: reduces the denominator over every process.
    pub fn new(
        ctx: &ParallelContext,
        distances: &'a DistanceBlock,
        weights: &'a WeightMatrix,
    ) -> Result<Self, DamdsError> {
        let partials = ctx.for_each_thread(|unit| {
            let mut sum = 0.0;
            for row in unit.rows.clone() {
                for (col, &q) in distances.row(row).iter().enumerate() {
                    if col == row {
                        continue;
                    }
                    if let Some(delta) = distances.delta(q) {
                        sum += weights.weight(row, col) * delta * delta;
                    }
                }
            }
            sum
        });
        let total = ctx.all_reduce_scalar(partials.iter().sum())?;
        if !(total > 0.0) {
            return Err(DamdsError::DegenerateInput(
                "every weighted distance is zero or missing".to_string(),
            ));
        }
        Ok(Self {
            distances,
            weights,
            inv_sum_of_squares: 1.0 / total,
        })
    }

    /// Stress of the replicated configuration `x` at `temperature`, the same
    /// value on every process.
    pub fn evaluate(
        &self,
        ctx: &ParallelContext,
        x: &[f64],
        width: usize,
        temperature: f64,
        timer: &dyn PhaseTimer,
    ) -> Result<f64, DamdsError> {
        let shift = temperature_shift(temperature, width);
        let partials = ctx.for_each_thread(|unit| {
            timed(timer, Phase::StressInternal, unit.index, || {
                let mut sum = 0.0;
                for row in unit.rows.clone() {
                    for (col, &q) in self.distances.row(row).iter().enumerate() {
                        if col == row {
                            continue;
                        }
                        let Some(delta) = self.distances.delta(q) else {
                            continue;
                        };
                        let w = self.weights.weight(row, col);
                        if w == 0.0 {
                            continue;
                        }
                        let target = (delta - shift).max(0.0);
                        let diff = target - point_distance(x, width, row, col);
                        sum += w * diff * diff;
                    }
                }
                sum
            })
        });
        let local: f64 = partials.iter().sum();
        let total = timed(timer, Phase::Communication, 0, || ctx.all_reduce_scalar(local))?;
        Ok(total * self.inv_sum_of_squares)
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
            "stress",
        )
        .unwrap()
    }

    fn pairwise(x: &[f64], n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(i, j)| point_distance(x, 2, i, j))
    }

    #[test]
    fn exact_configuration_has_zero_stress() {
        let x = vec![0.0, 0.0, 0.5, 0.0, 0.5, 0.5, 0.0, 0.5];
        let delta = pairwise(&x, 4);
        let distances = DistanceBlock::from_matrix(delta.view(), 0..4, Quantizer::new(1.0), None);
        let weights = WeightMatrix::Uniform(1.0);
        let ctx = context(4, 2);
        let stress = StressEvaluator::new(&ctx, &distances, &weights).unwrap();
        let value = stress.evaluate(&ctx, &x, 2, 0.0, &NoopTimer).unwrap();
        assert_abs_diff_eq!(value, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn missing_pairs_are_excluded() {
        let x = vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0];
        let mut delta = pairwise(&x, 3);
        // Wildly wrong, but masked out.
        delta[[0, 2]] = -1.0;
        delta[[2, 0]] = -1.0;
        let distances = DistanceBlock::from_matrix(delta.view(), 0..3, Quantizer::new(4.0), None);
        let ctx = context(3, 1);
        let stress = StressEvaluator::new(&ctx, &distances, &WeightMatrix::Uniform(1.0)).unwrap();
        let value = stress.evaluate(&ctx, &x, 2, 0.0, &NoopTimer).unwrap();
        assert_abs_diff_eq!(value, 0.0, epsilon = 1e-8);

        let scaled: Vec<f64> = x.iter().map(|v| v * 2.0).collect();
        // Each kept pair is off by its own length: numerator equals denominator.
        let value = stress.evaluate(&ctx, &scaled, 2, 0.0, &NoopTimer).unwrap();
        assert_abs_diff_eq!(value, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn zero_dense_weights_are_excluded() {
        let x = vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0];
        let mut delta = pairwise(&x, 3);
        // Present but wrong; only the weight hides it.
        delta[[0, 2]] = 3.5;
        delta[[2, 0]] = 3.5;
        let distances = DistanceBlock::from_matrix(delta.view(), 0..3, Quantizer::new(4.0), None);
        let mut values = vec![i16::MAX; 9];
        values[2] = 0;
        values[6] = 0;
        let weights = WeightMatrix::Dense {
            rows: 0..3,
            points: 3,
            values,
        };
        let ctx = context(3, 1);
        let stress = StressEvaluator::new(&ctx, &distances, &weights).unwrap();
        let value = stress.evaluate(&ctx, &x, 2, 0.0, &NoopTimer).unwrap();
        assert_abs_diff_eq!(value, 0.0, epsilon = 1e-8);

        let scaled: Vec<f64> = x.iter().map(|v| v * 2.0).collect();
        let value = stress.evaluate(&ctx, &scaled, 2, 0.0, &NoopTimer).unwrap();
        assert_abs_diff_eq!(value, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn all_missing_is_degenerate() {
        let delta = Array2::from_elem((3, 3), -1.0);
        let distances = DistanceBlock::from_matrix(delta.view(), 0..3, Quantizer::new(1.0), None);
        let ctx = context(3, 1);
        assert!(matches!(
            StressEvaluator::new(&ctx, &distances, &WeightMatrix::Uniform(1.0)),
            Err(DamdsError::DegenerateInput(_))
        ));
    }
}
