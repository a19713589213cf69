use crate::linalg::{RowKernel, axpy, inner_product, multiply};
use crate::parallel::ParallelContext;
use crate::timing::{Phase, PhaseTimer};
use crate::types::DamdsError;

/// A symmetric operator the solver can only reach through products and inner
/// products; it never sees the matrix itself.
pub trait DistributedOperator {
    fn apply(&self, x: &[f64], out: &mut [f64]) -> Result<(), DamdsError>;
    fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64, DamdsError>;
}

/// A row kernel applied with the distributed multiply and inner product.
pub struct DistributedSystem<'a> {
    pub ctx: &'a ParallelContext,
    pub kernel: &'a dyn RowKernel,
    pub width: usize,
    pub timer: &'a dyn PhaseTimer,
}

impl DistributedOperator for DistributedSystem<'_> {
    fn apply(&self, x: &[f64], out: &mut [f64]) -> Result<(), DamdsError> {
        multiply(self.ctx, self.kernel, x, self.width, out, Phase::CgMultiply, self.timer)
    }

    fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64, DamdsError> {
        inner_product(self.ctx, a, b, self.width, self.timer)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CgSettings {
    /// Stop once `|r| <= tolerance * |r0|`.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Stop early once `|r|^2` exceeds this multiple of the smallest value seen.
    pub divergence_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CgOutcome {
    pub iterations: usize,
    pub converged: bool,
    /// The divergence guard fired; `x` holds the best iterate seen.
    pub diverged: bool,
}

/// Solves `A x = b` by conjugate gradients, starting from the `x` passed in.
///
/// All the block's columns are solved as one system: inner products run over
/// every entry of the `N x D` buffers. Every quantity that steers the control
/// flow is the result of an all-reduce, so all processes take identical
/// branches.
pub fn solve(
    op: &dyn DistributedOperator,
    b: &[f64],
    x: &mut [f64],
    settings: CgSettings,
) -> Result<CgOutcome, DamdsError> {
    let mut ap = vec![0.0; x.len()];
    op.apply(x, &mut ap)?;
    let mut r: Vec<f64> = b.iter().zip(&ap).map(|(bi, ai)| bi - ai).collect();
    let mut rr = op.dot(&r, &r)?;
    let mut outcome = CgOutcome::default();
    if rr == 0.0 {
        outcome.converged = true;
        return Ok(outcome);
    }

    let target = settings.tolerance * settings.tolerance * rr;
    let mut p = r.clone();
    let mut best_rr = rr;
    let mut best_x = x.to_vec();

    for iteration in 1..=settings.max_iterations {
        op.apply(&p, &mut ap)?;
        let pap = op.dot(&p, &ap)?;
        if !(pap.is_finite() && pap > 0.0) {
            outcome.diverged = true;
            break;
        }
        let alpha = rr / pap;
        axpy(x, alpha, &p);
        axpy(&mut r, -alpha, &ap);
        let rr_next = op.dot(&r, &r)?;
        outcome.iterations = iteration;

        if !rr_next.is_finite() || rr_next > settings.divergence_factor * best_rr {
            outcome.diverged = true;
            break;
        }
        if rr_next < best_rr {
            best_rr = rr_next;
            best_x.copy_from_slice(x);
        }
        if rr_next <= target {
            outcome.converged = true;
            break;
        }

        let beta = rr_next / rr;
        for (pi, ri) in p.iter_mut().zip(&r) {
            *pi = ri + beta * *pi;
        }
        rr = rr_next;
    }

    if outcome.diverged {
        x.copy_from_slice(&best_x);
        log::debug!(
            "CG stopped by the divergence guard after {} iterations (best |r|^2 = {best_rr:e})",
            outcome.iterations
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// A dense matrix applied locally, for checking the recurrence itself.
    struct Dense(Array2<f64>);

    impl DistributedOperator for Dense {
        fn apply(&self, x: &[f64], out: &mut [f64]) -> Result<(), DamdsError> {
            let y = self.0.dot(&Array1::from(x.to_vec()));
            for (o, v) in out.iter_mut().zip(y.iter()) {
                *o = *v;
            }
            Ok(())
        }
        fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64, DamdsError> {
            Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
        }
    }

    fn spd(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let m = Array2::from_shape_fn((n, n), |_| rng.gen_range(-1.0..1.0));
        m.t().dot(&m) + Array2::<f64>::eye(n) * n as f64
    }

    #[test]
    fn converges_to_known_solution_within_n_iterations() {
        let n = 12;
        let a = spd(n, 7);
        let known: Vec<f64> = (0..n).map(|i| (i as f64 * 0.7).sin()).collect();
        let b = a.dot(&Array1::from(known.clone())).to_vec();
        let mut x = vec![0.0; n];
        let settings = CgSettings {
            tolerance: 1e-10,
            max_iterations: n,
            divergence_factor: 1e4,
        };
        let outcome = solve(&Dense(a), &b, &mut x, settings).unwrap();
        assert!(outcome.converged);
        assert!(outcome.iterations <= n);
        for (got, want) in x.iter().zip(&known) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-8);
        }
    }

    #[test]
    fn exact_start_returns_immediately() {
        let a = spd(4, 3);
        let x0 = vec![1.0, -2.0, 0.5, 3.0];
        let b = a.dot(&Array1::from(x0.clone())).to_vec();
        let mut x = x0.clone();
        let settings = CgSettings {
            tolerance: 1e-10,
            max_iterations: 10,
            divergence_factor: 1e4,
        };
        let outcome = solve(&Dense(a), &b, &mut x, settings).unwrap();
        assert_eq!(outcome.iterations, 0);
        assert_eq!(x, x0);
    }

    #[test]
    fn indefinite_operator_trips_the_guard() {
        let a = Array2::from_diag(&Array1::from(vec![1.0, -1.0]));
        let b = vec![1.0, 1.0];
        let mut x = vec![0.0, 0.0];
        let settings = CgSettings {
            tolerance: 1e-10,
            max_iterations: 50,
            divergence_factor: 1e4,
        };
        let outcome = solve(&Dense(a), &b, &mut x, settings).unwrap();
        assert!(outcome.diverged);
        assert!(!outcome.converged);
        assert!(x.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn iteration_cap_is_respected() {
        let n = 30;
        let a = spd(n, 11);
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        let settings = CgSettings {
            tolerance: 1e-300,
            max_iterations: 3,
            divergence_factor: 1e4,
        };
        let outcome = solve(&Dense(a), &b, &mut x, settings).unwrap();
        assert_eq!(outcome.iterations, 3);
        assert!(!outcome.converged);
    }
}
