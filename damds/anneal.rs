// ========================================================================================
//
//                   DETERMINISTIC ANNEALING OF STRESS MAJORIZATION
//
// ========================================================================================
//
// Every process runs this loop in lock-step. Each quantity that decides a
// branch (stress, CG residuals, the largest distance) comes out of an
// all-reduce and is therefore bit-identical on all ranks, so no extra
// coordination is needed to keep the control flow aligned.
//
//   Init -> TemperatureLoop(T0) -> TemperatureLoop(a*T0) -> ... -> FinalRefinement -> Done
//
// Inside a temperature: build B(Z), multiply B(Z) X, solve (V + 11^T) X' = B(Z) X
// by CG starting from X, re-evaluate stress, and stop once the relative change
// falls below the threshold or the iteration cap is reached.

use crate::bofz::{BoundMatrix, TEMPERATURE_EPSILON};
use crate::cg::{self, CgSettings, DistributedSystem};
use crate::config::DamdsConfig;
use crate::linalg::{WeightedLaplacian, multiply};
use crate::parallel::{ParallelContext, ReduceOp};
use crate::shared::{ByteOrder, DistanceBlock, Quantizer, WeightMatrix, open_source, read_points};
use crate::stress::StressEvaluator;
use crate::timing::{Phase, PhaseTimer, TimingRegistry, TimingSummary, timed};
use crate::types::{DamdsError, Points};
use log::{info, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Decides the temperature of each loop.
pub trait TemperatureSchedule {
    /// Temperature of the first loop, given `T_max = max delta / sqrt(2D)`.
    /// Returning 0 skips annealing and goes straight to the T = 0 pass.
    fn initial(&mut self, t_max: f64) -> f64;
    /// Temperature of the loop after one run at `current`. Returning 0 ends
    /// annealing with one final refinement pass at T = 0.
    fn next(&mut self, current: f64) -> f64;
}

/// `T0 = alpha * T_max`, `T(k+1) = alpha * T(k)`, until the next temperature
/// would drop below `t_min_factor * T_max`.
#[derive(Debug, Clone)]
pub struct GeometricSchedule {
    alpha: f64,
    t_min_factor: f64,
    enabled: bool,
    t_min: f64,
}

impl GeometricSchedule {
    pub fn new(alpha: f64, t_min_factor: f64) -> Self {
        Self {
            alpha,
            t_min_factor,
            enabled: true,
            t_min: 0.0,
        }
    }

    /// A schedule that runs plain SMACOF at T = 0.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(0.5, 0.5)
        }
    }

    pub fn from_config(config: &DamdsConfig) -> Self {
        if config.annealing {
            Self::new(config.alpha, config.t_min_factor)
        } else {
            Self::disabled()
        }
    }
}

impl TemperatureSchedule for GeometricSchedule {
    fn initial(&mut self, t_max: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.t_min = self.t_min_factor * t_max;
        self.alpha * t_max
    }

    fn next(&mut self, current: f64) -> f64 {
        let t = self.alpha * current;
        if t < self.t_min { 0.0 } else { t }
    }
}

/// Progress notifications of a solve.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnealEvent {
    Started {
        t_max: f64,
        initial_temperature: f64,
    },
    TemperatureStarted {
        loop_index: usize,
        temperature: f64,
        stress: f64,
    },
    Iteration {
        loop_index: usize,
        iteration: usize,
        stress: f64,
        cg_iterations: usize,
    },
    TemperatureFinished {
        loop_index: usize,
        temperature: f64,
        iterations: usize,
        stress: f64,
        converged: bool,
    },
    Finished {
        stress: f64,
    },
}

/// Observer for reporting progress while annealing.
pub trait AnnealObserver {
    fn on_event(&mut self, event: &AnnealEvent) {
        let _ = event;
    }
}

#[derive(Default)]
pub struct NoopAnnealObserver;

impl AnnealObserver for NoopAnnealObserver {}

/// Externally observable results of a solve, identical on every process.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub points: Points,
    /// Normalized stress of `points` at T = 0.
    pub stress: f64,
    pub t_max: f64,
    pub temperature_loops: usize,
    pub smacof_iterations: usize,
    pub cg_iterations: usize,
    /// Number of CG solves cut short by the divergence guard.
    pub cg_guard_trips: usize,
    pub timings: TimingSummary,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AnnealState {
    Init,
    TemperatureLoop(f64),
    FinalRefinement,
    Done,
}

/// One process's share of the solver: its rows of the distance and weight
/// matrices plus the run configuration.
pub struct DamdsSolver<'a> {
    ctx: &'a ParallelContext,
    config: &'a DamdsConfig,
    distances: DistanceBlock,
    weights: WeightMatrix,
}

impl<'a> DamdsSolver<'a> {
    pub fn new(
        ctx: &'a ParallelContext,
        config: &'a DamdsConfig,
        distances: DistanceBlock,
        weights: WeightMatrix,
    ) -> Result<Self, DamdsError> {
        if distances.points() != config.points || distances.rows() != ctx.process_rows() {
            return Err(DamdsError::DegenerateInput(format!(
                "distance block covers rows {:?} of {} points, expected rows {:?} of {}",
                distances.rows(),
                distances.points(),
                ctx.process_rows(),
                config.points
            )));
        }
        Ok(Self {
            ctx,
            config,
            distances,
            weights,
        })
    }

    /// Reads this process's rows of the distance and weight files.
    pub fn load(ctx: &'a ParallelContext, config: &'a DamdsConfig) -> Result<Self, DamdsError> {
        let order = ByteOrder::from_big_endian(config.big_endian);
        let rows = ctx.process_rows();
        let source = open_source(&config.distance_file)?;
        let distances = DistanceBlock::load(
            source.as_ref(),
            config.matrix_layout,
            order,
            config.points,
            rows.clone(),
            Quantizer::new(config.max_distance),
            config.distance_transform,
        )?;
        let weights = match &config.weight_file {
            Some(path) => {
                let source = open_source(path)?;
                WeightMatrix::load(source.as_ref(), config.matrix_layout, order, config.points, rows)?
            }
            None => WeightMatrix::Uniform(1.0),
        };
        Self::new(ctx, config, distances, weights)
    }

    /// The starting configuration: read from `initial_points_file` when set,
    /// otherwise uniform in `[0, 1)` from the configured seed. Identical on
    /// every process.
    pub fn initial_points(&self) -> Result<Vec<f64>, DamdsError> {
        let (n, d) = (self.config.points, self.config.target_dimension);
        if let Some(path) = &self.config.initial_points_file {
            return Ok(read_points(path, n, d)?.iter().copied().collect());
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        Ok((0..n * d).map(|_| rng.gen_range(0.0..1.0)).collect())
    }

    /// Runs the configured geometric schedule from the initial configuration.
    pub fn solve(&self, observer: &mut dyn AnnealObserver) -> Result<SolveOutcome, DamdsError> {
        let x = self.initial_points()?;
        let mut schedule = GeometricSchedule::from_config(self.config);
        self.solve_with(x, &mut schedule, observer)
    }

    pub fn solve_with(
        &self,
        mut x: Vec<f64>,
        schedule: &mut dyn TemperatureSchedule,
        observer: &mut dyn AnnealObserver,
    ) -> Result<SolveOutcome, DamdsError> {
        let (n, d) = (self.config.points, self.config.target_dimension);
        if x.len() != n * d {
            return Err(DamdsError::DegenerateInput(format!(
                "initial configuration has {} values, expected {n} x {d}",
                x.len()
            )));
        }

        let timer = TimingRegistry::new(self.ctx.thread_count());
        let stress = StressEvaluator::new(self.ctx, &self.distances, &self.weights)?;
        let laplacian = WeightedLaplacian::new(&self.distances, &self.weights, self.config.block_size);
        let mut majorizer = Majorizer {
            ctx: self.ctx,
            config: self.config,
            distances: &self.distances,
            weights: &self.weights,
            stress: &stress,
            system: DistributedSystem {
                ctx: self.ctx,
                kernel: &laplacian,
                width: d,
                timer: &timer,
            },
            bound: BoundMatrix::new(self.ctx.process_rows(), n, self.config.block_size),
            bc: vec![0.0; n * d],
            timer: &timer,
            totals: Totals::default(),
        };

        let mut largest = [self.distances.max_delta()];
        self.ctx.all_reduce(&mut largest, ReduceOp::Max)?;
        let t_max = largest[0] / (2.0 * d as f64).sqrt();
        let max_loops = self.config.max_temperature_loops;

        let mut state = AnnealState::Init;
        let mut loops = 0usize;
        timer.begin(Phase::TemperatureLoop, 0);
        while state != AnnealState::Done {
            state = match state {
                AnnealState::Init => {
                    let t0 = schedule.initial(t_max);
                    observer.on_event(&AnnealEvent::Started {
                        t_max,
                        initial_temperature: t0,
                    });
                    if self.ctx.is_root() {
                        info!("Annealing from T0 = {t0:.6e} (T_max = {t_max:.6e}) over {n} points in {d} dimensions");
                    }
                    if t0 > TEMPERATURE_EPSILON && max_loops > 1 {
                        AnnealState::TemperatureLoop(t0)
                    } else {
                        AnnealState::FinalRefinement
                    }
                }
                AnnealState::TemperatureLoop(t) => {
                    majorizer.run_temperature(loops, t, &mut x, observer)?;
                    loops += 1;
                    let next = schedule.next(t);
                    if loops + 1 >= max_loops || next <= TEMPERATURE_EPSILON {
                        AnnealState::FinalRefinement
                    } else {
                        AnnealState::TemperatureLoop(next)
                    }
                }
                AnnealState::FinalRefinement => {
                    majorizer.run_temperature(loops, 0.0, &mut x, observer)?;
                    loops += 1;
                    AnnealState::Done
                }
                AnnealState::Done => AnnealState::Done,
            };
        }
        timer.end(Phase::TemperatureLoop, 0);

        let final_stress = stress.evaluate(self.ctx, &x, d, 0.0, &timer)?;
        observer.on_event(&AnnealEvent::Finished {
            stress: final_stress,
        });
        let totals = majorizer.totals;
        if self.ctx.is_root() {
            info!(
                "Finished after {loops} temperature loops, {} SMACOF iterations, {} CG iterations; final stress {final_stress:.9e}",
                totals.smacof_iterations, totals.cg_iterations
            );
        }
        let timings = timer.summarize(self.ctx)?;
        let points = Array2::from_shape_vec((n, d), x)
            .map_err(|e| DamdsError::DegenerateInput(e.to_string()))?;

        Ok(SolveOutcome {
            points,
            stress: final_stress,
            t_max,
            temperature_loops: loops,
            smacof_iterations: totals.smacof_iterations,
            cg_iterations: totals.cg_iterations,
            cg_guard_trips: totals.cg_guard_trips,
            timings,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    smacof_iterations: usize,
    cg_iterations: usize,
    cg_guard_trips: usize,
}

/// Working storage of one solve, allocated once and reused by every iteration.
struct Majorizer<'s> {
    ctx: &'s ParallelContext,
    config: &'s DamdsConfig,
    distances: &'s DistanceBlock,
    weights: &'s WeightMatrix,
    stress: &'s StressEvaluator<'s>,
    system: DistributedSystem<'s>,
    bound: BoundMatrix,
    bc: Vec<f64>,
    timer: &'s dyn PhaseTimer,
    totals: Totals,
}

impl Majorizer<'_> {
    fn run_temperature(
        &mut self,
        loop_index: usize,
        temperature: f64,
        x: &mut [f64],
        observer: &mut dyn AnnealObserver,
    ) -> Result<(), DamdsError> {
        let d = self.config.target_dimension;
        let settings = CgSettings {
            tolerance: self.config.cg_tolerance,
            max_iterations: self.config.cg_max_iterations,
            divergence_factor: self.config.cg_divergence_factor,
        };

        let mut previous = timed(self.timer, Phase::PreStress, 0, || {
            self.stress.evaluate(self.ctx, x, d, temperature, self.timer)
        })?;
        observer.on_event(&AnnealEvent::TemperatureStarted {
            loop_index,
            temperature,
            stress: previous,
        });

        self.timer.begin(Phase::StressLoop, 0);
        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.config.max_stress_iterations {
            iterations += 1;
            self.bound.build(
                self.ctx,
                self.distances,
                self.weights,
                x,
                d,
                temperature,
                self.timer,
            );
            multiply(self.ctx, &self.bound, x, d, &mut self.bc, Phase::BofZMultiply, self.timer)?;

            let outcome = timed(self.timer, Phase::ConjugateGradient, 0, || {
                cg::solve(&self.system, &self.bc, x, settings)
            })?;
            self.totals.cg_iterations += outcome.iterations;
            if outcome.diverged {
                self.totals.cg_guard_trips += 1;
                if self.ctx.is_root() {
                    warn!(
                        "CG diverged at T = {temperature:.6e}, iteration {iterations}; keeping its best iterate"
                    );
                }
            }

            let current = timed(self.timer, Phase::Stress, 0, || {
                self.stress.evaluate(self.ctx, x, d, temperature, self.timer)
            })?;
            observer.on_event(&AnnealEvent::Iteration {
                loop_index,
                iteration: iterations,
                stress: current,
                cg_iterations: outcome.iterations,
            });

            let change = if previous == 0.0 {
                0.0
            } else {
                (previous - current).abs() / previous
            };
            previous = current;
            if change < self.config.stress_threshold {
                converged = true;
                break;
            }
        }
        self.timer.end(Phase::StressLoop, 0);
        self.totals.smacof_iterations += iterations;

        if self.ctx.is_root() {
            info!(
                "Loop {loop_index}: T = {temperature:.6e}, {iterations} iterations, stress {previous:.9e}{}",
                if converged { "" } else { " (iteration cap)" }
            );
        }
        observer.on_event(&AnnealEvent::TemperatureFinished {
            loop_index,
            temperature,
            iterations,
            stress: previous,
            converged,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessLayout;
    use crate::parallel::SelfComm;
    use approx::assert_abs_diff_eq;

    #[test]
    fn geometric_schedule_ends_with_refinement() {
        let mut schedule = GeometricSchedule::new(0.5, 0.2);
        let t0 = schedule.initial(8.0);
        assert_abs_diff_eq!(t0, 4.0);
        assert_abs_diff_eq!(schedule.next(t0), 2.0);
        assert_abs_diff_eq!(schedule.next(2.0), 0.0);

        let mut off = GeometricSchedule::disabled();
        assert_eq!(off.initial(8.0), 0.0);
    }

    struct Recorder(Vec<AnnealEvent>);

    impl AnnealObserver for Recorder {
        fn on_event(&mut self, event: &AnnealEvent) {
            self.0.push(event.clone());
        }
    }

    fn triangle_solver_config() -> DamdsConfig {
        let mut config = DamdsConfig::new(3, 2, "unused.bin");
        config.max_distance = 2.0;
        config.alpha = 0.8;
        config.stress_threshold = 1e-10;
        config.max_stress_iterations = 200;
        config.cg_tolerance = 1e-12;
        config.cg_max_iterations = 50;
        config
    }

    #[test]
    fn state_machine_visits_every_loop_once() {
        let config = triangle_solver_config();
        let ctx = ParallelContext::from_layout(
            Box::new(SelfComm),
            3,
            6,
            &ProcessLayout::single_process(1),
            "anneal",
        )
        .unwrap();
        let delta = Array2::from_shape_fn((3, 3), |(i, j)| if i == j { 0.0 } else { 1.0 });
        let distances = DistanceBlock::from_matrix(delta.view(), 0..3, Quantizer::new(2.0), None);
        let solver = DamdsSolver::new(&ctx, &config, distances, WeightMatrix::Uniform(1.0)).unwrap();

        let mut recorder = Recorder(Vec::new());
        let outcome = solver.solve(&mut recorder).unwrap();
        assert!(outcome.stress < 1e-6, "stress {}", outcome.stress);

        let temperatures: Vec<f64> = recorder
            .0
            .iter()
            .filter_map(|e| match e {
                AnnealEvent::TemperatureStarted { temperature, .. } => Some(*temperature),
                _ => None,
            })
            .collect();
        assert_eq!(temperatures.len(), outcome.temperature_loops);
        assert_eq!(*temperatures.last().unwrap(), 0.0);
        assert!(temperatures.windows(2).all(|w| w[1] < w[0]));
        assert!(matches!(recorder.0.last(), Some(AnnealEvent::Finished { .. })));
    }

    #[test]
    fn loop_cap_still_refines_at_zero() {
        let mut config = triangle_solver_config();
        config.max_temperature_loops = 2;
        let ctx = ParallelContext::from_layout(
            Box::new(SelfComm),
            3,
            6,
            &ProcessLayout::single_process(1),
            "anneal-cap",
        )
        .unwrap();
        let delta = Array2::from_shape_fn((3, 3), |(i, j)| if i == j { 0.0 } else { 1.0 });
        let distances = DistanceBlock::from_matrix(delta.view(), 0..3, Quantizer::new(2.0), None);
        let solver = DamdsSolver::new(&ctx, &config, distances, WeightMatrix::Uniform(1.0)).unwrap();
        let outcome = solver.solve(&mut NoopAnnealObserver).unwrap();
        assert_eq!(outcome.temperature_loops, 2);
    }

    #[test]
    fn mismatched_block_is_rejected() {
        let config = triangle_solver_config();
        let ctx = ParallelContext::from_layout(
            Box::new(SelfComm),
            3,
            6,
            &ProcessLayout::single_process(1),
            "anneal-bad",
        )
        .unwrap();
        let delta = Array2::from_elem((3, 3), 1.0);
        let distances = DistanceBlock::from_matrix(delta.view(), 0..2, Quantizer::new(2.0), None);
        assert!(DamdsSolver::new(&ctx, &config, distances, WeightMatrix::Uniform(1.0)).is_err());
    }
}
