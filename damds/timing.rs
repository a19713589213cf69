use crate::parallel::ParallelContext;
use crate::types::DamdsError;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Instrumented phases of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    TemperatureLoop,
    PreStress,
    StressLoop,
    BofZ,
    BofZMultiply,
    ConjugateGradient,
    CgMultiply,
    CgInnerProduct,
    Stress,
    StressInternal,
    Communication,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::TemperatureLoop,
        Phase::PreStress,
        Phase::StressLoop,
        Phase::BofZ,
        Phase::BofZMultiply,
        Phase::ConjugateGradient,
        Phase::CgMultiply,
        Phase::CgInnerProduct,
        Phase::Stress,
        Phase::StressInternal,
        Phase::Communication,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            Self::TemperatureLoop => "temperature loop",
            Self::PreStress => "pre-iteration stress",
            Self::StressLoop => "stress majorization loop",
            Self::BofZ => "bound-matrix build",
            Self::BofZMultiply => "bound-matrix multiply",
            Self::ConjugateGradient => "conjugate gradient",
            Self::CgMultiply => "CG multiply",
            Self::CgInnerProduct => "CG inner product",
            Self::Stress => "stress",
            Self::StressInternal => "stress partial sums",
            Self::Communication => "communication",
        }
    }

    /// Per-thread phases are timed by every worker with its own thread id;
    /// the others are timed once per process as unit 0.
    pub fn per_thread(self) -> bool {
        matches!(
            self,
            Self::BofZ
                | Self::BofZMultiply
                | Self::CgMultiply
                | Self::CgInnerProduct
                | Self::StressInternal
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// The narrow interface the solver reports timings through.
pub trait PhaseTimer: Sync {
    fn begin(&self, phase: Phase, unit: usize);
    fn end(&self, phase: Phase, unit: usize);
}

/// Runs `work` between `begin` and `end` of `phase` for `unit`.
pub fn timed<R>(timer: &dyn PhaseTimer, phase: Phase, unit: usize, work: impl FnOnce() -> R) -> R {
    timer.begin(phase, unit);
    let out = work();
    timer.end(phase, unit);
    out
}

#[derive(Default)]
pub struct NoopTimer;

impl PhaseTimer for NoopTimer {
    fn begin(&self, phase: Phase, unit: usize) {
        let _ = (phase, unit);
    }
    fn end(&self, phase: Phase, unit: usize) {
        let _ = (phase, unit);
    }
}

#[derive(Default)]
struct Slot {
    started: AtomicU64,
    total: AtomicU64,
    count: AtomicU64,
}

/// Elapsed time and call counts per (phase, unit).
///
/// Each slot is only ever touched by the unit that owns it, so the atomics are
/// uncontended and `Relaxed` ordering is enough.
pub struct TimingRegistry {
    epoch: Instant,
    units: usize,
    slots: Vec<Slot>,
}

impl TimingRegistry {
    pub fn new(threads: usize) -> Self {
        let units = threads.max(1);
        Self {
            epoch: Instant::now(),
            units,
            slots: (0..Phase::ALL.len() * units).map(|_| Slot::default()).collect(),
        }
    }

    fn slot(&self, phase: Phase, unit: usize) -> &Slot {
        &self.slots[phase.index() * self.units + unit.min(self.units - 1)]
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Total nanoseconds spent in `phase` on this process, over all units.
    pub fn total_nanos(&self, phase: Phase) -> u64 {
        (0..self.units)
            .map(|unit| self.slot(phase, unit).total.load(Ordering::Relaxed))
            .sum()
    }

    pub fn count(&self, phase: Phase) -> u64 {
        (0..self.units)
            .map(|unit| self.slot(phase, unit).count.load(Ordering::Relaxed))
            .sum()
    }

    /// Gathers every process's timings into one summary, replicated on every
    /// rank. Collective.
    pub fn summarize(&self, ctx: &ParallelContext) -> Result<TimingSummary, DamdsError> {
        let processes = ctx.process_count();
        let rank = ctx.rank();
        let mut phases = Vec::with_capacity(Phase::ALL.len());
        for phase in Phase::ALL {
            let width = if phase.per_thread() { self.units } else { 1 };
            let mut millis = vec![0.0; processes * width];
            let mut counts = vec![0.0; processes * width];
            for unit in 0..width {
                let slot = self.slot(phase, unit);
                millis[rank * width + unit] = slot.total.load(Ordering::Relaxed) as f64 / 1e6;
                counts[rank * width + unit] = slot.count.load(Ordering::Relaxed) as f64;
            }
            ctx.all_reduce_sum(&mut millis)?;
            ctx.all_reduce_sum(&mut counts)?;

            let total_ms: f64 = millis.iter().sum();
            let calls = counts.iter().sum::<f64>() as u64;
            phases.push(PhaseTiming {
                phase,
                total_ms,
                calls,
                average_ms: if calls > 0 { total_ms / calls as f64 } else { 0.0 },
                distribution_ms: millis,
            });
        }
        Ok(TimingSummary {
            processes,
            threads_per_process: self.units,
            elapsed: format_elapsed(self.epoch.elapsed().as_millis() as u64),
            phases,
        })
    }
}

impl PhaseTimer for TimingRegistry {
    fn begin(&self, phase: Phase, unit: usize) {
        self.slot(phase, unit)
            .started
            .store(self.now_nanos(), Ordering::Relaxed);
    }

    fn end(&self, phase: Phase, unit: usize) {
        let slot = self.slot(phase, unit);
        let elapsed = self
            .now_nanos()
            .saturating_sub(slot.started.load(Ordering::Relaxed));
        slot.total.fetch_add(elapsed, Ordering::Relaxed);
        slot.count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub total_ms: f64,
    pub calls: u64,
    pub average_ms: f64,
    /// One entry per process (rank order) or, for per-thread phases, per
    /// (process, thread) pair.
    pub distribution_ms: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingSummary {
    pub processes: usize,
    pub threads_per_process: usize,
    pub elapsed: String,
    pub phases: Vec<PhaseTiming>,
}

impl TimingSummary {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseTiming> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Formats milliseconds as `d:HH:MM:SS:mmm`.
pub fn format_elapsed(millis: u64) -> String {
    let ms = millis % 1000;
    let secs = millis / 1000;
    let (days, hours, minutes, seconds) = (
        secs / 86_400,
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
    );
    format!("{days}:{hours:02}:{minutes:02}:{seconds:02}:{ms:03}")
}
