// ========================================================================================
//
//                            THE RUN ORCHESTRATOR: DAMDS
//
// ========================================================================================
//
// Owns everything outside the solver: argument parsing, configuration loading,
// bringing up one rank per process with its worker pool, progress display, and
// writing the points, timing and summary files. Rank 0 does all the writing.

use clap::Parser;
use damds::parallel::{CommError, Communicator, LocalWorld, ParallelContext, SelfComm};
use damds::shared::{SourceError, read_labels, write_points};
use damds::timing::format_elapsed;
use damds::{
    AnnealEvent, AnnealObserver, DamdsConfig, DamdsError, DamdsSolver, NoopAnnealObserver,
    ProcessLayout, SolveOutcome,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::info;
use serde::Serialize;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Instant;

/// Tag of this run's communicating-group scratch files. The bootstrap's pid
/// keeps concurrent runs sharing one scratch directory apart.
fn scratch_tag(pid: u32) -> String {
    format!("damds-{pid}")
}

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "damds",
    version,
    about = "Deterministic-annealing SMACOF: embeds a quantized distance matrix in a few dimensions."
)]
struct Args {
    /// Path to the TOML run configuration.
    #[clap(short, long)]
    config: PathBuf,

    /// Number of processes (ranks) to run.
    #[clap(short, long, default_value_t = 1)]
    processes: usize,

    /// Worker threads per process. Defaults to the available cores shared between processes.
    #[clap(short, long)]
    threads: Option<usize>,

    /// Number of nodes the processes are spread over.
    #[clap(short, long, default_value_t = 1)]
    nodes: usize,

    /// Number of communicating groups per node.
    #[clap(long, default_value_t = 1)]
    cgpn: usize,

    /// Scratch directory for the memory-mapped files of communicating groups.
    /// Node-local storage is advised. Groups are only used when this is set.
    #[clap(long)]
    cgdir: Option<PathBuf>,

    /// Upper bound on the bytes communicating groups may use in the scratch directory.
    #[clap(long)]
    cg_limit: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match DamdsConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration '{}': {e}", args.config.display());
            process::exit(1);
        }
    };

    let threads = args
        .threads
        .unwrap_or_else(|| (num_cpus::get() / args.processes.max(1)).max(1));
    let layout = match ProcessLayout::spread(args.processes, args.nodes, threads) {
        Ok(layout) => ProcessLayout {
            groups_per_node: args.cgpn,
            scratch_dir: args.cgdir,
            scratch_limit_bytes: args.cg_limit,
            ..layout
        },
        Err(e) => {
            eprintln!("Error in process layout: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(&config, &layout) {
        eprintln!("Fatal error: {e}");
        process::exit(1);
    }
}

/// Starts every rank, waits for all of them, and returns the first failure.
fn run(config: &DamdsConfig, layout: &ProcessLayout) -> Result<(), DamdsError> {
    let started = Instant::now();
    let tag = scratch_tag(process::id());
    let tag = tag.as_str();
    info!(
        "== DAMDS run started: {} points, {} dimensions, {} processes x {} threads ==",
        config.points, config.target_dimension, layout.process_count, layout.threads_per_process
    );

    if layout.process_count == 1 {
        run_rank(Box::new(SelfComm), config, layout, tag, started)?;
        return Ok(());
    }

    let comms = LocalWorld::create(layout.process_count);
    let results: Vec<Result<(), DamdsError>> = thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                let handle = thread::Builder::new()
                    .name(format!("damds-rank{rank}"))
                    .spawn_scoped(scope, move || {
                        run_rank(Box::new(comm), config, layout, tag, started)
                    });
                (rank, handle)
            })
            .collect();
        handles
            .into_iter()
            .map(|(rank, handle)| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(CommError::Disconnected { rank }.into())),
                Err(e) => {
                    log::error!("Failed to start rank {rank}: {e}");
                    Err(CommError::Disconnected { rank }.into())
                }
            })
            .collect()
    });
    results.into_iter().collect()
}

fn run_rank(
    comm: Box<dyn Communicator>,
    config: &DamdsConfig,
    layout: &ProcessLayout,
    tag: &str,
    started: Instant,
) -> Result<(), DamdsError> {
    let reduce_len = config.points * config.target_dimension;
    let ctx = ParallelContext::from_layout(comm, config.points, reduce_len, layout, tag)?;
    if ctx.is_root() && ctx.uses_group_exchange() {
        info!(
            "Reducing through {} communicating groups of {} processes",
            ctx.topology().group_count(),
            ctx.topology().group_size()
        );
    }

    let solver = DamdsSolver::load(&ctx, config)?;
    if !ctx.is_root() {
        solver.solve(&mut NoopAnnealObserver)?;
        return Ok(());
    }

    let mut progress = ProgressObserver::new();
    let outcome = solver.solve(&mut progress)?;
    progress.finish();
    report(config, &outcome, started);
    write_outputs(config, &outcome, started)
}

fn report(config: &DamdsConfig, outcome: &SolveOutcome, started: Instant) {
    let total_ms = started.elapsed().as_millis() as u64;
    info!("Finishing DAMDS run ...");
    info!("  Total Time: {} ({total_ms} ms)", format_elapsed(total_ms));
    info!("  Total Loops: {}", outcome.temperature_loops);
    info!("  Total Iterations: {}", outcome.smacof_iterations);
    info!(
        "  Total CG Iterations: {} Avg. CG Iterations: {:.5}",
        outcome.cg_iterations,
        outcome.cg_iterations as f64 / outcome.smacof_iterations.max(1) as f64
    );
    if outcome.cg_guard_trips > 0 {
        info!("  CG solves stopped by the divergence guard: {}", outcome.cg_guard_trips);
    }
    info!("  Final Stress: {:.9e}", outcome.stress);
    for phase in &outcome.timings.phases {
        if phase.calls > 0 {
            info!(
                "  {:<26} total {:>12.3} ms  calls {:>8}  avg {:>10.4} ms",
                phase.phase.describe(),
                phase.total_ms,
                phase.calls,
                phase.average_ms
            );
        }
    }
    info!("  Points written to {}", config.points_file.display());
}

/// What the summary file records about a finished run.
#[derive(Serialize)]
struct RunSummary<'a> {
    elapsed: String,
    final_stress: f64,
    t_max: f64,
    temperature_loops: usize,
    smacof_iterations: usize,
    cg_iterations: usize,
    cg_guard_trips: usize,
    config: &'a DamdsConfig,
}

fn write_outputs(
    config: &DamdsConfig,
    outcome: &SolveOutcome,
    started: Instant,
) -> Result<(), DamdsError> {
    let labels = config.label_file.as_deref().map(read_labels).transpose()?;
    write_points(&config.points_file, outcome.points.view(), labels.as_ref())?;

    if let Some(path) = &config.timing_file {
        let json = serde_json::to_string_pretty(&outcome.timings).map_err(io::Error::other);
        write_text(path, json)?;
    }
    if let Some(path) = &config.summary_file {
        let summary = RunSummary {
            elapsed: format_elapsed(started.elapsed().as_millis() as u64),
            final_stress: outcome.stress,
            t_max: outcome.t_max,
            temperature_loops: outcome.temperature_loops,
            smacof_iterations: outcome.smacof_iterations,
            cg_iterations: outcome.cg_iterations,
            cg_guard_trips: outcome.cg_guard_trips,
            config,
        };
        let text = toml::to_string_pretty(&summary).map_err(io::Error::other);
        write_text(path, text)?;
    }
    info!("== DAMDS run completed ==");
    Ok(())
}

fn write_text(path: &Path, text: io::Result<String>) -> Result<(), SourceError> {
    text.and_then(|text| fs::write(path, text))
        .map_err(|source| SourceError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Shows the current temperature loop and stress on a terminal spinner.
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new() -> Self {
        let draw_target = if io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(10)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(None, draw_target);
        let style = ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {pos} iterations  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl AnnealObserver for ProgressObserver {
    fn on_event(&mut self, event: &AnnealEvent) {
        match event {
            AnnealEvent::TemperatureStarted {
                loop_index,
                temperature,
                stress,
            } => self.bar.set_message(format!(
                "loop {loop_index}  T = {temperature:.4e}  stress = {stress:.6e}"
            )),
            AnnealEvent::Iteration { stress, .. } => {
                self.bar.inc(1);
                self.bar.set_message(format!("stress = {stress:.6e}"));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_tags_differ_between_runs() {
        assert_eq!(scratch_tag(4242), "damds-4242");
        assert_ne!(scratch_tag(1), scratch_tag(2));
    }
}
