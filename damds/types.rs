// ========================================================================================
//
//                       CORE DATA TYPES FOR THE DAMDS ENGINE
//
// ========================================================================================
//
// Types shared across the architectural boundaries of the crate (`parallel`,
// `shared`, the solver modules and `main`). Types used by only one file live in
// that file.

use crate::config::ConfigError;
use crate::parallel::{CommError, TopologyError};
use crate::shared::SourceError;
use ndarray::Array2;
use thiserror::Error;

/// A point configuration: one row per point, one column per target dimension.
pub type Points = Array2<f64>;

/// The single error type surfaced by the solver and its bootstrap.
///
/// Every variant is fatal for the whole run. Local numerical edge cases (two
/// coincident points, a diverging CG solve) never reach this type; they are
/// absorbed where they happen and reported through logging and counters.
#[derive(Error, Debug)]
pub enum DamdsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Parallel decomposition error: {0}")]
    Topology(#[from] TopologyError),
    #[error("Collective communication failed: {0}")]
    Comm(#[from] CommError),
    #[error("Input/output error: {0}")]
    Source(#[from] SourceError),
    #[error("Failed to start the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("The input cannot be scaled: {0}")]
    DegenerateInput(String),
}
