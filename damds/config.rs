use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating a run configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Physical layout of the distance file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MatrixLayout {
    /// N x N row-major values.
    #[default]
    Full,
    /// The N(N-1)/2 entries above the diagonal, row by row.
    UpperTriangular,
}

/// The resolved run configuration, loaded from TOML.
///
/// Only `points`, `target_dimension` and `distance_file` are mandatory; every
/// other field falls back to the default documented next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DamdsConfig {
    /// Number of points N.
    pub points: usize,
    /// Target dimension D.
    pub target_dimension: usize,
    pub distance_file: PathBuf,
    /// Quantized weights in the distance layout. Absent means every weight is 1.0.
    #[serde(default)]
    pub weight_file: Option<PathBuf>,
    #[serde(default)]
    pub matrix_layout: MatrixLayout,
    /// Byte order of the 16-bit values in the distance and weight files. Default: true.
    #[serde(default = "default_true")]
    pub big_endian: bool,
    /// Real distance represented by the largest quantized value. Default: 1.0.
    #[serde(default = "default_max_distance")]
    pub max_distance: f64,
    /// Optional power applied to every decoded distance.
    #[serde(default)]
    pub distance_transform: Option<f64>,
    /// Column tile width of the distributed multiply. Default: 64.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Geometric cooling factor, strictly inside (0, 1). Default: 0.95.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Annealing stops once T would fall below `t_min_factor * T_max`. Default: 0.5.
    #[serde(default = "default_t_min_factor")]
    pub t_min_factor: f64,
    /// Hard cap on temperature loops, the final T = 0 pass included. Default: 1000.
    #[serde(default = "default_max_temperature_loops")]
    pub max_temperature_loops: usize,
    /// When false the solver runs plain SMACOF at T = 0. Default: true.
    #[serde(default = "default_true")]
    pub annealing: bool,
    /// Relative stress change below which a temperature is converged. Default: 1e-6.
    #[serde(default = "default_stress_threshold")]
    pub stress_threshold: f64,
    /// Cap on SMACOF iterations per temperature. Default: 10000.
    #[serde(default = "default_max_stress_iterations")]
    pub max_stress_iterations: usize,
    /// Relative residual tolerance of the CG solve. Default: 1e-6.
    #[serde(default = "default_cg_tolerance")]
    pub cg_tolerance: f64,
    /// Default: 100.
    #[serde(default = "default_cg_max_iterations")]
    pub cg_max_iterations: usize,
    /// CG stops early once its residual grows this many times past the best seen. Default: 1e4.
    #[serde(default = "default_cg_divergence_factor")]
    pub cg_divergence_factor: f64,
    /// Seed of the random initial configuration. Default: 0.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub initial_points_file: Option<PathBuf>,
    /// Default: "points.txt".
    #[serde(default = "default_points_file")]
    pub points_file: PathBuf,
    #[serde(default)]
    pub label_file: Option<PathBuf>,
    #[serde(default)]
    pub timing_file: Option<PathBuf>,
    #[serde(default)]
    pub summary_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_max_distance() -> f64 {
    1.0
}
fn default_block_size() -> usize {
    64
}
fn default_alpha() -> f64 {
    0.95
}
fn default_t_min_factor() -> f64 {
    0.5
}
fn default_max_temperature_loops() -> usize {
    1000
}
fn default_stress_threshold() -> f64 {
    1e-6
}
fn default_max_stress_iterations() -> usize {
    10_000
}
fn default_cg_tolerance() -> f64 {
    1e-6
}
fn default_cg_max_iterations() -> usize {
    100
}
fn default_cg_divergence_factor() -> f64 {
    1e4
}
fn default_points_file() -> PathBuf {
    PathBuf::from("points.txt")
}

impl DamdsConfig {
    /// A configuration with every optional field at its default.
    pub fn new(points: usize, target_dimension: usize, distance_file: impl Into<PathBuf>) -> Self {
        Self {
            points,
            target_dimension,
            distance_file: distance_file.into(),
            weight_file: None,
            matrix_layout: MatrixLayout::default(),
            big_endian: true,
            max_distance: default_max_distance(),
            distance_transform: None,
            block_size: default_block_size(),
            alpha: default_alpha(),
            t_min_factor: default_t_min_factor(),
            max_temperature_loops: default_max_temperature_loops(),
            annealing: true,
            stress_threshold: default_stress_threshold(),
            max_stress_iterations: default_max_stress_iterations(),
            cg_tolerance: default_cg_tolerance(),
            cg_max_iterations: default_cg_max_iterations(),
            cg_divergence_factor: default_cg_divergence_factor(),
            seed: 0,
            initial_points_file: None,
            points_file: default_points_file(),
            label_file: None,
            timing_file: None,
            summary_file: None,
        }
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks every field that can be checked without knowing the process layout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }
        fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(invalid(field, format!("must be a positive finite number, got {value}")))
            }
        }

        if self.points < 2 {
            return Err(invalid("points", format!("need at least 2 points, got {}", self.points)));
        }
        if self.target_dimension == 0 {
            return Err(invalid("target_dimension", "must be at least 1"));
        }
        if self.block_size == 0 {
            return Err(invalid("block_size", "must be at least 1"));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(invalid("alpha", format!("must lie strictly between 0 and 1, got {}", self.alpha)));
        }
        if !(self.t_min_factor > 0.0 && self.t_min_factor < 1.0) {
            return Err(invalid(
                "t_min_factor",
                format!("must lie strictly between 0 and 1, got {}", self.t_min_factor),
            ));
        }
        if self.max_temperature_loops == 0 {
            return Err(invalid("max_temperature_loops", "must be at least 1"));
        }
        if self.max_stress_iterations == 0 {
            return Err(invalid("max_stress_iterations", "must be at least 1"));
        }
        if self.cg_max_iterations == 0 {
            return Err(invalid("cg_max_iterations", "must be at least 1"));
        }
        positive("max_distance", self.max_distance)?;
        positive("stress_threshold", self.stress_threshold)?;
        positive("cg_tolerance", self.cg_tolerance)?;
        if !(self.cg_divergence_factor.is_finite() && self.cg_divergence_factor > 1.0) {
            return Err(invalid(
                "cg_divergence_factor",
                format!("must be a finite number above 1, got {}", self.cg_divergence_factor),
            ));
        }
        if let Some(power) = self.distance_transform {
            positive("distance_transform", power)?;
        }
        Ok(())
    }
}

/// How the run is spread over processes and threads. Resolved by the
/// bootstrap and identical on every rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLayout {
    pub process_count: usize,
    pub processes_per_node: usize,
    /// Communicating groups per node; each group reduces through one scratch file.
    pub groups_per_node: usize,
    pub threads_per_process: usize,
    /// Directory of the communicating-group scratch files. Groups are only
    /// used when this is set.
    pub scratch_dir: Option<PathBuf>,
    pub scratch_limit_bytes: Option<u64>,
}

impl ProcessLayout {
    pub fn single_process(threads_per_process: usize) -> Self {
        Self {
            process_count: 1,
            processes_per_node: 1,
            groups_per_node: 1,
            threads_per_process,
            scratch_dir: None,
            scratch_limit_bytes: None,
        }
    }

    /// `process_count` processes spread evenly over `nodes` nodes, without
    /// communicating groups.
    pub fn spread(
        process_count: usize,
        nodes: usize,
        threads_per_process: usize,
    ) -> Result<Self, ConfigError> {
        if nodes == 0 || process_count % nodes != 0 {
            return Err(ConfigError::Invalid {
                field: "nodes",
                reason: format!("{process_count} processes cannot be spread evenly over {nodes} nodes"),
            });
        }
        Ok(Self {
            process_count,
            processes_per_node: process_count / nodes,
            groups_per_node: 1,
            threads_per_process,
            scratch_dir: None,
            scratch_limit_bytes: None,
        })
    }
}
