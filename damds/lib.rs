#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod anneal;
pub mod bofz;
pub mod cg;
pub mod config;
pub mod linalg;
pub mod stress;
pub mod timing;
pub mod types;

#[path = "../parallel/mod.rs"]
pub mod parallel;

#[path = "../shared/mod.rs"]
pub mod shared;

pub use anneal::{
    AnnealEvent, AnnealObserver, DamdsSolver, GeometricSchedule, NoopAnnealObserver, SolveOutcome,
    TemperatureSchedule,
};
pub use config::{ConfigError, DamdsConfig, MatrixLayout, ProcessLayout};
pub use types::DamdsError;
