//! File-based model and run configuration loading for Flowline.
//!
//! [`load_simulation`] reads `model.{ron,toml,json}` and the optional
//! `run.{ron,toml,json}` from a directory and returns a simulation with the
//! model's probes attached.

pub mod loader;
pub mod schema;

pub use loader::{DataLoadError, load_model, load_run_config, load_simulation, load_snapshot};
pub use schema::{ConfigValueError, RunConfigData};
