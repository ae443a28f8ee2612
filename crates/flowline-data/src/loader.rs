//! Loading pipeline: finds the model and run files, parses them, and builds
//! a ready-to-run [`Simulation`].
//!
//! A data directory holds `model.{ron,toml,json}` (required, snapshot schema)
//! and optionally `run.{ron,toml,json}` (run settings). Exactly one format
//! per base name is allowed.

use crate::schema::{ConfigValueError, RunConfigData};
use flowline_core::engine::{SimConfig, Simulation};
use flowline_core::error::SimError;
use flowline_core::snapshot::{GraphSnapshot, Model, SnapshotError};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Base name of the model file.
pub const MODEL_FILE: &str = "model";
/// Base name of the optional run configuration file.
pub const RUN_FILE: &str = "run";

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A run setting could not be converted.
    #[error("{source} in {file}")]
    Config {
        file: PathBuf,
        #[source]
        source: ConfigValueError,
    },

    /// The model parsed but does not describe a valid line.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The model and run settings were rejected by the engine.
    #[error(transparent)]
    Sim(#[from] SimError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Scan a directory for `{base_name}.ron`, `.toml` or `.json`.
///
/// Returns `Ok(None)` if no file is found, or `Err(ConflictingFormats)` if
/// more than one format exists for the same base name.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let mut found: Option<PathBuf> = None;
    for ext in ["ron", "toml", "json"] {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if !candidate.exists() {
            continue;
        }
        if let Some(existing) = found {
            return Err(DataLoadError::ConflictingFormats {
                a: existing,
                b: candidate,
            });
        }
        found = Some(candidate);
    }
    Ok(found)
}

/// Like [`find_data_file`], but a missing file is an error.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

/// Read a file and deserialize it according to its extension.
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let parse = |detail: String| DataLoadError::Parse {
        file: path.to_path_buf(),
        detail,
    };

    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse(e.to_string())),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse(e.to_string())),
        Format::Toml => toml::from_str(&content).map_err(|e| parse(e.to_string())),
    }
}

// ===========================================================================
// Pipeline
// ===========================================================================

/// Parse `model.*` without resolving it.
pub fn load_snapshot(dir: &Path) -> Result<GraphSnapshot, DataLoadError> {
    let path = require_data_file(dir, MODEL_FILE)?;
    deserialize_file(&path)
}

/// Parse and resolve `model.*` into a graph, registry and probe set.
pub fn load_model(dir: &Path) -> Result<Model, DataLoadError> {
    Ok(load_snapshot(dir)?.build()?)
}

/// Read `run.*`, or the default settings if there is none.
pub fn load_run_config(dir: &Path) -> Result<SimConfig, DataLoadError> {
    let Some(path) = find_data_file(dir, RUN_FILE)? else {
        return Ok(SimConfig::default());
    };
    let data: RunConfigData = deserialize_file(&path)?;
    data.to_sim_config()
        .map_err(|source| DataLoadError::Config { file: path, source })
}

/// Load both files and build a simulation with the model's probes attached.
pub fn load_simulation(dir: &Path) -> Result<Simulation, DataLoadError> {
    let model = load_model(dir)?;
    let config = load_run_config(dir)?;
    Ok(Simulation::from_model(model, config)?)
}

// ===========================================================================
// Tests
// ===========================================================================
