//! Data directory layout.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DaemonError;

/// Overrides the OS data directory.
pub const DATA_DIR_ENV: &str = "MINILLMD_DATA_DIR";

/// The override wins; otherwise a `minillm` folder in the OS data dir.
fn resolve_data_dir(
    override_dir: Option<OsString>,
    os_data_dir: Option<PathBuf>,
) -> Result<PathBuf, DaemonError> {
    match (override_dir, os_data_dir) {
        (Some(dir), _) => Ok(PathBuf::from(dir)),
        (None, Some(base)) => Ok(base.join("minillm")),
        (None, None) => Err(DaemonError::Environment(format!(
            "no OS data directory; set {DATA_DIR_ENV}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, DaemonError> {
        Self::at(resolve_data_dir(
            std::env::var_os(DATA_DIR_ENV),
            dirs::data_dir(),
        )?)
    }

    /// Use `data_dir` directly, creating it and the models directory.
    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let paths = Self {
            data_dir: data_dir.into(),
        };
        fs::create_dir_all(paths.models_dir())?;
        Ok(paths)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn model_file(&self, model_id: &str) -> PathBuf {
        self.models_dir().join(format!("{model_id}.mlw"))
    }
}
