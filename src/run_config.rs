use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::models::RunConfiguration;

#[derive(Debug, Error)]
pub enum RunConfigError {
    #[error("run configuration {0} does not exist; import a roster first")]
    Missing(PathBuf),

    #[error("run configuration {path} is unreadable: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("run configuration {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("run configuration {path} ends before it starts ({start} > {end})")]
    InvertedWindow {
        path: PathBuf,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },
}

pub fn load(path: &Path) -> Result<RunConfiguration, RunConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => RunConfigError::Missing(path.to_path_buf()),
        _ => RunConfigError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    let config: RunConfiguration =
        serde_json::from_str(&raw).map_err(|source| RunConfigError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    if config.end_date < config.start_date {
        return Err(RunConfigError::InvertedWindow {
            path: path.to_path_buf(),
            start: config.start_date,
            end: config.end_date,
        });
    }
    Ok(config)
}

/// Writes a sibling temp file, then renames it over `path`.
pub fn save(path: &Path, config: &RunConfiguration) -> Result<(), RunConfigError> {
    let io_error = |source| RunConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let body = serde_json::to_string_pretty(config).map_err(|source| RunConfigError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, body).map_err(io_error)?;
    std::fs::rename(&staging, path).map_err(io_error)?;
    info!(
        "Run configuration saved: {} to {}, stop={}",
        config.start_date, config.end_date, config.is_stop_job
    );
    Ok(())
}

pub fn set_stop_job(path: &Path, stop: bool) -> Result<RunConfiguration, RunConfigError> {
    let mut config = load(path)?;
    config.is_stop_job = stop;
    save(path, &config)?;
    Ok(config)
}
