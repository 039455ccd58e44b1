use crate::cluster::ClusterParams;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default buffer around field boundaries, matching the 100 m proximity the
/// fleet has historically tolerated for GPS noise at plot edges.
pub const DEFAULT_BUFFER_M: f64 = 100.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SortParams {
    /// Outward expansion of each field boundary, in meters on the metric
    /// plane.
    pub buffer_m: f64,
    pub cluster: ClusterParams,
}

impl Default for SortParams {
    fn default() -> Self {
        SortParams {
            buffer_m: DEFAULT_BUFFER_M,
            cluster: ClusterParams::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Load sorting parameters from a JSON file; absent keys keep their
/// defaults.
pub fn load_params(path: &Path) -> Result<SortParams, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
