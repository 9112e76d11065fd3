//! User configuration.
//!
//! Built-in defaults are overridden by an optional JSON file at
//! `<user config dir>/lenscull/config.json`, which command-line flags
//! override in turn.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::DescriptorStore;
use crate::core::faces::{FaceDetector, NoFaceDetector};
use crate::core::similarity::{Algorithm, DEFAULT_TIME_WINDOW_SECS};
use crate::tasks::{TaskError, TaskRunner};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("worker limit must be at least 1")]
    InvalidWorkerLimit,

    #[error("time window must not be negative, got {0}s")]
    InvalidTimeWindow(i64),

    #[error("{0} needs a build with the `opencv` feature")]
    Unavailable(String),

    #[error("cannot use face model: {0:#}")]
    FaceModel(#[source] anyhow::Error),
}

/// Where similarity descriptors are kept between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreLocation {
    /// The platform cache directory.
    #[default]
    Default,
    Disabled,
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub algorithm: Algorithm,
    /// `None` means one worker per CPU.
    pub worker_limit: Option<usize>,
    pub time_window_secs: i64,
    pub descriptor_store: StoreLocation,
    /// YuNet ONNX model. Without one no faces are detected.
    pub face_model: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            worker_limit: None,
            time_window_secs: DEFAULT_TIME_WINDOW_SECS,
            descriptor_store: StoreLocation::default(),
            face_model: None,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lenscull").join(CONFIG_FILE))
    }

    /// Load the user config if one exists, otherwise the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_limit == Some(0) {
            return Err(ConfigError::InvalidWorkerLimit);
        }
        if self.time_window_secs < 0 {
            return Err(ConfigError::InvalidTimeWindow(self.time_window_secs));
        }
        if !self.algorithm.is_available() {
            return Err(ConfigError::Unavailable(format!("the `{}` algorithm", self.algorithm)));
        }
        if self.face_model.is_some() && !cfg!(feature = "opencv") {
            return Err(ConfigError::Unavailable("face detection".to_string()));
        }
        Ok(())
    }

    pub fn runner(&self) -> Result<TaskRunner, TaskError> {
        match self.worker_limit {
            Some(limit) => TaskRunner::new(limit),
            None => Ok(TaskRunner::default()),
        }
    }

    pub fn descriptor_store(&self) -> Option<DescriptorStore> {
        match &self.descriptor_store {
            StoreLocation::Default => DescriptorStore::open_default(),
            StoreLocation::Disabled => None,
            StoreLocation::Path(path) => Some(DescriptorStore::open(path.clone())),
        }
    }

    /// The configured face detector; [`NoFaceDetector`] when no model is set.
    pub fn face_detector(&self) -> Result<Arc<dyn FaceDetector>, ConfigError> {
        match &self.face_model {
            None => Ok(Arc::new(NoFaceDetector)),
            Some(model) => yunet(model),
        }
    }
}

#[cfg(feature = "opencv")]
fn yunet(model: &Path) -> Result<Arc<dyn FaceDetector>, ConfigError> {
    let detector = crate::core::faces::YuNetDetector::new(model).map_err(ConfigError::FaceModel)?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "opencv"))]
fn yunet(_model: &Path) -> Result<Arc<dyn FaceDetector>, ConfigError> {
    Err(ConfigError::Unavailable("face detection".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{ "algorithm": "histogram", "worker_limit": 3 }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.algorithm, Algorithm::Histogram);
        assert_eq!(config.worker_limit, Some(3));
        assert_eq!(config.time_window_secs, DEFAULT_TIME_WINDOW_SECS);
        assert_eq!(config.descriptor_store, StoreLocation::Default);
        assert_eq!(config.runner().unwrap().worker_limit(), 3);
    }

    #[test]
    fn test_store_location_forms() {
        let disabled: Config = serde_json::from_str(r#"{ "descriptor_store": "disabled" }"#).unwrap();
        assert!(disabled.descriptor_store().is_none());

        let custom: Config =
            serde_json::from_str(r#"{ "descriptor_store": { "path": "/tmp/lenscull" } }"#).unwrap();
        assert_eq!(
            custom.descriptor_store().unwrap().root(),
            Path::new("/tmp/lenscull")
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{ "worker_limit": 0 }"#).unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::InvalidWorkerLimit)
        ));
    }

    #[test]
    fn test_negative_window_rejected() {
        let config = Config {
            time_window_secs: -1,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimeWindow(-1))
        ));
    }

    #[test]
    fn test_default_detector_finds_nothing() {
        assert_eq!(Config::default().face_detector().unwrap().name(), "none");
    }

    #[test]
    fn test_face_model_needs_vision_backend() {
        let config = Config {
            face_model: Some(PathBuf::from("/nonexistent/face.onnx")),
            ..Config::default()
        };
        if cfg!(feature = "opencv") {
            assert!(config.validate().is_ok());
            assert!(matches!(config.face_detector(), Err(ConfigError::FaceModel(_))));
        } else {
            assert!(matches!(config.validate(), Err(ConfigError::Unavailable(_))));
            assert!(matches!(config.face_detector(), Err(ConfigError::Unavailable(_))));
        }
    }

    #[test]
    fn test_keypoints_needs_vision_backend() {
        let config = Config {
            algorithm: Algorithm::Keypoints,
            ..Config::default()
        };
        assert_eq!(config.validate().is_ok(), cfg!(feature = "opencv"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse { .. })));
    }
}
