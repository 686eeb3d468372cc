//! Capture configuration.
//!
//! Loaded from a TOML file; every field is optional and falls back to the
//! defaults used for continuous video capture.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::{AutoExposureMode, AutofocusMode};
use crate::types::LensFacing;

/// Frames the reader may hold at once unless configured otherwise.
pub const DEFAULT_POOL_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Which camera to pick when several are available.
    pub lens_facing: LensFacing,
    /// Capacity of the frame pool, counting pending and held frames.
    pub buffer_pool_depth: usize,
    /// Whether frames are forwarded to the processor from the start.
    pub processing_enabled: bool,
    pub worker_thread_name: String,
    pub autofocus: AutofocusMode,
    pub auto_exposure: AutoExposureMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            lens_facing: LensFacing::Back,
            buffer_pool_depth: DEFAULT_POOL_DEPTH,
            processing_enabled: false,
            worker_thread_name: "frame-acquisition".to_owned(),
            autofocus: AutofocusMode::ContinuousVideo,
            auto_exposure: AutoExposureMode::On,
        }
    }
}

impl CaptureConfig {
    /// Load configuration from a file path.
    /// Returns the default config when no path is given or the file doesn't
    /// exist, and an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(CaptureConfig::default());
        };
        if !path.exists() {
            return Ok(CaptureConfig::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CaptureConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CaptureConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_pool_depth == 0 {
            return Err(ConfigError::Invalid(
                "buffer_pool_depth must be at least 1".to_owned(),
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "worker_thread_name must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{}'", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = CaptureConfig::from_toml_str("").unwrap();
        assert_eq!(config, CaptureConfig::default());
        assert_eq!(config.buffer_pool_depth, 2);
        assert_eq!(config.lens_facing, LensFacing::Back);
        assert!(!config.processing_enabled);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = CaptureConfig::from_toml_str(
            "lens_facing = \"front\"\nprocessing_enabled = true\nautofocus = \"auto\"",
        )
        .unwrap();
        assert_eq!(config.lens_facing, LensFacing::Front);
        assert!(config.processing_enabled);
        assert_eq!(config.autofocus, AutofocusMode::Auto);
        assert_eq!(config.worker_thread_name, "frame-acquisition");
    }

    #[test]
    fn zero_depth_is_rejected() {
        let err = CaptureConfig::from_toml_str("buffer_pool_depth = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn blank_thread_name_is_rejected() {
        let err = CaptureConfig::from_toml_str("worker_thread_name = \"  \"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let err = CaptureConfig::from_toml_str("frame_rate = 30").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptureConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, CaptureConfig::default());
        assert_eq!(CaptureConfig::load(None).unwrap(), CaptureConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer_pool_depth = 4").unwrap();
        writeln!(file, "auto_exposure = \"off\"").unwrap();
        let config = CaptureConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.buffer_pool_depth, 4);
        assert_eq!(config.auto_exposure, AutoExposureMode::Off);
    }

    #[test]
    fn parse_error_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer_pool_depth = \"two\"").unwrap();
        let err = CaptureConfig::load(Some(file.path())).unwrap_err();
        match &err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
