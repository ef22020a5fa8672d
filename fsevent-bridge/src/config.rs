//! Configuration types for watchers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Latency used when none is configured, in seconds.
pub const DEFAULT_LATENCY_SECS: f64 = 0.5;

/// Configuration for a watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directories to watch, in order.
    pub directories: Vec<String>,

    /// Seconds to wait after the first change before a batch is delivered.
    pub latency: f64,
}

impl WatchConfig {
    /// Create an empty config with the default latency.
    pub fn new() -> Self {
        Self {
            directories: Vec::new(),
            latency: DEFAULT_LATENCY_SECS,
        }
    }

    /// Add a directory to watch.
    pub fn with_directory(mut self, dir: impl Into<String>) -> Self {
        self.directories.push(dir.into());
        self
    }

    /// Set the latency in seconds.
    pub fn with_latency(mut self, latency: f64) -> Self {
        self.latency = latency;
        self
    }

    /// Parse a config from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Check every directory and the latency.
    pub fn validate(&self) -> Result<()> {
        for dir in &self.directories {
            validate_path(dir)?;
        }
        latency_duration(self.latency)?;
        Ok(())
    }

    /// The latency as a [`Duration`].
    pub fn latency_duration(&self) -> Result<Duration> {
        latency_duration(self.latency)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The value accepted by [`crate::Watcher::watch`]: one path, an ordered list
/// of paths, or nothing at all (which clears the watch set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directories {
    /// Clear the watch set.
    None,

    /// Watch a single directory.
    One(PathBuf),

    /// Watch several directories, in order.
    Many(Vec<PathBuf>),
}

impl Directories {
    /// Convert into validated path strings. An empty list means "clear".
    pub(crate) fn into_strings(self) -> Result<Vec<String>> {
        let paths = match self {
            Self::None => Vec::new(),
            Self::One(path) => vec![path],
            Self::Many(paths) => paths,
        };

        paths
            .into_iter()
            .map(|path| match path.into_os_string().into_string() {
                Ok(s) => validate_path(&s).map(|()| s),
                Err(raw) => Err(WatcherError::InvalidArgument(format!(
                    "directory is not valid UTF-8: {}",
                    raw.to_string_lossy()
                ))),
            })
            .collect()
    }
}

impl From<&str> for Directories {
    fn from(path: &str) -> Self {
        Self::One(PathBuf::from(path))
    }
}

impl From<String> for Directories {
    fn from(path: String) -> Self {
        Self::One(PathBuf::from(path))
    }
}

impl From<&Path> for Directories {
    fn from(path: &Path) -> Self {
        Self::One(path.to_path_buf())
    }
}

impl From<PathBuf> for Directories {
    fn from(path: PathBuf) -> Self {
        Self::One(path)
    }
}

impl<P: Into<PathBuf>> From<Vec<P>> for Directories {
    fn from(paths: Vec<P>) -> Self {
        Self::Many(paths.into_iter().map(Into::into).collect())
    }
}

impl<P: Into<PathBuf> + Clone> From<&[P]> for Directories {
    fn from(paths: &[P]) -> Self {
        Self::Many(paths.iter().cloned().map(Into::into).collect())
    }
}

impl<const N: usize, P: Into<PathBuf>> From<[P; N]> for Directories {
    fn from(paths: [P; N]) -> Self {
        Self::Many(paths.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Directories>> From<Option<T>> for Directories {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::None, Into::into)
    }
}

/// Paths travel newline-separated inside a frame, so an empty path or one
/// containing `'\n'` cannot be represented.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(WatcherError::InvalidArgument(
            "directory must not be empty".to_string(),
        ));
    }
    if path.contains('\n') {
        return Err(WatcherError::InvalidArgument(format!(
            "directory must not contain a newline: {path:?}"
        )));
    }
    Ok(())
}

pub(crate) fn latency_duration(latency: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(latency).map_err(|_| {
        WatcherError::InvalidArgument(format!(
            "latency must be a finite, non-negative number of seconds, got {latency}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_builder() {
        let config = WatchConfig::new()
            .with_directory("/tmp/a")
            .with_directory("/tmp/b")
            .with_latency(0.2);

        assert_eq!(config.directories, vec!["/tmp/a", "/tmp/b"]);
        assert_eq!(config.latency_duration().unwrap(), Duration::from_millis(200));
    }

    #[test]
    fn test_config_from_json() {
        let config =
            WatchConfig::from_json_str(r#"{"directories": ["/one", "/two"], "latency": 1.5}"#)
                .unwrap();
        assert_eq!(config.directories, vec!["/one", "/two"]);
        assert_eq!(config.latency, 1.5);

        let defaults = WatchConfig::from_json_str("{}").unwrap();
        assert_eq!(defaults, WatchConfig::default());
    }

    #[test]
    fn test_config_rejects_negative_latency() {
        let result = WatchConfig::from_json_str(r#"{"latency": -1.0}"#);
        assert!(matches!(result, Err(WatcherError::InvalidArgument(_))));
        assert!(latency_duration(f64::NAN).is_err());
        assert!(latency_duration(f64::INFINITY).is_err());
    }

    #[test]
    fn test_directories_conversions() {
        assert_eq!(
            Directories::from("/Users").into_strings().unwrap(),
            vec!["/Users"]
        );
        assert_eq!(
            Directories::from(vec!["/Users", "/tmp"])
                .into_strings()
                .unwrap(),
            vec!["/Users", "/tmp"]
        );
        assert!(
            Directories::from(None::<&str>)
                .into_strings()
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_directories_reject_unframeable_paths() {
        assert!(matches!(
            Directories::from("").into_strings(),
            Err(WatcherError::InvalidArgument(_))
        ));
        assert!(matches!(
            Directories::from(["/ok", "/bad\nname"]).into_strings(),
            Err(WatcherError::InvalidArgument(_))
        ));
    }
}
