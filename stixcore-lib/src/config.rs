//! Processing configuration.
//!
//! Configuration is read from a TOML file. Every key is optional and missing keys take their
//! defaults, e.g.:
//!
//! ```toml
//! [paths]
//! tm_archive = "/data/stix/tm"
//! fits_archive = "/data/stix/products"
//! idb_root = "/data/stix/idb"
//!
//! [processing]
//! stop_on_error = false
//! packet_policy = "skip"
//! clock_epoch = "2000-01-01T00:00:00 UTC"
//! file_version = 1
//! ```
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::products::PacketPolicy;
use crate::time::{LinearClock, DEFAULT_CLOCK_EPOCH};
use crate::{Error, Result};

/// Environment variable holding the path of the configuration file.
pub const CONFIG_ENV: &str = "STIXCORE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory searched for raw telemetry files.
    pub tm_archive: PathBuf,
    /// Root of the product archive.
    pub fits_archive: PathBuf,
    /// Directory holding `v{version}/idb.json` files.
    pub idb_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tm_archive: PathBuf::from("./tm"),
            fits_archive: PathBuf::from("./products"),
            idb_root: PathBuf::from("./idb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Abort a run on the first input that fails instead of logging and continuing.
    pub stop_on_error: bool,
    pub packet_policy: PacketPolicy,
    /// IDB version used for decoding; the latest available if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idb_version: Option<String>,
    /// UTC epoch of the instrument clock zero.
    pub clock_epoch: String,
    /// Version number written into product file names.
    pub file_version: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            packet_policy: PacketPolicy::default(),
            idb_version: None,
            clock_epoch: DEFAULT_CLOCK_EPOCH.to_string(),
            file_version: 1,
        }
    }
}

impl Config {
    /// Parse TOML configuration.
    ///
    /// # Errors
    /// [Error::Config] if the text is not valid configuration.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// If the file cannot be read or is not valid configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        debug!(path = %path.display(), "loading config");
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Configuration from the file named by [CONFIG_ENV], or the defaults if it is not set.
    ///
    /// # Errors
    /// If the variable is set and the file cannot be loaded.
    pub fn from_env_or_default() -> Result<Self> {
        match env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// # Errors
    /// [Error::Config] for an unparseable clock epoch or a zero file version.
    pub fn validate(&self) -> Result<()> {
        LinearClock::parse(&self.processing.clock_epoch)?;
        if self.processing.file_version == 0 {
            return Err(Error::Config("file_version must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The clock described by `processing.clock_epoch`.
    ///
    /// # Errors
    /// [Error::Config] if the epoch cannot be parsed.
    pub fn clock(&self) -> Result<LinearClock> {
        LinearClock::parse(&self.processing.clock_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.processing.packet_policy, PacketPolicy::Skip);
        assert_eq!(config.processing.file_version, 1);
        assert_eq!(config.clock().unwrap().epoch(), LinearClock::default().epoch());
    }

    #[test]
    fn partial_file() {
        let config = Config::parse(
            r#"
            [paths]
            idb_root = "/opt/idb"

            [processing]
            stop_on_error = true
            packet_policy = "abort"
            idb_version = "2.26.34"
            "#,
        )
        .unwrap();
        assert_eq!(config.paths.idb_root, PathBuf::from("/opt/idb"));
        assert_eq!(config.paths.tm_archive, PathBuf::from("./tm"));
        assert!(config.processing.stop_on_error);
        assert_eq!(config.processing.packet_policy, PacketPolicy::Abort);
        assert_eq!(config.processing.idb_version.as_deref(), Some("2.26.34"));
    }

    #[test]
    fn invalid() {
        let zult = Config::parse("[processing]\nclock_epoch = \"yesterday\"");
        assert!(matches!(zult, Err(Error::Config(_))), "got {zult:?}");
        let zult = Config::parse("[processing]\npacket_policy = \"retry\"");
        assert!(matches!(zult, Err(Error::Config(_))), "got {zult:?}");
        let zult = Config::parse("[processing]\nfile_version = 0");
        assert!(matches!(zult, Err(Error::Config(_))), "got {zult:?}");
    }

    #[test]
    fn load_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stixcore.toml");
        fs::write(&path, "[processing]\nfile_version = 3\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().processing.file_version, 3);
        assert!(Config::load(tmp.path().join("missing.toml")).is_err());
    }
}
