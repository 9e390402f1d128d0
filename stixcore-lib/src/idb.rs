//! Instrument database (IDB) access.
//!
//! An IDB describes the application data layout of every telemetry packet type and the
//! calibrations that turn raw parameter values into engineering values. Each IDB version lives
//! in its own directory below a root:
//!
//! ```text
//! {root}/v2.26.34/idb.json
//! {root}/v2.26.35/idb.json
//! ```
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::processing::Skm;
use crate::{Error, Result};

pub const IDB_FILENAME: &str = "idb.json";
pub const IDB_VERSION_PREFIX: &str = "v";

/// One parameter of a packet layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// IDB parameter identifier, e.g., `NIX00405`.
    pub nix: String,
    pub name: String,
    /// Bit width of a single value, 1 to 64.
    pub bits: u8,
    /// Number of consecutive values. Parameters with more than one value are array parameters.
    #[serde(default = "one")]
    pub count: usize,
    /// Calibration reference, see [Idb::calibration].
    #[serde(default)]
    pub curtx: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

fn one() -> usize {
    1
}

/// Application data layout of one `(service_type, service_subtype, ssid)` packet type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub service_type: u8,
    pub service_subtype: u8,
    #[serde(default)]
    pub ssid: Option<u8>,
    pub parameters: Vec<ParameterDef>,
}

/// Raw to engineering value conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Calibration {
    /// `sum(coeffs[i] * raw^i)`
    Polynomial { coeffs: Vec<f64> },
    /// Piecewise linear interpolation between `(raw, eng)` points sorted by `raw`. Values
    /// outside the curve are clamped to its end points.
    Curve { raw: Vec<f64>, eng: Vec<f64> },
}

impl Calibration {
    #[must_use]
    pub fn apply(&self, raw: f64) -> f64 {
        match self {
            Calibration::Polynomial { coeffs } => {
                coeffs.iter().rev().fold(0.0, |acc, c| acc * raw + c)
            }
            Calibration::Curve { raw: xs, eng: ys } => {
                let n = xs.len().min(ys.len());
                if n == 0 {
                    return raw;
                }
                if raw <= xs[0] {
                    return ys[0];
                }
                if raw >= xs[n - 1] {
                    return ys[n - 1];
                }
                let i = xs[..n].partition_point(|x| *x <= raw);
                let (x0, x1, y0, y1) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
                if x1 == x0 {
                    return y0;
                }
                y0 + (raw - x0) * (y1 - y0) / (x1 - x0)
            }
        }
    }
}

/// A single IDB version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Idb {
    pub version: String,
    #[serde(default)]
    pub layouts: Vec<Layout>,
    #[serde(default)]
    pub calibrations: BTreeMap<String, Calibration>,
    /// Compression scheme of each compressed parameter, keyed by parameter id.
    #[serde(default)]
    pub compression: BTreeMap<String, Skm>,
}

impl Idb {
    /// Read an IDB from a JSON file.
    ///
    /// # Errors
    /// If the file cannot be opened or is not a valid IDB.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let idb: Idb = serde_json::from_reader(File::open(path)?)?;
        Ok(idb)
    }

    /// Layout for a packet type. A layout without ssid matches any ssid of its service.
    #[must_use]
    pub fn layout(
        &self,
        service_type: u8,
        service_subtype: u8,
        ssid: Option<u8>,
    ) -> Option<&Layout> {
        let same_service = |l: &&Layout| {
            l.service_type == service_type && l.service_subtype == service_subtype
        };
        self.layouts
            .iter()
            .filter(same_service)
            .find(|l| l.ssid.is_some() && l.ssid == ssid)
            .or_else(|| self.layouts.iter().filter(same_service).find(|l| l.ssid.is_none()))
    }

    #[must_use]
    pub fn calibration(&self, curtx: &str) -> Option<&Calibration> {
        self.calibrations.get(curtx)
    }
}

fn parse_label(label: &str) -> Option<(u32, u32, u32)> {
    let mut parts = label.split('.').map(str::parse::<u32>);
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) => Some((major, minor, patch)),
        _ => None,
    }
}

/// Manages the IDB versions available below a root directory.
#[derive(Debug, Clone)]
pub struct IdbManager {
    root: PathBuf,
}

impl IdbManager {
    /// # Errors
    /// [Error::Config] if `root` does not exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "IDB root not found: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn filename(&self, version: &str) -> PathBuf {
        self.root
            .join(format!("{IDB_VERSION_PREFIX}{version}"))
            .join(IDB_FILENAME)
    }

    /// Labels of all versions found, in ascending version order.
    ///
    /// # Errors
    /// If the root directory cannot be read.
    pub fn versions(&self) -> Result<Vec<String>> {
        let mut versions = Vec::default();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(label) = name.strip_prefix(IDB_VERSION_PREFIX) else {
                continue;
            };
            let Some(key) = parse_label(label) else {
                debug!(dir = %name, "ignoring directory that is not an IDB version");
                continue;
            };
            if entry.path().join(IDB_FILENAME).is_file() {
                versions.push((key, label.to_string()));
            }
        }
        versions.sort();
        Ok(versions.into_iter().map(|(_, label)| label).collect())
    }

    /// Whether `version` exists and its file carries the same version label.
    #[must_use]
    pub fn has_version(&self, version: &str) -> bool {
        let path = self.filename(version);
        if !path.is_file() {
            return false;
        }
        match Idb::from_file(&path) {
            Ok(idb) => idb.version == version,
            Err(err) => {
                warn!(path = %path.display(), "failed to read IDB: {err}");
                false
            }
        }
    }

    /// # Errors
    /// [Error::Config] if the version does not exist, otherwise errors reading the file.
    pub fn get(&self, version: &str) -> Result<Idb> {
        let path = self.filename(version);
        if !path.is_file() {
            return Err(Error::Config(format!(
                "IDB version {version:?} not found in {}",
                self.root.display()
            )));
        }
        let idb = Idb::from_file(&path)?;
        if idb.version != version {
            return Err(Error::Config(format!(
                "IDB at {} is version {:?}, expected {version:?}",
                path.display(),
                idb.version
            )));
        }
        Ok(idb)
    }

    /// The highest available version.
    ///
    /// # Errors
    /// [Error::Config] if there are no versions.
    pub fn latest(&self) -> Result<Idb> {
        let versions = self.versions()?;
        let Some(version) = versions.last() else {
            return Err(Error::Config(format!(
                "no IDB versions in {}",
                self.root.display()
            )));
        };
        self.get(version)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A small IDB describing `3/25` housekeeping and `21/6` lightcurve packets. Lightcurve
    /// packets carry four counts split over `num_samples` samples.
    pub fn idb() -> Idb {
        Idb {
            version: "2.26.34".to_string(),
            layouts: vec![
                Layout {
                    service_type: 3,
                    service_subtype: 25,
                    ssid: Some(1),
                    parameters: vec![
                        ParameterDef {
                            nix: "NIXD0001".into(),
                            name: "ssid".into(),
                            bits: 8,
                            count: 1,
                            curtx: None,
                            unit: None,
                        },
                        ParameterDef {
                            nix: "NIX00078".into(),
                            name: "hk_temp".into(),
                            bits: 16,
                            count: 1,
                            curtx: Some("CIX00001TM".into()),
                            unit: Some("degC".into()),
                        },
                    ],
                },
                Layout {
                    service_type: 21,
                    service_subtype: 6,
                    ssid: Some(30),
                    parameters: vec![
                        ParameterDef {
                            nix: "NIXD0001".into(),
                            name: "ssid".into(),
                            bits: 8,
                            count: 1,
                            curtx: None,
                            unit: None,
                        },
                        ParameterDef {
                            nix: "NIX00405".into(),
                            name: "integration_time".into(),
                            bits: 8,
                            count: 1,
                            curtx: None,
                            unit: None,
                        },
                        ParameterDef {
                            nix: "NIX00270".into(),
                            name: "num_samples".into(),
                            bits: 8,
                            count: 1,
                            curtx: None,
                            unit: None,
                        },
                        ParameterDef {
                            nix: "NIX00272".into(),
                            name: "counts".into(),
                            bits: 8,
                            count: 4,
                            curtx: None,
                            unit: None,
                        },
                    ],
                },
            ],
            calibrations: BTreeMap::from([(
                "CIX00001TM".to_string(),
                Calibration::Polynomial {
                    coeffs: vec![-10.0, 0.5],
                },
            )]),
            compression: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_version(root: &Path, dir: &str, version: &str) {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).unwrap();
        let idb = Idb {
            version: version.to_string(),
            ..testing::idb()
        };
        fs::write(dir.join(IDB_FILENAME), serde_json::to_string(&idb).unwrap()).unwrap();
    }

    #[test]
    fn missing_root() {
        let zult = IdbManager::new("/this/path/does/not/exist");
        assert!(matches!(zult, Err(Error::Config(_))), "got {zult:?}");
    }

    #[test]
    fn versions() {
        let tmp = tempfile::tempdir().unwrap();
        write_version(tmp.path(), "v2.26.35", "2.26.35");
        write_version(tmp.path(), "v2.26.4", "2.26.4");
        write_version(tmp.path(), "v1.0.0", "9.9.9");
        fs::create_dir_all(tmp.path().join("other")).unwrap();

        let mgr = IdbManager::new(tmp.path()).unwrap();
        assert_eq!(mgr.versions().unwrap(), vec!["1.0.0", "2.26.4", "2.26.35"]);
        assert!(mgr.has_version("2.26.35"));
        // label in the file does not match the directory
        assert!(!mgr.has_version("1.0.0"));
        assert!(!mgr.has_version("3.0.0"));
        assert!(matches!(mgr.get("3.0.0"), Err(Error::Config(_))));
        assert_eq!(mgr.latest().unwrap().version, "2.26.35");
    }

    #[test]
    fn layout_lookup() {
        let mut idb = testing::idb();
        idb.layouts.push(Layout {
            service_type: 5,
            service_subtype: 1,
            ssid: None,
            parameters: Vec::default(),
        });
        assert!(idb.layout(3, 25, Some(1)).is_some());
        assert!(idb.layout(3, 25, Some(2)).is_none());
        assert!(idb.layout(5, 1, Some(7)).is_some());
    }

    #[test]
    fn calibrations() {
        let poly = Calibration::Polynomial {
            coeffs: vec![1.0, 2.0, 3.0],
        };
        assert_eq!(poly.apply(2.0), 17.0);

        let curve = Calibration::Curve {
            raw: vec![0.0, 10.0, 20.0],
            eng: vec![0.0, 100.0, 120.0],
        };
        assert_eq!(curve.apply(-1.0), 0.0);
        assert_eq!(curve.apply(5.0), 50.0);
        assert_eq!(curve.apply(15.0), 110.0);
        assert_eq!(curve.apply(25.0), 120.0);
    }
}
