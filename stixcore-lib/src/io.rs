//! Persisted products.
//!
//! A product file holds a header of string keys and the named tables `CONTROL`, `DATA` and the
//! optional `ENERGIES` and `IDB_VERSIONS`. [ProductStore] encodes such a [ProductFile];
//! [JsonStore] is the JSON encoding. [ProductFactory] turns files into [Product]s and
//! [ProductWriter] writes products into an archive directory tree, merging with files already
//! there.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use hifitime::Epoch;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::products::table::{Column, Columns, Values};
use crate::products::{
    Control, Data, Energies, IdbVersions, Level, Product, ProductKind, Registry, Selector,
};
use crate::time::{LinearClock, ScetDelta, ScetTime, TimeService, SEC_IN_DAY};
use crate::{Error, Result};

/// Header keys of a product file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(BTreeMap<String, String>);

impl Header {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Value of `key` parsed as `T`, `None` if missing or unparseable.
    #[must_use]
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Semicolon separated list value of `key`.
    #[must_use]
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn insert<V: ToString>(&mut self, key: &str, value: V) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Stored form of [Data]: for processed levels `time` is relative to `OBT_BEG` and both `time`
/// and `timedel` are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredData {
    #[serde(default)]
    pub time: Vec<f64>,
    #[serde(default)]
    pub timedel: Vec<f64>,
    pub control_index: Vec<usize>,
    #[serde(default)]
    pub columns: Columns,
}

/// The contents of a product file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductFile {
    pub header: Header,
    #[serde(rename = "CONTROL", default, skip_serializing_if = "Option::is_none")]
    pub control: Option<Control>,
    #[serde(rename = "DATA", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StoredData>,
    #[serde(rename = "ENERGIES", default, skip_serializing_if = "Option::is_none")]
    pub energies: Option<Energies>,
    #[serde(rename = "IDB_VERSIONS", default, skip_serializing_if = "Option::is_none")]
    pub idb_versions: Option<IdbVersions>,
}

/// Encoding of product files.
pub trait ProductStore: Send + Sync {
    /// File name extension, without the dot.
    fn extension(&self) -> &'static str;

    /// # Errors
    /// If the file cannot be read or decoded.
    fn read(&self, path: &Path) -> Result<ProductFile>;

    /// # Errors
    /// If the file cannot be written.
    fn write(&self, path: &Path, file: &ProductFile) -> Result<()>;
}

/// Stores product files as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStore;

impl ProductStore for JsonStore {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn read(&self, path: &Path) -> Result<ProductFile> {
        let file: ProductFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        Ok(file)
    }

    fn write(&self, path: &Path, file: &ProductFile) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        serde_json::to_writer(BufWriter::new(File::create(path)?), file)?;
        Ok(())
    }
}

/// Stored `time_stamp` columns hold float seconds; in memory they hold SCET ticks.
const TIME_STAMP: &str = "time_stamp";

fn time_stamp_to_ticks(control: &mut Control) {
    let Some(col) = control.extra.get(TIME_STAMP) else {
        return;
    };
    if let Values::F64(seconds) = &col.values {
        let ticks = seconds
            .iter()
            .map(|s| ScetTime::from_float(*s).ticks())
            .collect();
        let converted = Column::new(TIME_STAMP, Values::U64(ticks)).with_width(col.width);
        control.extra.insert(converted);
    }
}

fn time_stamp_to_seconds(control: &mut Control) {
    let Some(col) = control.extra.get(TIME_STAMP) else {
        return;
    };
    if let Values::U64(ticks) = &col.values {
        let seconds = ticks
            .iter()
            .map(|t| ScetTime::from_ticks(*t).as_float())
            .collect();
        let converted = Column::new(TIME_STAMP, Values::F64(seconds)).with_width(col.width);
        control.extra.insert(converted);
    }
}

fn has_relative_time(level: Level) -> bool {
    !matches!(level, Level::LB | Level::LL01)
}

impl ProductFile {
    /// The stored form of `product`, with header keys describing it.
    #[must_use]
    pub fn from_product(product: &Product, filename: &str) -> Self {
        let range = product.scet_timerange();
        let obt_beg = if range.is_empty() {
            ScetTime::MIN
        } else {
            range.start
        };

        let mut header = product.header.as_deref().cloned().unwrap_or_default();
        header.insert("stype", product.service_type);
        header.insert("sstype", product.service_subtype);
        header.insert("ssid", product.ssid.map(|s| s.to_string()).unwrap_or_default());
        header.insert("Level", product.level);
        header.insert("parent", product.parent().join(";"));
        header.insert("raw_file", product.raw().join(";"));
        header.insert("OBT_BEG", obt_beg);
        header.insert("OBT_END", if range.is_empty() { obt_beg } else { range.end });
        header.insert("TIMESYS", "OBT");
        header.insert("FILENAME", filename);
        if let Ok(now) = Epoch::now() {
            header.insert("DATE", now);
        }

        let mut control = product.control.clone();
        time_stamp_to_seconds(&mut control);

        let data = &product.data;
        let (time, timedel) = if has_relative_time(product.level) {
            (
                data.time.iter().map(|t| (*t - obt_beg).as_seconds()).collect(),
                data.timedel.iter().map(ScetDelta::as_seconds).collect(),
            )
        } else if product.level == Level::LL01 {
            (
                data.time.iter().map(ScetTime::as_float).collect(),
                data.timedel.iter().map(ScetDelta::as_seconds).collect(),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        ProductFile {
            header,
            control: Some(control),
            data: Some(StoredData {
                time,
                timedel,
                control_index: data.control_index.clone(),
                columns: data.columns.clone(),
            }),
            energies: product.energies.clone(),
            idb_versions: (product.level != Level::LB).then(|| product.idb_versions.clone()),
        }
    }
}

/// Builds products from product files, selecting the variant with a [Registry].
pub struct ProductFactory {
    registry: Registry,
    store: Box<dyn ProductStore>,
}

impl Default for ProductFactory {
    fn default() -> Self {
        Self::new(Registry::standard(), Box::new(JsonStore))
    }
}

impl ProductFactory {
    #[must_use]
    pub fn new(registry: Registry, store: Box<dyn ProductStore>) -> Self {
        Self { registry, store }
    }

    #[must_use]
    pub fn store(&self) -> &dyn ProductStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Load the product stored at `path`.
    ///
    /// # Errors
    /// If the file cannot be read, lacks the `Level` header, `CONTROL` or `DATA`, or the
    /// registry fails to select a variant.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Product> {
        let path = path.as_ref();
        let file = self.store.read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.from_file(&name, file)
    }

    /// Build a product from file contents. `filename` is used to fill gaps in low latency
    /// headers.
    ///
    /// # Errors
    /// As [ProductFactory::load].
    pub fn from_file(&self, filename: &str, file: ProductFile) -> Result<Product> {
        let header = file.header;
        let mut service_type: u8 = header.parse("stype").unwrap_or_default();
        let mut service_subtype: u8 = header.parse("sstype").unwrap_or_default();
        let mut ssid: Option<u8> = header.parse("ssid");
        let Some(level) = header.get("Level") else {
            return Err(Error::Header("missing Level".to_string()));
        };
        let level = Level::from_str(level)?;

        let Some(mut control) = file.control else {
            return Err(Error::MissingTable("CONTROL".to_string()));
        };
        let Some(stored) = file.data else {
            return Err(Error::MissingTable("DATA".to_string()));
        };

        if level == Level::LL01 {
            // low latency headers do not identify the product
            if filename.contains("lightcurve") {
                (service_type, service_subtype, ssid) = (21, 6, Some(30));
            } else if filename.contains("flareflag") {
                (service_type, service_subtype, ssid) = (21, 6, Some(34));
            }
        }

        let mut data = Data {
            control_index: stored.control_index,
            columns: stored.columns,
            ..Default::default()
        };
        if has_relative_time(level) {
            let Some(obt_beg) = header.parse::<ScetTime>("OBT_BEG") else {
                return Err(Error::Header("missing or invalid OBT_BEG".to_string()));
            };
            data.time = stored
                .time
                .iter()
                .map(|t| obt_beg + ScetDelta::from_seconds(*t))
                .collect();
            data.timedel = stored.timedel.iter().map(|t| ScetDelta::from_seconds(*t)).collect();
            time_stamp_to_ticks(&mut control);
        } else if level == Level::LL01 {
            data.time = stored.time.iter().map(|t| ScetTime::from_float(*t)).collect();
            data.timedel = stored.timedel.iter().map(|t| ScetDelta::from_seconds(*t)).collect();
        }
        control.fill_missing();
        data.fill_missing();

        let energies = if level == Level::L1 {
            if file.energies.is_none() {
                debug!(filename, "no ENERGIES table");
            }
            file.energies
        } else {
            None
        };

        let idb_versions = if matches!(level, Level::L0 | Level::L1) {
            file.idb_versions.unwrap_or_else(|| {
                warn!(filename, "no IDB_VERSIONS table; assuming none");
                IdbVersions::new()
            })
        } else {
            file.idb_versions.unwrap_or_default()
        };

        let selector = Selector::new(level, service_type, service_subtype, ssid)
            .with_tables(&control, &data)
            .with_energies(energies.as_ref());
        let kind = self.registry.dispatch(&selector)?;
        debug!(filename, %kind, %level, "loaded");

        let header = matches!(level, Level::L1 | Level::L2).then(|| Arc::new(header));
        Ok(Product::builder()
            .kind(kind)
            .level(level)
            .service_type(service_type)
            .service_subtype(service_subtype)
            .ssid(ssid)
            .control(control)
            .data(data)
            .idb_versions(idb_versions)
            .energies(energies)
            .header(header)
            .build())
    }
}

fn utc_compact(epoch: Epoch) -> String {
    let (y, m, d, h, min, s, _) = epoch.to_gregorian_utc();
    format!("{y:04}{m:02}{d:02}T{h:02}{min:02}{s:02}")
}

/// File name for `product`:
///
/// `solo_{LEVEL}_stix-{type}-{name}[-{request_id}]_{time}_V{version:02}[_{tc_seq}].{ext}`
///
/// `time` is a UTC range for science products, the start of the instrument day for the other
/// LB and L0 products and the UTC day for the higher levels. Underscores in the name are
/// replaced by hyphens.
#[must_use]
pub fn filename(product: &Product, time: &dyn TimeService, version: u32, ext: &str) -> String {
    let range = product.scet_timerange();
    let start = if range.is_empty() { ScetTime::MIN } else { range.start };
    let end = if range.is_empty() { start } else { range.end };

    let mut name = product.kind.to_string().replace('_', "-");
    if let Some(request_id) = product.control.extra_u64("request_id", 0) {
        name = format!("{name}-{request_id}");
    }

    let timestr = match (product.kind, product.level) {
        (ProductKind::Science(_), _) => format!(
            "{}-{}",
            utc_compact(time.scet_to_utc(start)),
            utc_compact(time.scet_to_utc(end))
        ),
        (_, Level::LB | Level::L0) => format!("{:010}", start.sceday() * SEC_IN_DAY),
        _ => time.utc_day(start).to_string(),
    };

    let mut filename = format!("solo_{}_stix-{name}_{timestr}_V{version:02}", product.level);
    if let Some(seq) = product.control.extra_u64("tc_packet_seq_control", 0) {
        filename = format!("{filename}_{seq}");
    }
    format!("{filename}.{ext}")
}

/// Archive directory for `product`: `{root}/{LEVEL}/{stype}/{sstype}[/{ssid}]`.
#[must_use]
pub fn product_dir(root: &Path, product: &Product) -> PathBuf {
    let mut dir = root
        .join(product.level.as_str())
        .join(product.service_type.to_string())
        .join(product.service_subtype.to_string());
    if let Some(ssid) = product.ssid {
        dir = dir.join(ssid.to_string());
    }
    dir
}

fn find_files(dir: &Path, names: &[String], found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            find_files(&path, names, found)?;
        } else if path
            .file_name()
            .is_some_and(|n| names.iter().any(|name| n.to_string_lossy() == name.as_str()))
        {
            found.push(path);
        }
    }
    Ok(())
}

/// Locate the parent files of `product` in the archive below `root`.
///
/// Parents are searched in the directory of the level below the product's level. Level binary
/// and low latency products have no parents.
///
/// # Errors
/// If the archive cannot be read.
pub fn find_parent_files(root: &Path, product: &Product) -> Result<Vec<PathBuf>> {
    let parent_level = match product.level {
        Level::LB | Level::LL01 => return Ok(Vec::new()),
        Level::L0 => Level::LB,
        Level::L1 => Level::L0,
        Level::L2 => Level::L1,
    };
    let dir = root.join(parent_level.as_str());
    let names = product.parent();
    let mut found = Vec::new();
    if dir.is_dir() && !names.is_empty() {
        find_files(&dir, &names, &mut found)?;
    }
    found.sort();
    Ok(found)
}

/// Writes products into an archive directory, merging with existing files of the same name.
#[derive(TypedBuilder)]
pub struct ProductWriter {
    #[builder(setter(into))]
    root: PathBuf,
    #[builder(default)]
    factory: ProductFactory,
    #[builder(default=Box::new(LinearClock::default()))]
    time: Box<dyn TimeService>,
    /// Version number written into file names.
    #[builder(default = 1)]
    version: u32,
}

impl ProductWriter {
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn factory(&self) -> &ProductFactory {
        &self.factory
    }

    /// Path `product` is written to.
    #[must_use]
    pub fn path_for(&self, product: &Product) -> PathBuf {
        let name = filename(
            product,
            self.time.as_ref(),
            self.version,
            self.factory.store().extension(),
        );
        product_dir(&self.root, product).join(name)
    }

    /// Write `product`. If the file exists, the stored product is combined with `product`
    /// and the result written in its place.
    ///
    /// # Errors
    /// If an existing file cannot be loaded or combined, or the file cannot be written.
    pub fn write(&self, product: &Product) -> Result<PathBuf> {
        let path = self.path_for(product);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let merged;
        let product = if path.exists() {
            let existing = self.factory.load(&path)?;
            info!(path = %path.display(), "merging with existing file");
            merged = existing.combine(product)?;
            &merged
        } else {
            product
        };

        let file = ProductFile::from_product(product, &filename);
        self.factory.store().write(&path, &file)?;
        debug!(path = %path.display(), rows = product.data.len(), "wrote product");
        Ok(path)
    }

    /// Split `product` into days and write each day.
    ///
    /// # Errors
    /// As [ProductWriter::write].
    pub fn write_days(&self, product: &Product) -> Result<Vec<PathBuf>> {
        product
            .partition_by_day(self.time.as_ref())
            .map(|day| self.write(&day))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::products::{HkReport, QlProduct, ScienceProduct};

    fn product(kind: ProductKind, level: Level, times: &[u32]) -> Product {
        let n = times.len();
        let mut control = Control {
            scet_coarse: times.to_vec(),
            index: (0..n).collect(),
            ..Default::default()
        };
        control.fill_missing();
        let data = Data {
            time: times.iter().map(|t| ScetTime::new(*t, 0)).collect(),
            timedel: vec![ScetDelta::from_seconds(1.0); n],
            control_index: (0..n).collect(),
            columns: vec![Column::new(
                "counts",
                Values::U16(times.iter().map(|t| (*t % 1000) as u16).collect()),
            )]
            .into(),
        };
        let (service_type, service_subtype, ssid) = match kind {
            ProductKind::Housekeeping(hk) => (3, 25, Some(hk.ssid())),
            ProductKind::QuickLook(ql) => (21, 6, Some(ql.ssid())),
            ProductKind::Science(sci) => (21, 6, Some(sci.ssid())),
            _ => (5, 1, None),
        };
        Product::builder()
            .kind(kind)
            .level(level)
            .service_type(service_type)
            .service_subtype(service_subtype)
            .ssid(ssid)
            .control(control)
            .data(data)
            .build()
    }

    #[test]
    fn header_values() {
        let mut header = Header::new();
        header.insert("stype", 21);
        header.insert("ssid", "");
        header.insert("parent", "a.json; b.json;");
        assert_eq!(header.parse::<u8>("stype"), Some(21));
        assert_eq!(header.parse::<u8>("ssid"), None);
        assert_eq!(header.list("parent"), vec!["a.json", "b.json"]);
        assert!(header.list("raw_file").is_empty());
    }

    #[test]
    fn filenames() {
        let clock = LinearClock::default();
        let ql = product(ProductKind::QuickLook(QlProduct::LightCurve), Level::L0, &[86_500]);
        assert_eq!(
            filename(&ql, &clock, 1, "json"),
            "solo_L0_stix-ql-lightcurve_0000086400_V01.json"
        );

        let hk = product(ProductKind::Housekeeping(HkReport::Maxi), Level::L1, &[86_500]);
        assert_eq!(
            filename(&hk, &clock, 2, "json"),
            "solo_L1_stix-hk-maxi_20000102_V02.json"
        );

        let mut sci = product(
            ProductKind::Science(ScienceProduct::Spectrogram),
            Level::L1,
            &[100, 200],
        );
        sci.control.add_uint("request_id", &[1234, 1234]);
        sci.control.add_uint("tc_packet_seq_control", &[77, 77]);
        assert_eq!(
            filename(&sci, &clock, 1, "json"),
            "solo_L1_stix-sci-xray-spectrogram-1234_20000101T000139-20000101T000320_V01_77.json"
        );
    }

    #[test]
    fn write_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ProductWriter::builder().root(tmp.path()).build();
        let mut p = product(ProductKind::QuickLook(QlProduct::LightCurve), Level::L1, &[10, 20]);
        p.control.add_uint("num_samples", &[1, 1]);
        let stamp = ScetTime::new(10, 5).ticks();
        p.control
            .extra
            .insert(Column::new(TIME_STAMP, Values::U64(vec![stamp; 2])));
        p.control.set_parent("parent.json");
        p.energies = Some(Energies::from_mask(None).unwrap());
        p.idb_versions.insert(
            "2.26.34".into(),
            crate::time::ScetTimeRange::new(ScetTime::new(10, 0), ScetTime::new(20, 0)),
        );

        let path = writer.write(&p).unwrap();
        assert!(path.starts_with(tmp.path().join("L1").join("21").join("6").join("30")));

        let loaded = ProductFactory::default().load(&path).unwrap();
        assert_eq!(loaded.kind, p.kind);
        assert_eq!(loaded.level, Level::L1);
        assert_eq!(loaded.control, p.control);
        assert_eq!(loaded.data, p.data);
        assert_eq!(loaded.energies, p.energies);
        assert_eq!(loaded.idb_versions, p.idb_versions);
        let header = loaded.header.unwrap();
        assert_eq!(header.get("parent"), Some("parent.json"));
        assert_eq!(header.get("OBT_BEG"), Some("0000000009:32768"));
    }

    #[test]
    fn load_without_optional_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let p = product(ProductKind::Housekeeping(HkReport::Mini), Level::L0, &[10, 20]);
        let mut file = ProductFile::from_product(&p, "x.json");
        file.idb_versions = None;
        file.energies = None;
        let path = tmp.path().join("x.json");
        JsonStore.write(&path, &file).unwrap();

        let loaded = ProductFactory::default().load(&path).unwrap();
        assert!(loaded.idb_versions.is_empty());
        assert!(loaded.energies.is_none());
        assert!(loaded.header.is_none());
        assert_eq!(loaded.kind, ProductKind::Housekeeping(HkReport::Mini));

        let mut file = ProductFile::from_product(&p, "x.json");
        file.control = None;
        JsonStore.write(&path, &file).unwrap();
        let zult = ProductFactory::default().load(&path);
        assert!(matches!(zult, Err(Error::MissingTable(_))), "got {zult:?}");
    }

    #[test]
    fn load_low_latency_from_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let p = product(ProductKind::QuickLook(QlProduct::FlareFlag), Level::LL01, &[10]);
        let mut file = ProductFile::from_product(&p, "");
        file.header.insert("stype", "");
        file.header.insert("sstype", "");
        let path = tmp.path().join("solo_LL01_stix-ql-flareflag_0000000000_V01.json");
        JsonStore.write(&path, &file).unwrap();

        let loaded = ProductFactory::default().load(&path).unwrap();
        assert_eq!(loaded.kind, ProductKind::QuickLook(QlProduct::FlareFlag));
        assert_eq!(loaded.data.time, p.data.time);
    }

    #[test]
    fn write_merges_into_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ProductWriter::builder().root(tmp.path()).build();
        let a = product(ProductKind::Housekeeping(HkReport::Maxi), Level::L0, &[10, 30]);
        let b = product(ProductKind::Housekeeping(HkReport::Maxi), Level::L0, &[20, 30, 40]);

        let first = writer.write(&a).unwrap();
        let second = writer.write(&b).unwrap();
        assert_eq!(first, second);

        let merged = ProductFactory::default().load(&second).unwrap();
        let coarse: Vec<u32> = merged.data.time.iter().map(ScetTime::coarse).collect();
        assert_eq!(coarse, vec![10, 20, 30, 40]);
        merged.validate().unwrap();
    }

    #[test]
    fn parent_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("L0").join("3").join("25").join("1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("p1.json"), "{}").unwrap();
        fs::write(dir.join("other.json"), "{}").unwrap();

        let mut p = product(ProductKind::Housekeeping(HkReport::Mini), Level::L1, &[1, 2]);
        p.control.parent = vec!["p1.json".into(), "missing.json".into()];
        assert_eq!(
            find_parent_files(tmp.path(), &p).unwrap(),
            vec![dir.join("p1.json")]
        );

        let p = product(ProductKind::Housekeeping(HkReport::Mini), Level::L0, &[1]);
        assert!(find_parent_files(tmp.path(), &p).unwrap().is_empty());
    }
}
