//! Level processing over batches of files.
//!
//! Inputs are loaded and transformed in parallel, one task per file. Products of the same
//! variant are then folded together with [Product::combine], split into days and written
//! with a [ProductWriter], which merges each day into any file already in the archive.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::config::Config;
use crate::idb::IdbManager;
use crate::io::ProductWriter;
use crate::processing::Processors;
use crate::products::{Level, Product, RawPacket};
use crate::tmtc::{collect_sequences, read_packets};
use crate::{Error, Result};

#[derive(TypedBuilder)]
pub struct Pipeline {
    processors: Processors,
    writer: ProductWriter,
    /// Fail the run on the first input that fails rather than logging and skipping it.
    #[builder(default)]
    stop_on_error: bool,
    /// Worker threads used to process inputs, 0 to let rayon decide.
    #[builder(default)]
    threads: usize,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Read the packets of a raw telemetry file, keeping complete packet sequences only.
/// Packets whose headers cannot be decoded are logged and dropped.
///
/// # Errors
/// If the file cannot be opened or read.
pub fn read_tm_file(path: &Path) -> Result<Vec<RawPacket>> {
    let raw_file = file_name(path);
    let mut packets = Vec::new();
    for zult in read_packets(BufReader::new(File::open(path)?)) {
        match zult {
            Ok(packet) => packets.push(packet),
            Err(Error::Io(err)) => return Err(Error::Io(err)),
            Err(err) => warn!(file = %raw_file, "dropping corrupt packet: {err}"),
        }
    }
    let total = packets.len();
    let packets: Vec<RawPacket> = collect_sequences(packets)
        .into_iter()
        .flat_map(|seq| seq.packets)
        .map(|packet| RawPacket {
            packet,
            raw_file: raw_file.clone(),
        })
        .collect();
    debug!(file = %raw_file, total, kept = packets.len(), "read telemetry");
    Ok(packets)
}

/// Fold products of the same variant into one.
///
/// # Errors
/// If two products of the same variant cannot be combined.
pub fn combine_by_kind(products: Vec<Product>) -> Result<Vec<Product>> {
    let mut combined: Vec<Product> = Vec::new();
    for product in products {
        match combined.iter_mut().find(|p| p.kind == product.kind) {
            Some(existing) => *existing = existing.combine(&product)?,
            None => combined.push(product),
        }
    }
    Ok(combined)
}

impl Pipeline {
    /// A pipeline set up from `config`: the configured or latest IDB version, the product
    /// archive as output and the configured clock.
    ///
    /// # Errors
    /// [Error::Config] if the IDB or clock cannot be set up.
    pub fn from_config(config: &Config) -> Result<Self> {
        let manager = IdbManager::new(&config.paths.idb_root)?;
        let idb = match &config.processing.idb_version {
            Some(version) => manager.get(version)?,
            None => manager.latest()?,
        };
        info!(version = %idb.version, "using IDB");
        let writer = ProductWriter::builder()
            .root(config.paths.fits_archive.clone())
            .time(Box::new(config.clock()?))
            .version(config.processing.file_version)
            .build();
        Ok(Pipeline::builder()
            .processors(Processors::for_idb(idb, config.processing.packet_policy))
            .writer(writer)
            .stop_on_error(config.processing.stop_on_error)
            .build())
    }

    #[must_use]
    pub fn writer(&self) -> &ProductWriter {
        &self.writer
    }

    fn parallel<T, F>(&self, inputs: &[PathBuf], task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&Path) -> Result<Vec<T>> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| Error::Config(format!("failed to build thread pool: {e}")))?;
        let results: Vec<(PathBuf, Result<Vec<T>>)> = pool.install(|| {
            inputs
                .par_iter()
                .map(|path| (path.clone(), task(path)))
                .collect()
        });

        let mut outputs = Vec::new();
        for (path, zult) in results {
            match zult {
                Ok(items) => outputs.extend(items),
                Err(err) if self.stop_on_error => return Err(err),
                Err(err) => error!(path = %path.display(), "skipping input: {err}"),
            }
        }
        Ok(outputs)
    }

    fn write(&self, products: Vec<Product>) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for product in combine_by_kind(products)? {
            match self.writer.write_days(&product) {
                Ok(paths) => written.extend(paths),
                Err(err) if self.stop_on_error => return Err(err),
                Err(err) => error!(kind = %product.kind, "failed to write product: {err}"),
            }
        }
        written.sort();
        written.dedup();
        Ok(written)
    }

    /// Build level binary products from raw telemetry files and process them up to `end`.
    /// Returns the files written at `end`.
    ///
    /// # Errors
    /// The first failure if `stop_on_error` is set, otherwise only failures to combine
    /// products of the same variant.
    pub fn process_tm(&self, tm_files: &[PathBuf], end: Level) -> Result<Vec<PathBuf>> {
        info!(files = tm_files.len(), %end, "processing telemetry");
        let products = self.parallel(tm_files, |path| {
            Product::level_binary_products(read_tm_file(path)?)
        })?;
        let written = self.write(products)?;
        info!(level = %Level::LB, files = written.len(), "wrote");
        if end == Level::LB {
            return Ok(written);
        }
        self.process_files(&written, end)
    }

    /// Derive products from product files level by level until `end`. Returns the files
    /// written at `end`.
    ///
    /// # Errors
    /// As [Pipeline::process_tm].
    pub fn process_files(&self, files: &[PathBuf], end: Level) -> Result<Vec<PathBuf>> {
        let mut inputs = files.to_vec();
        loop {
            let products = self.parallel(&inputs, |path| self.derive(path, end))?;
            if products.is_empty() {
                return Ok(Vec::new());
            }
            let level = products[0].level;
            let written = self.write(products)?;
            info!(%level, files = written.len(), "wrote");
            if level >= end {
                return Ok(written);
            }
            inputs = written;
        }
    }

    /// Products derived from the file at `path`, nothing if the file is already at `end`
    /// or its variant has no next level.
    fn derive(&self, path: &Path, end: Level) -> Result<Vec<Product>> {
        let product = self.writer.factory().load(path)?;
        match product.level.next() {
            Some(next) if next <= end => {}
            _ => {
                debug!(path = %path.display(), level = %product.level, "nothing to derive");
                return Ok(Vec::new());
            }
        }
        match product.to_next_level(&self.processors, &file_name(path)) {
            Ok(derived) => Ok(vec![derived]),
            Err(Error::Transition { from, to, kind }) => {
                warn!(%kind, %from, %to, "no product at next level");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}
