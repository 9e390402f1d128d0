use std::path::Path;

use anyhow::{Context, Result};
use stixcore::io::{ProductFactory, ProductWriter};
use stixcore::time::LinearClock;
use tracing::info;

/// Write one file per day of the product in `input` below `output`.
pub fn split(input: &Path, output: &Path, clock: LinearClock, version: u32) -> Result<()> {
    let factory = ProductFactory::default();
    let product = factory
        .load(input)
        .with_context(|| format!("loading {input:?}"))?;
    let writer = ProductWriter::builder()
        .root(output)
        .factory(factory)
        .time(Box::new(clock))
        .version(version)
        .build();

    let written = writer
        .write_days(&product)
        .with_context(|| format!("splitting {input:?}"))?;
    info!("wrote {} day files", written.len());
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}
