use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use stixcore::io::{ProductFactory, ProductFile};
use stixcore::pipeline::combine_by_kind;
use tracing::debug;

/// Combine product files of one product type into `output`.
pub fn merge(inputs: &[PathBuf], output: &Path) -> Result<()> {
    if inputs.is_empty() {
        bail!("no inputs provided");
    }

    let factory = ProductFactory::default();
    let mut products = Vec::with_capacity(inputs.len());
    for input in inputs {
        let product = factory
            .load(input)
            .with_context(|| format!("loading {input:?}"))?;
        debug!("loaded {product} from {input:?}");
        products.push(product);
    }

    let mut combined = combine_by_kind(products)
        .with_context(|| format!("Merging {} inputs", inputs.len()))?;
    if combined.len() != 1 {
        let kinds: Vec<String> = combined.iter().map(|p| p.kind.to_string()).collect();
        bail!("inputs are of different product types: {}", kinds.join(", "));
    }
    let Some(product) = combined.pop() else {
        bail!("no products loaded");
    };

    let filename = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    factory
        .store()
        .write(output, &ProductFile::from_product(&product, &filename))
        .with_context(|| format!("writing {output:?}"))
}
