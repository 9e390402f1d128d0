use std::fmt::Display;
use std::fs::{self, File};
use std::io::{stdout, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use regex::Regex;
use stixcore::config::Config;
use stixcore::pipeline::Pipeline;
use stixcore::products::Level;
use tracing::{debug, info};

/// Where processing starts or ends: raw telemetry or a product level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Tm,
    Lb,
    L0,
    L1,
    L2,
}

impl Stage {
    pub fn level(self) -> Option<Level> {
        match self {
            Self::Tm => None,
            Self::Lb => Some(Level::LB),
            Self::L0 => Some(Level::L0),
            Self::L1 => Some(Level::L1),
            Self::L2 => Some(Level::L2),
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.level() {
            Some(level) => write!(f, "{level}"),
            None => f.write_str("TM"),
        }
    }
}

impl clap::ValueEnum for Stage {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Tm, Self::Lb, Self::L0, Self::L1, Self::L2]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Tm => Some(clap::builder::PossibleValue::new("tm")),
            Self::Lb => Some(clap::builder::PossibleValue::new("lb")),
            Self::L0 => Some(clap::builder::PossibleValue::new("l0")),
            Self::L1 => Some(clap::builder::PossibleValue::new("l1")),
            Self::L2 => Some(clap::builder::PossibleValue::new("l2")),
        }
    }
}

/// Files below `dir` whose name matches `filter`, sorted by path. Product archives are
/// searched recursively, telemetry directories are not.
fn list_inputs(
    dir: &Path,
    recursive: bool,
    extension: Option<&str>,
    filter: Option<&Regex>,
) -> Result<Vec<PathBuf>> {
    let mut found = Vec::default();
    let entries = fs::read_dir(dir).with_context(|| format!("failed to read {dir:?}"))?;
    for entry in entries {
        let path = entry.context("reading directory entry")?.path();
        if path.is_dir() {
            if recursive {
                found.extend(list_inputs(&path, recursive, extension, filter)?);
            }
            continue;
        }
        if extension.is_some_and(|ext| path.extension().is_none_or(|e| e != ext)) {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if filter.is_some_and(|rx| !rx.is_match(&name)) {
            debug!("{name} does not match filter");
            continue;
        }
        found.push(path);
    }
    found.sort();
    Ok(found)
}

pub fn process(
    config: &Config,
    start: Stage,
    end: Level,
    filter: Option<&Regex>,
    out_file: Option<&Path>,
) -> Result<()> {
    let pipeline = Pipeline::from_config(config).context("setting up processing")?;

    let written = match start.level() {
        None => {
            let inputs = list_inputs(&config.paths.tm_archive, false, None, filter)?;
            if inputs.is_empty() {
                bail!("no telemetry files in {:?}", config.paths.tm_archive);
            }
            info!("processing {} telemetry files", inputs.len());
            pipeline.process_tm(&inputs, end)?
        }
        Some(level) => {
            let dir = config.paths.fits_archive.join(level.as_str());
            let ext = pipeline.writer().factory().store().extension();
            let inputs = list_inputs(&dir, true, Some(ext), filter)?;
            if inputs.is_empty() {
                bail!("no {level} products in {dir:?}");
            }
            info!("processing {} {level} files", inputs.len());
            pipeline.process_files(&inputs, end)?
        }
    };

    let mut out = stdout().lock();
    for path in &written {
        writeln!(out, "{}", path.display()).context("writing to stdout")?;
    }
    if let Some(out_file) = out_file {
        let mut dest = BufWriter::new(
            File::create(out_file)
                .with_context(|| format!("failed to create output {out_file:?}"))?,
        );
        for path in &written {
            writeln!(dest, "{}", path.display())?;
        }
        dest.flush()?;
    }
    info!("wrote {} files", written.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order() {
        assert!(Stage::Tm < Stage::Lb && Stage::L1 < Stage::L2);
        assert_eq!(Stage::Tm.level(), None);
        assert_eq!(Stage::L0.level(), Some(Level::L0));
        assert_eq!(Stage::Lb.to_string(), "LB");
    }

    #[test]
    fn inputs_are_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("21").join("6");
        fs::create_dir_all(&sub).unwrap();
        fs::write(tmp.path().join("a_hk.json"), "").unwrap();
        fs::write(tmp.path().join("b_hk.txt"), "").unwrap();
        fs::write(sub.join("c_ql.json"), "").unwrap();

        let all = list_inputs(tmp.path(), true, Some("json"), None).unwrap();
        assert_eq!(all.len(), 2);

        let rx = Regex::new("_hk").unwrap();
        let hk = list_inputs(tmp.path(), true, None, Some(&rx)).unwrap();
        assert_eq!(hk, vec![tmp.path().join("a_hk.json"), tmp.path().join("b_hk.txt")]);

        let flat = list_inputs(tmp.path(), false, Some("json"), None).unwrap();
        assert_eq!(flat, vec![tmp.path().join("a_hk.json")]);
    }
}
