mod info;
mod merge;
mod process;
mod split;

use std::fs::OpenOptions;
use std::io::stderr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stixcore::config::Config;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file. Defaults to the file named by STIXCORE_CONFIG, if set.
    #[arg(short, long, global = true, value_name = "path")]
    config: Option<PathBuf>,

    /// Append log messages to this file rather than writing them to stderr.
    #[arg(long, global = true, value_name = "path")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process telemetry or products to a higher level.
    ///
    /// Inputs are read from the telemetry directory when starting at tm, otherwise from the
    /// start level directory of the product archive. Products of each level are merged into
    /// the archive and the files written at the end level are printed.
    Process {
        /// Level of the inputs.
        #[arg(short, long, default_value = "tm")]
        start_level: process::Stage,

        /// Last level to produce.
        #[arg(short, long, default_value = "l1")]
        end_level: process::Stage,

        /// Directory of raw telemetry files, overriding the configured tm_archive.
        #[arg(long, value_name = "path")]
        tm_dir: Option<PathBuf>,

        /// Product archive root, overriding the configured fits_archive.
        #[arg(short, long, value_name = "path")]
        out_dir: Option<PathBuf>,

        /// Abort on the first input that fails.
        #[arg(long, action)]
        stop_on_error: bool,

        /// Only process input files whose name matches this regular expression.
        #[arg(short, long, value_name = "regex")]
        filter: Option<String>,

        /// Also write the list of produced files to this file.
        #[arg(long, value_name = "path")]
        out_file: Option<PathBuf>,
    },
    /// Show information about a product file
    Info {
        /// Input product file
        input: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: info::Format,
    },
    /// Merge product files of the same type into one.
    ///
    /// Samples are ordered by time and duplicate samples are dropped, keeping the sample of
    /// the input that starts first.
    Merge {
        /// Delete output file if it already exists
        #[arg(long, action)]
        clobber: bool,

        /// Output file path.
        #[arg(short, long, default_value = "merged.json", value_name = "path")]
        output: PathBuf,

        /// Input product files.
        inputs: Vec<PathBuf>,
    },
    /// Split a product file into one file per day.
    ///
    /// LB and L0 products are split on instrument clock days, higher levels on UTC days.
    Split {
        /// Directory the day files are written below.
        #[arg(short, long, default_value = ".", value_name = "path")]
        output: PathBuf,

        /// Input product file.
        input: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("failed to load config {path:?}"))
        }
        None => Config::from_env_or_default().context("failed to load config"),
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_env("STIXCORE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(false)
        .without_time()
        .with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path:?}"))?;
            builder.with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(stderr).init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::Process {
            start_level,
            end_level,
            tm_dir,
            out_dir,
            stop_on_error,
            filter,
            out_file,
        } => {
            if let Some(dir) = tm_dir {
                config.paths.tm_archive.clone_from(dir);
            }
            if let Some(dir) = out_dir {
                config.paths.fits_archive.clone_from(dir);
            }
            if *stop_on_error {
                config.processing.stop_on_error = true;
            }
            let filter = match filter {
                Some(pattern) => Some(
                    regex::Regex::new(pattern)
                        .with_context(|| format!("invalid filter {pattern:?}"))?,
                ),
                None => None,
            };
            let Some(end) = end_level.level() else {
                bail!("end level must be a product level");
            };
            if end_level <= start_level {
                bail!("end level {end_level} must be above start level {start_level}");
            }
            info!(start = %start_level, %end, "processing");
            process::process(&config, *start_level, end, filter.as_ref(), out_file.as_deref())
        }
        Commands::Info { input, format } => info::info(input, format, &config),
        Commands::Merge {
            clobber,
            output,
            inputs,
        } => {
            if !clobber && output.exists() {
                bail!("{output:?} exists; use --clobber");
            }
            info!("merging {inputs:?} to {output:?}");
            merge::merge(inputs, output)
        }
        Commands::Split { output, input } => {
            let clock = config.clock().context("invalid clock epoch")?;
            split::split(input, output, clock, config.processing.file_version)
        }
    }
}
