use clap::Parser;
use env_logger::Env;
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

mod chunks;
mod config;
mod error;
mod expression;
mod markers;
mod model;
mod normalize;
mod output;
mod pipeline;
mod results;
mod schemas;

use config::{checked_max_iter, Config};
use expression::AlignmentPolicy;
use model::{BackgroundInit, CellAssignEm};
use pipeline::{run_pipeline, DEFAULT_OUTPUT_FILENAME};
use schemas::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "cellassign")]
#[command(version)]
#[command(about = "Assign cell types to binned spatial transcriptomics cells.")]
struct Args {
    /// JSON configuration with the marker panel and chunk directories
    config: PathBuf,

    #[arg(long, default_value = DEFAULT_OUTPUT_FILENAME)]
    output: String,

    #[arg(long, value_enum, default_value = None)]
    output_fmt: Option<OutputFormat>,

    /// Also write per-cell cell type probabilities to this file
    #[arg(long, default_value = None)]
    output_probabilities: Option<PathBuf>,

    #[arg(long, default_value = None)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value = None)]
    alignment: Option<AlignmentPolicy>,

    #[arg(long, default_value = None)]
    max_iter: Option<usize>,

    /// Randomly initialize per-gene baseline expression instead of zeros
    #[arg(long, default_value_t = false)]
    random_b_g_0: bool,

    #[arg(long, default_value_t = false)]
    no_progress: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(fmt) = args.output_fmt {
        config.output_format = fmt;
    }
    if let Some(alignment) = args.alignment {
        config.alignment = alignment;
    }
    if let Some(max_iter) = args.max_iter {
        match checked_max_iter(max_iter) {
            Ok(max_iter) => config.em.max_iter = max_iter,
            Err(err) => {
                error!("{}", err);
                return ExitCode::FAILURE;
            }
        }
    }
    if args.random_b_g_0 {
        config.random_b_g_0 = true;
    }
    if config.random_b_g_0 {
        config.em.background_init = BackgroundInit::Random;
    }
    config.em.show_progress = !args.no_progress;

    let backend = CellAssignEm::new(config.em.clone());
    match run_pipeline(
        &config,
        &backend,
        &args.output,
        args.output_probabilities.as_deref(),
    ) {
        Ok(path) => {
            println!("saved to : {}", path.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
