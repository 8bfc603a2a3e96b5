#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand};
use ndarray::{Array1, Array2};
use std::io::{self, BufWriter, Write};
use std::process;

use emvamp::diagnostics::looks_divergent;
use emvamp::{VampConfig, VampFit, fit_em_vamp};

/// Name of the response column in the input table.
const RESPONSE_COLUMN: &str = "y";

#[derive(Parser)]
#[command(
    name = "emvamp",
    about = "Sparse linear regression by EM-tuned vector approximate message passing",
    long_about = "Fits y ~ X with VAMP and a Gaussian-mixture prior on the coefficients whose \
                 parameters are learned by EM, and prints the coefficient path."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model and write the per-iteration coefficients as TSV to stdout
    Fit(FitArgs),
}

#[derive(Args)]
struct FitArgs {
    /// Tab-separated table with a header; column `y` is the response, all others are predictors
    data: String,

    /// TOML file with solver settings
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Number of message-passing iterations
    #[arg(long)]
    max_iter: Option<usize>,

    /// Keep the noise variance at its starting value
    #[arg(long)]
    freeze_noise: bool,

    /// Keep the mixture prior at its starting value
    #[arg(long)]
    freeze_mixture: bool,

    /// Use an adaptive-shrinkage grid prior with this many components
    #[arg(long, value_name = "K")]
    ash_grid: Option<usize>,

    /// Re-run with the noise variance frozen if the first fit diverges
    #[arg(long)]
    retry_frozen_noise: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit(args) => fit_command(&args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn fit_command(args: &FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match (&args.config, args.ash_grid) {
        (Some(path), _) => VampConfig::load(path)?,
        (None, Some(k)) => VampConfig::ash_grid(k),
        (None, None) => VampConfig::default(),
    };
    if args.config.is_some() && args.ash_grid.is_some() {
        log::warn!("--ash-grid is ignored when --config is given");
    }
    if let Some(max_iter) = args.max_iter {
        config.max_iter = max_iter;
    }
    if args.freeze_noise {
        config.tune_noise_variance = false;
    }
    if args.freeze_mixture {
        config.tune_mixture = false;
    }

    let (x, y, names) = load_table(&args.data)?;
    log::info!(
        "Loaded {} samples with {} predictors from {}",
        x.nrows(),
        x.ncols(),
        args.data
    );

    let mut fit = fit_em_vamp(x.view(), y.view(), &config)?;
    if args.retry_frozen_noise
        && config.tune_noise_variance
        && looks_divergent(&fit, x.view(), y.view())?
    {
        log::warn!("Fit looks divergent; re-running with the noise variance frozen");
        config.tune_noise_variance = false;
        fit = fit_em_vamp(x.view(), y.view(), &config)?;
    }

    if let Some(iter) = fit.trajectory.first_settled(1e-8) {
        log::info!("Coefficient path settles (step < 1e-8) at iteration {iter}");
    }

    write_trajectory(&fit, &names, io::stdout().lock())?;
    Ok(())
}

/// Reads the response and predictor columns from a TSV file.
fn load_table(path: &str) -> Result<(Array2<f64>, Array1<f64>, Vec<String>), Box<dyn std::error::Error>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let response_idx = headers
        .iter()
        .position(|h| h == RESPONSE_COLUMN)
        .ok_or_else(|| format!("the required column '{RESPONSE_COLUMN}' was not found in {path}"))?;
    let names: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != response_idx)
        .map(|(_, h)| h.to_string())
        .collect();

    let mut response = Vec::new();
    let mut predictors = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        for (i, field) in record.iter().enumerate() {
            let value: f64 = field.trim().parse().map_err(|_| {
                format!("row {}: column '{}' is not numeric: '{field}'", line + 1, &headers[i])
            })?;
            if i == response_idx {
                response.push(value);
            } else {
                predictors.push(value);
            }
        }
    }

    let x = Array2::from_shape_vec((response.len(), names.len()), predictors)?;
    Ok((x, Array1::from(response), names))
}

fn write_trajectory<W: Write>(fit: &VampFit, names: &[String], out: W) -> io::Result<()> {
    let mut out = BufWriter::new(out);
    write!(out, "iteration\tintercept")?;
    for name in names {
        write!(out, "\t{name}")?;
    }
    writeln!(out)?;

    for iter in 0..fit.trajectory.len() {
        let (intercept, slopes) = fit.trajectory.at(iter);
        write!(out, "{iter}\t{intercept}")?;
        for b in slopes.iter() {
            write!(out, "\t{b}")?;
        }
        writeln!(out)?;
    }
    out.flush()
}
