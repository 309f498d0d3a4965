//! mink-rs CLI: Min-K% Prob membership inference

use anyhow::Result;
use clap::Parser;
use mink_rs::{load_scorer, write_report, Dataset, Experiment, ExperimentConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mink-rs")]
#[command(about = "Detect pretraining data with Min-K% Prob")]
#[command(version)]
struct Cli {
    /// Model being probed (HuggingFace ID, or a completion-API model)
    #[arg(long, default_value = "text-davinci-003")]
    target_model: String,

    /// Reference model used to calibrate perplexity
    #[arg(long, default_value = "huggyllama/llama-7b")]
    ref_model: String,

    /// Output directory for results
    #[arg(long, default_value = "out")]
    output_dir: PathBuf,

    /// JSONL file, or a HuggingFace dataset name
    #[arg(long, default_value = "swj0419/WikiMIA")]
    data: String,

    /// Text length of the WikiMIA split
    #[arg(long, default_value_t = 64)]
    length: usize,

    /// Field holding the text to score
    #[arg(long, default_value = "input")]
    key_name: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode for local models
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ExperimentConfig {
        target_model: cli.target_model,
        ref_model: cli.ref_model,
        output_dir: cli.output_dir,
        data: cli.data,
        length: cli.length,
        key_name: cli.key_name,
        force_cpu: cli.cpu,
    };
    let run_dir = config.run_dir();

    println!("=== mink-rs: Min-K% Prob membership inference ===");
    println!("Target:    {}", config.target_model);
    println!("Reference: {}", config.ref_model);
    println!("Data:      {}", config.data);
    println!("Output:    {}", run_dir.display());
    if config.force_cpu {
        println!("Mode:      CPU (forced)");
    }

    std::fs::create_dir_all(&run_dir)?;

    info!("Loading models...");
    let target = load_scorer(&config.target_model, config.force_cpu)?;
    let reference = load_scorer(&config.ref_model, config.force_cpu)?;

    let dataset = Dataset::load(&config.data, config.length)?;

    let experiment = Experiment::new(target, reference, &config.key_name);
    let outputs = experiment.evaluate(dataset.into_examples())?;

    let reports = write_report(&outputs, &run_dir)?;

    println!("\n=== Results ===");
    for report in &reports {
        println!("{}", report.summary_line());
    }
    if reports.is_empty() {
        println!("No feature could be evaluated");
    }
    info!("Results saved to {}", run_dir.display());

    Ok(())
}
