//! Score one text and print its membership features
//!
//! Usage:
//!   cargo run --release --example score_text -- \
//!     --target-model Qwen/Qwen2.5-0.5B --ref-model Qwen/Qwen2.5-0.5B-Instruct \
//!     "The Eiffel Tower was completed in 1889."

use anyhow::Result;
use clap::Parser;
use mink_rs::{infer, load_scorer};

#[derive(Parser)]
#[command(name = "score_text")]
#[command(about = "Print the Min-K% Prob features of a single text")]
struct Args {
    /// Model being probed
    #[arg(long, default_value = "Qwen/Qwen2.5-0.5B")]
    target_model: String,

    /// Reference model
    #[arg(long, default_value = "Qwen/Qwen2.5-0.5B-Instruct")]
    ref_model: String,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Text to score
    text: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let target = load_scorer(&args.target_model, args.cpu)?;
    let reference = load_scorer(&args.ref_model, args.cpu)?;

    let result = target.score(&args.text)?;
    println!("Text: {:?}", args.text);
    println!(
        "{} tokens scored, perplexity {:.3}",
        result.token_log_probs.len(),
        result.perplexity
    );

    let pred = infer(target.as_ref(), reference.as_ref(), &args.text)?;
    println!("\n{:<55} {:>10}", "Feature", "Value");
    println!("{}", "-".repeat(66));
    for (key, value) in pred.iter() {
        println!("{key:<55} {value:>10.4}");
    }

    Ok(())
}
