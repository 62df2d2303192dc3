use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tools::{init_tracing, upgrade_checkpoint};

#[derive(Parser, Debug)]
#[command(
    name = "upgrade_checkpoint",
    about = "Rewrite a single-stream detector checkpoint into the dual-stream key layout"
)]
struct Args {
    /// Checkpoint JSON to read.
    #[arg(long)]
    input: PathBuf,
    /// Where to write the upgraded checkpoint.
    #[arg(long)]
    output: PathBuf,
    /// Emit logs and the summary as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);
    let summary = upgrade_checkpoint(&args.input, &args.output)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if summary.fired_rules.is_empty() {
        println!(
            "{} keys copied unchanged to {}",
            summary.keys_after,
            args.output.display()
        );
    } else {
        println!(
            "{} -> {} keys ({}) written to {}",
            summary.keys_before,
            summary.keys_after,
            summary.fired_rules.join(", "),
            args.output.display()
        );
    }
    Ok(())
}
