use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tools::{init_tracing, inspect_config, render_summary};

#[derive(Parser, Debug)]
#[command(
    name = "inspect_config",
    about = "Validate a dual-stream detector config and print what it builds"
)]
struct Args {
    /// Detector config (TOML).
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);
    let summary = inspect_config(&args.config)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", render_summary(&summary));
    }
    Ok(())
}
