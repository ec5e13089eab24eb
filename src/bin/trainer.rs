use anyhow::{bail, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

/// Train textual inversion embeddings for Stable Diffusion 1.x / 2.x
#[derive(Parser, Debug)]
#[command(name = "trainer", version, about)]
struct Args {
    /// YAML job file
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    eridiffusion_ti::logging::init_logger(args.verbose);

    if !args.config.exists() {
        bail!("Config file not found: {}", args.config.display());
    }

    info!("Starting trainer with config: {}", args.config.display());
    eridiffusion_ti::trainers::train_from_config(args.config)?;

    info!("Training completed successfully");
    Ok(())
}
