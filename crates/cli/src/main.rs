//! `epd` -- EPD driver tools.

mod canvas;
mod demo;
mod dump;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "epd")]
#[command(about = "Electrophoretic display driver tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump waveform information from a WBF file
    Dump(dump::DumpArgs),
    /// Run a scripted update sequence on the display
    Demo(demo::DemoArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Dump(args) => dump::run(args),
        Commands::Demo(args) => demo::run(args),
    }
}
