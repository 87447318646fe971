//! WBF inspection.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use epd_waveform::{Header, ModeKind, Phase, PhaseMatrix, WaveformTable, INTENSITY_VALUES};

#[derive(Args)]
pub struct DumpArgs {
    /// WBF file to inspect
    pub file: PathBuf,

    /// Mode id to look up
    pub mode: Option<u8>,

    /// Temperature in Celsius to look up
    pub temperature: Option<i32>,

    /// Print every phase matrix of the looked-up waveform
    #[arg(long)]
    pub frames: bool,
}

fn phase_symbol(phase: Phase) -> char {
    match phase {
        Phase::Noop => '.',
        Phase::Black => 'B',
        Phase::White => 'W',
    }
}

fn print_matrix(matrix: &PhaseMatrix) {
    for row in matrix.iter().take(INTENSITY_VALUES) {
        let line: String = row.iter().map(|&phase| phase_symbol(phase)).collect();
        println!("  {}", line);
    }
}

pub fn run(args: &DumpArgs) -> Result<()> {
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("read {}", args.file.display()))?;
    let header = Header::parse(&bytes)
        .with_context(|| format!("parse {}", args.file.display()))?;
    let table = WaveformTable::from_bytes(&bytes)
        .with_context(|| format!("parse {}", args.file.display()))?;

    let (mode, temperature) = match (args.mode, args.temperature) {
        (Some(mode), Some(temperature)) => (mode, temperature),
        (Some(_), None) => bail!("a temperature is required alongside a mode"),
        _ => {
            print_summary(&header, &table);
            return Ok(());
        }
    };

    let waveform = table
        .lookup(mode, temperature)
        .with_context(|| format!("look up mode {} at {} \u{b0}C", mode, temperature))?;

    println!(
        "Waveform for mode {} ({}) at {} \u{b0}C: {} frames",
        mode,
        table.mode_kind(mode).unwrap_or(ModeKind::Unknown),
        temperature,
        waveform.len()
    );

    if args.frames {
        for (index, matrix) in waveform.iter().enumerate() {
            println!("Frame {}:", index);
            print_matrix(matrix);
        }
    }

    Ok(())
}

fn print_summary(header: &Header, table: &WaveformTable) {
    println!("Serial: {}", header.serial);
    println!(
        "Waveform version: {}.{}",
        header.waveform_version, header.waveform_subversion
    );
    println!(
        "FPL lot: {} (size {}, manufacturer {:#04x})",
        header.fpl_lot, header.fpl_size, header.mfg_code
    );
    println!("Frame rate: {} Hz", table.frame_rate());
    println!("Available modes: {}", table.mode_count());

    for mode in 0..table.mode_count() {
        println!(
            "  {}: {}",
            mode,
            table.mode_kind(mode).unwrap_or(ModeKind::Unknown)
        );
    }

    let temperatures = table.temperatures();
    println!("Temperature ranges:");

    for pair in temperatures.windows(2) {
        println!("  {:>3} - {:>3} \u{b0}C", pair[0], pair[1] - 1);
    }
}
