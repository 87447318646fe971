//! Scripted display demo.
//!
//! Exercises the pipeline on the reference device: a full-screen
//! initialization, one gradient column per quality mode, and a burst of
//! immediate-mode updates sweeping a stencil across the screen.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use embedded_graphics::pixelcolor::Gray4;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use tracing::info;

use epd_pipeline::{discovery, Controller, Generator, Region};
use epd_waveform::{ModeKind, WaveformTable};

use crate::canvas::IntensityCanvas;

/// Client-space screen size of the reference device.
const SCREEN_WIDTH: u32 = 1404;
const SCREEN_HEIGHT: u32 = 1872;

#[derive(Args)]
pub struct DemoArgs {
    /// WBF file to load (discovered from device metadata when omitted)
    #[arg(long)]
    pub wbf: Option<PathBuf>,

    /// Write a CSV performance report to this path
    #[arg(long)]
    pub perf: Option<PathBuf>,
}

pub fn run(args: &DemoArgs) -> Result<()> {
    let wbf_path = match &args.wbf {
        Some(path) => path.clone(),
        None => discovery::find_waveform_file()
            .context("scan for waveform file")?
            .ok_or_else(|| anyhow!("no waveform file matches this panel; pass --wbf"))?,
    };

    info!(path = %wbf_path.display(), "loading waveform table");
    let table = WaveformTable::from_wbf(&wbf_path)
        .with_context(|| format!("parse {}", wbf_path.display()))?;

    let controller = Controller::open_remarkable2().context("open display controller")?;
    let mut generator = Generator::new(controller, table);

    if args.perf.is_some() {
        generator.set_perf_recording(true);
    }

    generator.start().context("start display pipeline")?;

    let result = run_script(&generator);

    if let Some(path) = &args.perf {
        std::fs::write(path, generator.perf_report())
            .with_context(|| format!("write perf report to {}", path.display()))?;
    }

    generator.stop();
    result
}

fn run_script(generator: &Generator) -> Result<()> {
    clear_screen(generator)?;
    draw_gradients(generator)?;
    sweep_stencil(generator)?;

    generator.wait_for_all().context("wait for demo updates")?;
    Ok(())
}

/// Force every cell to a known white state.
fn clear_screen(generator: &Generator) -> Result<()> {
    info!("initializing panel");

    let id = generator
        .push_update_by_kind(
            ModeKind::Init,
            false,
            Region::new(0, 0, SCREEN_WIDTH, SCREEN_HEIGHT),
            &vec![30; (SCREEN_WIDTH * SCREEN_HEIGHT) as usize],
        )
        .context("push init update")?
        .ok_or_else(|| anyhow!("panel does not support INIT"))?;

    generator.wait_for(id).context("wait for init")?;
    Ok(())
}

/// One column of 16 gray blocks per available quality mode.
fn draw_gradients(generator: &Generator) -> Result<()> {
    const COLUMN_WIDTH: u32 = 100;
    const BLOCK_HEIGHT: u32 = 100;

    let kinds = [ModeKind::Du, ModeKind::Du4, ModeKind::Gc16, ModeKind::Glr16];

    for (index, kind) in kinds.iter().enumerate() {
        let Some(mode) = generator.table().mode_id(*kind) else {
            info!(%kind, "skipping gradient, mode not available");
            continue;
        };

        info!(%kind, "drawing gradient column");

        let mut canvas = IntensityCanvas::new(COLUMN_WIDTH, BLOCK_HEIGHT * 16);
        for level in 0..16u32 {
            Rectangle::new(
                Point::new(0, (level * BLOCK_HEIGHT) as i32),
                Size::new(COLUMN_WIDTH, BLOCK_HEIGHT),
            )
            .into_styled(PrimitiveStyle::with_fill(Gray4::new(level as u8)))
            .draw(&mut canvas)
            .expect("canvas drawing is infallible");
        }

        let left = 60 + index as u32 * (COLUMN_WIDTH + 60);
        let _ = generator
            .push_update(
                mode,
                false,
                Region::new(136, left, COLUMN_WIDTH, BLOCK_HEIGHT * 16),
                canvas.data(),
            )
            .context("push gradient update")?;
    }

    Ok(())
}

/// Sweep a small black stencil across the screen in immediate mode.
fn sweep_stencil(generator: &Generator) -> Result<()> {
    const STENCIL: u32 = 6;
    const STEPS: u32 = 120;

    let Some(mode) = generator.table().mode_id(ModeKind::A2) else {
        info!("skipping stencil sweep, A2 not available");
        return Ok(());
    };

    info!("sweeping immediate-mode stencil");
    let buffer = vec![0; (STENCIL * STENCIL) as usize];

    for step in 0..STEPS {
        let left = 40 + step * ((SCREEN_WIDTH - 80) / STEPS);
        let top = SCREEN_HEIGHT - 300;

        let _ = generator
            .push_update(mode, true, Region::new(top, left, STENCIL, STENCIL), &buffer)
            .context("push stencil update")?;

        std::thread::sleep(Duration::from_millis(5));
    }

    Ok(())
}
