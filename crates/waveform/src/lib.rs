//! Waveform tables for electrophoretic displays
//!
//! EPD panels transition cells between grayscale intensities by applying a
//! temperature-dependent sequence of electrical phases, one per scanout
//! frame. Panels ship this data in the proprietary WBF container format.
//! This crate parses WBF files into an in-memory [`WaveformTable`] indexed
//! by `(mode, temperature)` and classifies the available modes by the
//! transitions they support.
//!
//! # Example
//!
//! ```no_run
//! use epd_waveform::{ModeKind, WaveformTable};
//!
//! let table = WaveformTable::from_wbf("/usr/share/remarkable/320_R467_AF4731_ED103TC2C6_VB3300-KCD_TC.wbf")?;
//! let mode = table.mode_id(ModeKind::Gc16).expect("panel supports GC16");
//! let waveform = table.lookup(mode, 24)?;
//!
//! println!("GC16 at 24 °C takes {} frames", waveform.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod codec;
mod parser;
mod phase;
mod table;

pub use parser::{Header, ParseError, DEFAULT_FRAME_RATE, HEADER_LEN};
pub use phase::{
    uniform_matrix, Intensity, ModeId, ModeKind, Phase, PhaseMatrix, Temperature, Waveform,
    INTENSITY_MASK, INTENSITY_VALUES,
};
pub use table::{LookupError, TableError, WaveformTable};
