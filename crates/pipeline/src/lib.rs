//! Userspace update pipeline for an electrophoretic display controller
//!
//! Accepts update requests (rectangles of target intensities plus a
//! rendering mode) and drives the display's memory-mapped scanout buffer so
//! the panel transitions from its last-known state to the requested one,
//! using the temperature-dependent waveforms from
//! [`epd_waveform::WaveformTable`].
//!
//! # Architecture
//!
//! ```text
//!   push_update() ──► queue ──► generator thread ──► rendezvous ──► vsync thread
//!                                (phase frames)      (1 slot)       (back buffer + page flip)
//! ```
//!
//! **[`device`]** -- the [`PanelDevice`] hardware seam and the Linux
//! framebuffer [`Controller`] behind it: mmap'd scanout buffer, double
//! buffering, power gate, temperature sensor.
//!
//! **[`Generator`]** -- the pipeline front end: validates and enqueues
//! updates, runs the generator and vsync threads, tracks completion, and
//! optionally records a timing report.
//!
//! **[`discovery`]** -- optional sysfs/metadata lookups for the device paths
//! and the panel's WBF file.
//!
//! The pipeline is deliberately synchronous and multi-threaded: the vsync
//! thread blocks on hardware ioctls at frame granularity, which do not
//! compose with task schedulers.
//!
//! # Example
//!
//! ```no_run
//! use epd_pipeline::{Controller, Generator, Region};
//! use epd_waveform::{ModeKind, WaveformTable};
//!
//! let table = WaveformTable::from_wbf("panel.wbf")?;
//! let controller = Controller::open_remarkable2()?;
//! let mut generator = Generator::new(controller, table);
//!
//! generator.start()?;
//!
//! // Paint a white 200x100 rectangle
//! let id = generator
//!     .push_update(
//!         generator.table().mode_id(ModeKind::Gc16).unwrap(),
//!         false,
//!         Region::new(10, 10, 200, 100),
//!         &vec![30; 200 * 100],
//!     )?
//!     .expect("update within panel bounds");
//!
//! generator.wait_for(id)?;
//! generator.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod device;
pub mod discovery;

mod dims;
mod fb;
mod framegen;
mod perf;
mod pipeline;
mod region;
mod update;

pub use device::{Controller, DeviceError, PanelDevice};
pub use dims::FramebufferDimensions;
pub use perf::UpdateTimeline;
pub use pipeline::{Generator, PipelineError};
pub use region::Region;
pub use update::UpdateId;
