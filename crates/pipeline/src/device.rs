//! EPD controller interface.
//!
//! [`PanelDevice`] is the seam between the update pipeline and the hardware:
//! the pipeline only needs power control, a temperature reading, a back
//! buffer to fill, and a vsync-timed page flip. [`Controller`] implements it
//! over the Linux framebuffer device; tests implement it in memory, so the
//! same pipeline code runs against both.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dims::FramebufferDimensions;
use crate::discovery;
use crate::fb;

/// Interval at which the panel temperature is re-read.
const TEMPERATURE_READ_INTERVAL: Duration = Duration::from_secs(30);

/// Errors raised by panel devices.
#[derive(Debug)]
pub enum DeviceError {
    /// A syscall failed
    Io {
        context: &'static str,
        source: io::Error,
    },
    /// The framebuffer's reported geometry does not match the configured
    /// dimensions
    DimensionMismatch,
    /// No device with the requested name exists
    NotFound { kind: &'static str, name: String },
    /// Operation requires a started device
    NotStarted,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Io { context, source } => write!(f, "{}: {}", context, source),
            DeviceError::DimensionMismatch => {
                write!(f, "the framebuffer has invalid dimensions")
            }
            DeviceError::NotFound { kind, name } => {
                write!(f, "could not find {} device {}", kind, name)
            }
            DeviceError::NotStarted => write!(f, "the controller is not started"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn io_context(context: &'static str) -> impl FnOnce(io::Error) -> DeviceError {
    move |source| DeviceError::Io { context, source }
}

/// Hardware surface the update pipeline drives.
///
/// Exactly one thread uses a device at a time; the pipeline keeps it behind
/// a mutex and only the vsync stage touches it in steady state.
pub trait PanelDevice: Send {
    /// Framebuffer geometry.
    fn dimensions(&self) -> &FramebufferDimensions;

    /// Power on, verify geometry, map the scanout buffer, and blank every
    /// frame slot.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Unmap the scanout buffer and power off. Idempotent.
    fn stop(&mut self);

    /// Gate the controller's power supply.
    fn set_power(&mut self, on: bool) -> Result<(), DeviceError>;

    /// Current panel temperature in Celsius (rate-limited readings).
    fn temperature(&mut self) -> Result<i32, DeviceError>;

    /// The frame slot the next page flip will scan out.
    fn back_buffer(&mut self) -> Result<&mut [u8], DeviceError>;

    /// Schedule the back buffer for scanout and swap buffers.
    ///
    /// Blocks until the vsync tick, except for the first flip after
    /// power-on.
    fn page_flip(&mut self) -> Result<(), DeviceError>;
}

// Scanout sync flags, carried in the third byte of each frame pixel.
const FRAME_SYNC: u8 = 0x01;
const FRAME_BEGIN: u8 = 0x02;
const FRAME_DATA: u8 = 0x04;
#[allow(dead_code)]
const FRAME_END: u8 = 0x08;
const LINE_SYNC: u8 = 0x10;
const LINE_BEGIN: u8 = 0x20;
const LINE_DATA: u8 = 0x40;
#[allow(dead_code)]
const LINE_END: u8 = 0x80;

fn write_runs(frame: &mut [u8], offset: &mut usize, depth: usize, runs: &[(usize, u8)]) {
    for &(count, flags) in runs {
        for _ in 0..count {
            frame[*offset] = flags;
            *offset += depth;
        }
    }
}

/// Build the frame that leaves all cell intensities unchanged.
///
/// Every phase is a no-op (the first two bytes of each pixel stay zero),
/// but the third byte of each pixel must carry the exact synchronization
/// pattern the controller expects per line. Deviating from this pattern can
/// hang the panel.
pub fn build_blank_frame(dims: &FramebufferDimensions) -> Vec<u8> {
    let mut frame = vec![0u8; dims.frame_size as usize];
    let depth = dims.depth as usize;
    let mut offset = 2usize;

    write_runs(
        &mut frame,
        &mut offset,
        depth,
        &[
            (20, FRAME_SYNC | FRAME_BEGIN | LINE_DATA),
            (20, FRAME_SYNC | FRAME_BEGIN | FRAME_DATA | LINE_DATA),
            (63, FRAME_SYNC | FRAME_DATA | LINE_DATA),
            (40, FRAME_SYNC | FRAME_BEGIN | FRAME_DATA | LINE_DATA),
            (117, FRAME_SYNC | FRAME_BEGIN | LINE_DATA),
        ],
    );

    for _ in 1..3 {
        write_runs(
            &mut frame,
            &mut offset,
            depth,
            &[
                (8, FRAME_SYNC | LINE_DATA),
                (11, FRAME_SYNC | LINE_BEGIN | LINE_DATA),
                (36, FRAME_SYNC | LINE_DATA),
                (200, FRAME_SYNC | FRAME_BEGIN | LINE_DATA),
                (5, FRAME_SYNC | LINE_DATA),
            ],
        );
    }

    for _ in 3..dims.height {
        write_runs(
            &mut frame,
            &mut offset,
            depth,
            &[
                (8, FRAME_SYNC | LINE_DATA),
                (11, FRAME_SYNC | LINE_BEGIN | LINE_DATA),
                (7, FRAME_SYNC | LINE_DATA),
                (29, FRAME_SYNC | LINE_SYNC | LINE_DATA),
                (200, FRAME_SYNC | FRAME_BEGIN | LINE_SYNC | LINE_DATA),
                (5, FRAME_SYNC | LINE_SYNC | LINE_DATA),
            ],
        );
    }

    frame
}

/// Owned `mmap` region over the scanout framebuffer.
struct ScanoutMap {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is private to whichever thread holds the Controller;
// the pipeline serializes access behind a mutex.
unsafe impl Send for ScanoutMap {}

impl ScanoutMap {
    fn new(file: &File, len: usize) -> Result<Self, DeviceError> {
        // SAFETY: mapping a framebuffer fd shared read/write; len comes from
        // the driver's own smem_len report.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io_context("map framebuffer to memory")(
                io::Error::last_os_error(),
            ));
        }

        Ok(ScanoutMap {
            ptr: ptr.cast(),
            len,
        })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live MAP_SHARED mapping owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for ScanoutMap {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

fn ioctl(
    file: &File,
    request: libc::c_ulong,
    arg: *mut libc::c_void,
    context: &'static str,
) -> Result<(), DeviceError> {
    // SAFETY: request/arg pairs are the fbdev ioctls with their matching
    // argument structs (or an immediate value for FBIOBLANK).
    let result = unsafe { libc::ioctl(file.as_raw_fd(), request, arg) };

    if result == -1 {
        return Err(io_context(context)(io::Error::last_os_error()));
    }

    Ok(())
}

/// Interface to the EPD controller over the Linux framebuffer device.
///
/// Owns the scanout mapping, the double-buffer flip state, the power gate,
/// and the panel temperature sensor. Assumes exclusive access to the
/// controller; concurrent access leads to unpredictable behavior.
pub struct Controller {
    framebuffer: File,
    sensor: File,
    dims: FramebufferDimensions,
    blank_frame: Vec<u8>,
    var_info: fb::VarScreenInfo,
    map: Option<ScanoutMap>,

    /// Frame slot currently scanned out; `None` right after power-on, when
    /// no flip has been scheduled yet
    front_buffer: Option<u32>,
    back_buffer: u32,

    power: bool,
    temperature: i32,
    temperature_read_at: Option<Instant>,
}

impl Controller {
    /// Open a controller with the given device paths.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        framebuffer_path: P,
        sensor_path: Q,
        dims: FramebufferDimensions,
    ) -> Result<Self, DeviceError> {
        let framebuffer = OpenOptions::new()
            .read(true)
            .write(true)
            .open(framebuffer_path)
            .map_err(io_context("open framebuffer device"))?;
        let sensor = File::open(sensor_path).map_err(io_context("open temperature sensor"))?;

        Ok(Controller {
            framebuffer,
            sensor,
            blank_frame: build_blank_frame(&dims),
            dims,
            var_info: fb::VarScreenInfo::default(),
            map: None,
            front_buffer: None,
            back_buffer: 0,
            power: false,
            temperature: 0,
            temperature_read_at: None,
        })
    }

    /// Open a controller by looking devices up by name in sysfs.
    pub fn by_name(
        framebuffer_name: &str,
        sensor_name: &str,
        dims: FramebufferDimensions,
    ) -> Result<Self, DeviceError> {
        let framebuffer_path = discovery::find_framebuffer(framebuffer_name)
            .map_err(io_context("scan for framebuffer device"))?
            .ok_or_else(|| DeviceError::NotFound {
                kind: "framebuffer",
                name: framebuffer_name.to_owned(),
            })?;

        let sensor_path = discovery::find_temperature_sensor(sensor_name)
            .map_err(io_context("scan for temperature sensor"))?
            .ok_or_else(|| DeviceError::NotFound {
                kind: "temperature sensor",
                name: sensor_name.to_owned(),
            })?;

        Controller::open(framebuffer_path, sensor_path, dims)
    }

    /// Open the reMarkable 2 controller.
    pub fn open_remarkable2() -> Result<Self, DeviceError> {
        Controller::by_name(
            "mxs-lcdif",
            "sy7636a_temperature",
            FramebufferDimensions::REMARKABLE2,
        )
    }

    fn read_temperature(&mut self) -> Result<(), DeviceError> {
        self.sensor
            .seek(SeekFrom::Start(0))
            .map_err(io_context("seek in panel temperature file"))?;

        let mut buffer = [0u8; 11];
        let size = self
            .sensor
            .read(&mut buffer)
            .map_err(io_context("read panel temperature"))?;

        let text = std::str::from_utf8(&buffer[..size])
            .unwrap_or("")
            .trim();
        let value = text.parse::<i32>().map_err(|_| DeviceError::Io {
            context: "parse panel temperature",
            source: io::Error::new(io::ErrorKind::InvalidData, text.to_owned()),
        })?;

        debug!(temperature = value, "panel temperature read");
        self.temperature = value;
        self.temperature_read_at = Some(Instant::now());
        Ok(())
    }
}

impl PanelDevice for Controller {
    fn dimensions(&self) -> &FramebufferDimensions {
        &self.dims
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.set_power(true)?;
        self.read_temperature()?;

        ioctl(
            &self.framebuffer,
            fb::FBIOGET_VSCREENINFO,
            (&mut self.var_info as *mut fb::VarScreenInfo).cast(),
            "get framebuffer vscreeninfo",
        )?;

        let mut fix_info = fb::FixScreenInfo::default();
        ioctl(
            &self.framebuffer,
            fb::FBIOGET_FSCREENINFO,
            (&mut fix_info as *mut fb::FixScreenInfo).cast(),
            "get framebuffer fscreeninfo",
        )?;

        if self.var_info.xres != self.dims.width
            || self.var_info.yres != self.dims.height
            || self.var_info.xres_virtual != self.dims.width
            || self.var_info.yres_virtual != self.dims.height * self.dims.frame_count
            || fix_info.smem_len < self.dims.total_size
        {
            return Err(DeviceError::DimensionMismatch);
        }

        let mut map = ScanoutMap::new(&self.framebuffer, fix_info.smem_len as usize)?;

        // Blank every slot, including the safe default frame the hardware
        // pans to when no flip is scheduled
        let scanout = map.as_mut_slice();
        for frame in 0..self.dims.frame_count {
            let offset = self.dims.frame_offset(frame);
            scanout[offset..offset + self.blank_frame.len()].copy_from_slice(&self.blank_frame);
        }

        self.map = Some(map);
        self.front_buffer = None;
        self.back_buffer = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.map = None;

        if let Err(err) = self.set_power(false) {
            debug!("power-off on stop failed: {}", err);
        }
    }

    fn set_power(&mut self, on: bool) -> Result<(), DeviceError> {
        if on != self.power {
            let arg = if on {
                fb::FB_BLANK_UNBLANK
            } else {
                fb::FB_BLANK_POWERDOWN
            };

            ioctl(
                &self.framebuffer,
                fb::FBIOBLANK,
                arg as *mut libc::c_void,
                "set controller power",
            )?;
            self.power = on;
        }

        if !self.power {
            // The next flip after power-on schedules rather than waits
            self.front_buffer = None;
        }

        Ok(())
    }

    fn temperature(&mut self) -> Result<i32, DeviceError> {
        let stale = match self.temperature_read_at {
            Some(at) => at.elapsed() > TEMPERATURE_READ_INTERVAL,
            None => true,
        };

        if stale && self.power {
            self.read_temperature()?;
        }

        Ok(self.temperature)
    }

    fn back_buffer(&mut self) -> Result<&mut [u8], DeviceError> {
        let offset = self.dims.frame_offset(self.back_buffer);
        let frame_size = self.dims.frame_size as usize;
        let map = self.map.as_mut().ok_or(DeviceError::NotStarted)?;

        Ok(&mut map.as_mut_slice()[offset..offset + frame_size])
    }

    fn page_flip(&mut self) -> Result<(), DeviceError> {
        self.var_info.yoffset = self.back_buffer * self.dims.height;

        let request = match self.front_buffer {
            // Schedule the first frame
            None => fb::FBIOPUT_VSCREENINFO,
            // Schedule the next frame and wait for the vsync interval
            Some(_) => fb::FBIOPAN_DISPLAY,
        };

        ioctl(
            &self.framebuffer,
            request,
            (&mut self.var_info as *mut fb::VarScreenInfo).cast(),
            "page flip",
        )?;

        let front = self.back_buffer;
        self.front_buffer = Some(front);
        self.back_buffer = (front + 1) % 2;
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dims() -> FramebufferDimensions {
        // Reference line width with a short frame
        FramebufferDimensions::new(260, 4, 8, 8, 3, 26, 0, 3, 1)
    }

    #[test]
    fn test_blank_frame_size_and_flags() {
        let dims = test_dims();
        let frame = build_blank_frame(&dims);

        assert_eq!(frame.len(), dims.frame_size as usize);

        // Only the third byte of each pixel may carry data
        for pixel in frame.chunks(4) {
            assert_eq!(pixel[0], 0);
            assert_eq!(pixel[1], 0);
            assert_eq!(pixel[3], 0);
            assert_ne!(pixel[2], 0);
        }
    }

    #[test]
    fn test_blank_frame_line_patterns() {
        let dims = test_dims();
        let frame = build_blank_frame(&dims);
        let stride = dims.stride as usize;
        let flags_at = |line: usize, column: usize| frame[line * stride + column * 4 + 2];

        // First line: frame sync + frame begin + line data
        assert_eq!(flags_at(0, 0), 0b0100_0011);
        assert_eq!(flags_at(0, 19), 0b0100_0011);
        // then frame data joins
        assert_eq!(flags_at(0, 20), 0b0100_0111);
        assert_eq!(flags_at(0, 40), 0b0100_0101);
        assert_eq!(flags_at(0, 103), 0b0100_0111);
        assert_eq!(flags_at(0, 143), 0b0100_0011);
        assert_eq!(flags_at(0, 259), 0b0100_0011);

        // Second line: line begin markers at columns 8..18
        assert_eq!(flags_at(1, 0), 0b0100_0001);
        assert_eq!(flags_at(1, 8), 0b0110_0001);
        assert_eq!(flags_at(1, 19), 0b0100_0001);
        assert_eq!(flags_at(1, 55), 0b0100_0011);
        assert_eq!(flags_at(1, 255), 0b0100_0001);

        // Steady-state lines carry line sync
        assert_eq!(flags_at(3, 0), 0b0100_0001);
        assert_eq!(flags_at(3, 8), 0b0110_0001);
        assert_eq!(flags_at(3, 26), 0b0101_0001);
        assert_eq!(flags_at(3, 55), 0b0101_0011);
        assert_eq!(flags_at(3, 255), 0b0101_0001);
        assert_eq!(flags_at(7, 26), 0b0101_0001);
    }
}
