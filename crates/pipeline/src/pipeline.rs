//! The two-stage update pipeline.
//!
//! A generator thread consumes the update queue, merges compatible
//! neighbors, computes phase frames against a pair of shadow intensity
//! arrays, and hands finished frames to the vsync thread through a
//! single-slot rendezvous. The vsync thread copies each frame into the
//! controller's back buffer and page-flips at the scanout pace, powering
//! the controller down when no updates arrive for a while.
//!
//! The rendezvous gives natural backpressure: the generator can run at most
//! one batch ahead of the panel. The update queue itself is unbounded;
//! producers are expected to self-limit or use [`Generator::wait_for`].

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use epd_waveform::{Intensity, ModeId, ModeKind, WaveformTable};

use crate::device::{build_blank_frame, DeviceError, PanelDevice};
use crate::dims::FramebufferDimensions;
use crate::framegen;
use crate::perf::{PerfClock, PerfRecord, PerfReport};
use crate::region::Region;
use crate::update::{to_panel_coords, Update, UpdateId};

/// Idle time after which the vsync stage powers the controller down.
const POWER_OFF_TIMEOUT: Duration = Duration::from_secs(3);

/// How often completion waiters recheck for dead background threads.
const WAITER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors surfaced by pipeline entry points.
#[derive(Debug)]
pub enum PipelineError {
    /// The controller failed during a foreground call
    Device(DeviceError),
    /// A background thread terminated after a hardware failure; the
    /// pipeline cannot make progress
    BackgroundThreadDied,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Device(err) => err.fmt(f),
            PipelineError::BackgroundThreadDied => {
                write!(f, "a display pipeline thread has died")
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Device(err) => Some(err),
            PipelineError::BackgroundThreadDied => None,
        }
    }
}

impl From<DeviceError> for PipelineError {
    fn from(err: DeviceError) -> Self {
        PipelineError::Device(err)
    }
}

/// Single-slot rendezvous between the generator and vsync threads.
#[derive(Default)]
struct FrameSlot {
    /// Frames ready for scanout when `readable`; recycled buffers otherwise
    frames: Vec<Vec<u8>>,
    /// The update these frames finish, present on finalizing handoffs
    update: Option<Update>,
    /// True when this handoff completes its update
    finalize: bool,
    /// Slot state: written and not yet consumed
    readable: bool,
}

struct Shared {
    dims: FramebufferDimensions,
    table: WaveformTable,
    device: Mutex<Box<dyn PanelDevice>>,
    blank_frame: Vec<u8>,

    queue: Mutex<VecDeque<Update>>,
    queue_cv: Condvar,

    /// Ids accepted but not yet finalized by the vsync stage
    in_flight: Mutex<BTreeSet<UpdateId>>,
    completion_cv: Condvar,

    slot: Mutex<FrameSlot>,
    can_read_cv: Condvar,
    can_write_cv: Condvar,

    stopping_generator: AtomicBool,
    stopping_vsync: AtomicBool,
    generator_alive: AtomicBool,
    vsync_alive: AtomicBool,

    /// Panel temperature cache, written by the vsync thread which owns the
    /// controller in steady state
    temperature: AtomicI32,

    next_id: AtomicU32,
    record_perf: AtomicBool,
    perf: Mutex<PerfReport>,
    clock: PerfClock,
}

impl Shared {
    fn thread_died(&self) -> bool {
        let generator_died = !self.generator_alive.load(Ordering::SeqCst)
            && !self.stopping_generator.load(Ordering::SeqCst);
        let vsync_died = !self.vsync_alive.load(Ordering::SeqCst)
            && !self.stopping_vsync.load(Ordering::SeqCst);

        generator_died || vsync_died
    }
}

/// Update-processing front end.
///
/// Owns the panel device and the waveform table, and runs the generator and
/// vsync threads between [`start`](Generator::start) and
/// [`stop`](Generator::stop).
pub struct Generator {
    shared: Arc<Shared>,
    generator_thread: Option<JoinHandle<()>>,
    vsync_thread: Option<JoinHandle<()>>,
    started: bool,
}

impl Generator {
    /// Create a pipeline for the given device and waveform table.
    pub fn new(device: impl PanelDevice + 'static, table: WaveformTable) -> Self {
        let dims = *device.dimensions();

        Generator {
            shared: Arc::new(Shared {
                blank_frame: build_blank_frame(&dims),
                dims,
                table,
                device: Mutex::new(Box::new(device)),
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                in_flight: Mutex::new(BTreeSet::new()),
                completion_cv: Condvar::new(),
                slot: Mutex::new(FrameSlot::default()),
                can_read_cv: Condvar::new(),
                can_write_cv: Condvar::new(),
                stopping_generator: AtomicBool::new(false),
                stopping_vsync: AtomicBool::new(false),
                generator_alive: AtomicBool::new(true),
                vsync_alive: AtomicBool::new(true),
                temperature: AtomicI32::new(0),
                next_id: AtomicU32::new(0),
                record_perf: AtomicBool::new(false),
                perf: Mutex::new(PerfReport::default()),
                clock: PerfClock::new(),
            }),
            generator_thread: None,
            vsync_thread: None,
            started: false,
        }
    }

    /// Power the controller on and start processing updates.
    ///
    /// Updates pushed with [`push_update`](Generator::push_update) are
    /// processed continuously by the background threads until
    /// [`stop`](Generator::stop). After three seconds without updates, the
    /// controller is powered down until the next update arrives.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.started {
            return Ok(());
        }

        {
            let mut device = self.shared.device.lock().expect("device mutex poisoned");
            device.start()?;
            let temperature = device.temperature()?;
            self.shared
                .temperature
                .store(temperature, Ordering::SeqCst);
        }

        self.shared.stopping_generator.store(false, Ordering::SeqCst);
        self.shared.stopping_vsync.store(false, Ordering::SeqCst);
        self.shared.generator_alive.store(true, Ordering::SeqCst);
        self.shared.vsync_alive.store(true, Ordering::SeqCst);
        *self.shared.slot.lock().expect("slot mutex poisoned") = FrameSlot::default();

        let spawn_error = |source: io::Error| {
            PipelineError::Device(DeviceError::Io {
                context: "spawn pipeline thread",
                source,
            })
        };

        let shared = Arc::clone(&self.shared);
        self.generator_thread = Some(
            thread::Builder::new()
                .name("epd-generator".into())
                .spawn(move || GeneratorWorker::new(shared).run())
                .map_err(spawn_error)?,
        );

        let shared = Arc::clone(&self.shared);
        self.vsync_thread = Some(
            thread::Builder::new()
                .name("epd-vsync".into())
                .spawn(move || run_vsync(&shared))
                .map_err(spawn_error)?,
        );

        self.started = true;
        Ok(())
    }

    /// Stop the background threads and power the controller off.
    ///
    /// Updates still waiting in the queue are discarded; callers that need
    /// a clean shutdown should [`wait_for_all`](Generator::wait_for_all)
    /// first.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }

        self.shared.stopping_generator.store(true, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();
        self.shared.can_write_cv.notify_all();

        if let Some(handle) = self.generator_thread.take() {
            let _ = handle.join();
        }

        self.shared.stopping_vsync.store(true, Ordering::SeqCst);
        self.shared.can_read_cv.notify_all();

        if let Some(handle) = self.vsync_thread.take() {
            let _ = handle.join();
        }

        self.shared
            .queue
            .lock()
            .expect("queue mutex poisoned")
            .clear();

        self.shared
            .device
            .lock()
            .expect("device mutex poisoned")
            .stop();

        self.started = false;
    }

    /// Queue an update identified by mode id.
    ///
    /// The region and buffer are in client coordinates. Returns the id to
    /// wait on, or `None` (with no side effects) when the update is
    /// invalid: unknown mode, buffer length not matching the region, or
    /// region outside the panel.
    pub fn push_update(
        &self,
        mode: ModeId,
        immediate: bool,
        region: Region,
        buffer: &[Intensity],
    ) -> Result<Option<UpdateId>, PipelineError> {
        if self.shared.thread_died() {
            return Err(PipelineError::BackgroundThreadDied);
        }

        if mode >= self.shared.table.mode_count() {
            return Ok(None);
        }

        let dims = &self.shared.dims;
        let (panel_region, panel_buffer) =
            match to_panel_coords(region, buffer, dims.real_width, dims.real_height) {
                Some(transformed) => transformed,
                None => return Ok(None),
            };

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let mut update = Update::new(
            id,
            mode,
            immediate,
            panel_region,
            panel_buffer,
            self.shared.record_perf.load(Ordering::SeqCst),
        );
        update.record(|t| &mut t.enqueue, self.shared.clock.now_micros());

        self.shared
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .insert(id);

        self.shared
            .queue
            .lock()
            .expect("queue mutex poisoned")
            .push_back(update);
        self.shared.queue_cv.notify_one();

        Ok(Some(id))
    }

    /// Queue an update identified by mode kind.
    ///
    /// Returns `None` when the panel's table has no mode of that kind.
    pub fn push_update_by_kind(
        &self,
        kind: ModeKind,
        immediate: bool,
        region: Region,
        buffer: &[Intensity],
    ) -> Result<Option<UpdateId>, PipelineError> {
        match self.shared.table.mode_id(kind) {
            Some(mode) => self.push_update(mode, immediate, region, buffer),
            None => Ok(None),
        }
    }

    /// Block until the given update has been scanned out.
    pub fn wait_for(&self, id: UpdateId) -> Result<(), PipelineError> {
        let mut in_flight = self
            .shared
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned");

        while in_flight.contains(&id) {
            if self.shared.thread_died() {
                return Err(PipelineError::BackgroundThreadDied);
            }

            let (guard, _) = self
                .shared
                .completion_cv
                .wait_timeout(in_flight, WAITER_POLL_INTERVAL)
                .expect("in-flight mutex poisoned");
            in_flight = guard;
        }

        Ok(())
    }

    /// Block until every accepted update has been scanned out.
    pub fn wait_for_all(&self) -> Result<(), PipelineError> {
        let mut in_flight = self
            .shared
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned");

        while !in_flight.is_empty() {
            if self.shared.thread_died() {
                return Err(PipelineError::BackgroundThreadDied);
            }

            let (guard, _) = self
                .shared
                .completion_cv
                .wait_timeout(in_flight, WAITER_POLL_INTERVAL)
                .expect("in-flight mutex poisoned");
            in_flight = guard;
        }

        Ok(())
    }

    /// Enable or disable timing collection for subsequently pushed updates.
    pub fn set_perf_recording(&self, enabled: bool) {
        self.shared.record_perf.store(enabled, Ordering::SeqCst);
    }

    /// Render the collected timing records as a CSV document.
    pub fn perf_report(&self) -> String {
        self.shared
            .perf
            .lock()
            .expect("perf mutex poisoned")
            .to_csv()
    }

    /// The waveform table this pipeline drives the panel with.
    pub fn table(&self) -> &WaveformTable {
        &self.shared.table
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Generator-thread state: the shadow intensity arrays and frame buffers.
struct GeneratorWorker {
    shared: Arc<Shared>,

    /// Last-known value of every panel cell
    current: Vec<Intensity>,

    /// Target value of every panel cell during an update
    next: Vec<Intensity>,

    /// Per-cell progress through the waveform during immediate updates
    steps: Vec<u32>,

    /// Recycled frame buffers handed back by the vsync thread
    spare: Vec<Vec<u8>>,
}

impl GeneratorWorker {
    fn new(shared: Arc<Shared>) -> Self {
        let size = shared.dims.real_size as usize;

        GeneratorWorker {
            shared,
            current: vec![0; size],
            next: vec![0; size],
            steps: vec![0; size],
            spare: Vec::new(),
        }
    }

    fn run(mut self) {
        while !self.shared.stopping_generator.load(Ordering::SeqCst) {
            match self.pop_update() {
                Some(update) if update.immediate => self.generate_immediate(update),
                Some(update) => self.generate_batch(update),
                None => break,
            }
        }

        self.shared.generator_alive.store(false, Ordering::SeqCst);
        debug!("generator thread exiting");
    }

    /// Take the next update off the queue, blocking until one arrives or
    /// the pipeline stops.
    fn pop_update(&mut self) -> Option<Update> {
        let queue = self.shared.queue.lock().expect("queue mutex poisoned");
        let mut queue = self
            .shared
            .queue_cv
            .wait_while(queue, |queue| {
                queue.is_empty() && !self.shared.stopping_generator.load(Ordering::SeqCst)
            })
            .expect("queue mutex poisoned");

        if self.shared.stopping_generator.load(Ordering::SeqCst) {
            return None;
        }

        let mut update = queue.pop_front()?;
        drop(queue);

        update.record(|t| &mut t.dequeue, self.shared.clock.now_micros());
        Some(update)
    }

    /// Absorb compatible updates from the head of the queue.
    ///
    /// Only a contiguous run of updates with the same mode and immediate
    /// flag merges, preserving the visible ordering of everything behind a
    /// mismatch. Merged buffers are replayed onto the shadow target array
    /// in queue order.
    fn merge_updates(&mut self, update: &mut Update) {
        loop {
            let mut queue = self.shared.queue.lock().expect("queue mutex poisoned");

            let compatible = match queue.front() {
                Some(head) => {
                    head.immediate == update.immediate
                        && head.mode == update.mode
                        && !(update.immediate
                            && crate::update::conflicts_with_transitions(
                                &self.steps,
                                &self.next,
                                self.shared.dims.real_width,
                                head,
                            ))
                }
                None => false,
            };

            if !compatible {
                return;
            }

            let mut head = queue.pop_front().expect("checked non-empty");
            drop(queue);

            head.record(|t| &mut t.dequeue, self.shared.clock.now_micros());
            head.apply(&mut self.next, self.shared.dims.real_width);
            update.merge_with(head);
        }
    }

    /// Fresh frame buffer initialized to the blank frame.
    fn take_frame(&mut self) -> Vec<u8> {
        match self.spare.pop() {
            Some(mut frame) => {
                frame.copy_from_slice(&self.shared.blank_frame);
                frame
            }
            None => self.shared.blank_frame.clone(),
        }
    }

    /// Generate and send every frame of an update before scanout starts.
    fn generate_batch(&mut self, mut update: Update) {
        let shared = Arc::clone(&self.shared);
        let temperature = shared.temperature.load(Ordering::SeqCst);

        let waveform = match shared.table.lookup(update.mode, temperature) {
            Ok(waveform) => waveform,
            Err(err) => {
                error!("dropping update {:?}: {}", update.ids, err);
                self.complete(&update.ids);
                return;
            }
        };

        self.next.copy_from_slice(&self.current);
        update.apply(&mut self.next, self.shared.dims.real_width);
        self.merge_updates(&mut update);

        let dims = self.shared.dims;
        let region = update.region.aligned(dims.packed_pixels);
        let consecutive = framegen::check_consecutive(&dims, &region, &self.current, &self.next);

        let mut frames = Vec::with_capacity(waveform.len());

        for matrix in waveform {
            update.record(|t| &mut t.generate_start, self.shared.clock.now_micros());

            let mut frame = self.take_frame();
            framegen::fill_batch_frame(
                &mut frame,
                &dims,
                matrix,
                &region,
                &self.current,
                &self.next,
                &consecutive,
            );
            frames.push(frame);

            update.record(|t| &mut t.generate_end, self.shared.clock.now_micros());
        }

        // The update is committed once its frames exist; the blank padding
        // reads equal values from both arrays either way
        for y in 0..region.height as usize {
            let row = (region.top as usize + y) * dims.real_width as usize + region.left as usize;
            self.current[row..row + region.width as usize]
                .copy_from_slice(&self.next[row..row + region.width as usize]);
        }

        self.send_frames(frames, Some(update), true);
    }

    /// Generate frames one by one, letting later updates join in between.
    fn generate_immediate(&mut self, mut update: Update) {
        let shared = Arc::clone(&self.shared);
        let temperature = shared.temperature.load(Ordering::SeqCst);

        let waveform = match shared.table.lookup(update.mode, temperature) {
            Ok(waveform) => waveform,
            Err(err) => {
                error!("dropping update {:?}: {}", update.ids, err);
                self.complete(&update.ids);
                return;
            }
        };

        if waveform.is_empty() {
            // Nothing to emit; the update is trivially complete
            self.complete(&update.ids);
            return;
        }

        self.next.copy_from_slice(&self.current);
        update.apply(&mut self.next, self.shared.dims.real_width);
        self.steps.fill(0);

        let dims = self.shared.dims;

        loop {
            self.merge_updates(&mut update);

            let region = update.region.aligned(dims.packed_pixels);

            update.record(|t| &mut t.generate_start, self.shared.clock.now_micros());
            let mut frame = self.take_frame();
            let active = framegen::fill_immediate_frame(
                &mut frame,
                &dims,
                waveform,
                &region,
                &mut self.current,
                &self.next,
                &mut self.steps,
            );
            update.record(|t| &mut t.generate_end, self.shared.clock.now_micros());

            if active.is_empty() {
                // No cell advanced: the update has converged
                self.send_frames(vec![frame], Some(update), true);
                return;
            }

            update.region = active;

            if !self.send_frames(vec![frame], None, false) {
                return;
            }
        }
    }

    /// Hand frames to the vsync stage, blocking until the slot is free.
    ///
    /// Returns false when the pipeline is stopping or the vsync thread is
    /// gone; the frames are dropped in that case.
    fn send_frames(&mut self, frames: Vec<Vec<u8>>, update: Option<Update>, finalize: bool) -> bool {
        let slot = self.shared.slot.lock().expect("slot mutex poisoned");
        let mut slot = self
            .shared
            .can_write_cv
            .wait_while(slot, |slot| {
                slot.readable
                    && !self.shared.stopping_generator.load(Ordering::SeqCst)
                    && self.shared.vsync_alive.load(Ordering::SeqCst)
            })
            .expect("slot mutex poisoned");

        if self.shared.stopping_generator.load(Ordering::SeqCst)
            || !self.shared.vsync_alive.load(Ordering::SeqCst)
        {
            return false;
        }

        let spare = std::mem::replace(&mut slot.frames, frames);
        slot.update = update;
        slot.finalize = finalize;
        slot.readable = true;
        drop(slot);

        self.shared.can_read_cv.notify_one();
        self.spare.extend(spare);
        true
    }

    /// Mark updates complete without scanning anything out.
    fn complete(&self, ids: &[UpdateId]) {
        let mut in_flight = self
            .shared
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned");
        for id in ids {
            in_flight.remove(id);
        }
        drop(in_flight);

        self.shared.completion_cv.notify_all();
    }
}

/// Vsync-thread loop: scan out frame batches and manage controller power.
fn run_vsync(shared: &Arc<Shared>) {
    loop {
        let (frames, mut update, finalize) = {
            let slot = shared.slot.lock().expect("slot mutex poisoned");
            let (slot, timeout) = shared
                .can_read_cv
                .wait_timeout_while(slot, POWER_OFF_TIMEOUT, |slot| {
                    !slot.readable && !shared.stopping_vsync.load(Ordering::SeqCst)
                })
                .expect("slot mutex poisoned");
            let mut slot = slot;

            if timeout.timed_out()
                && !slot.readable
                && !shared.stopping_vsync.load(Ordering::SeqCst)
            {
                // No updates are coming: save power until the next one
                {
                    let mut device = shared.device.lock().expect("device mutex poisoned");
                    if let Err(err) = device.set_power(false) {
                        error!("vsync thread terminating: {}", err);
                        vsync_died(shared);
                        return;
                    }
                }
                debug!("controller powered off after idle timeout");

                slot = shared
                    .can_read_cv
                    .wait_while(slot, |slot| {
                        !slot.readable && !shared.stopping_vsync.load(Ordering::SeqCst)
                    })
                    .expect("slot mutex poisoned");
            }

            if shared.stopping_vsync.load(Ordering::SeqCst) {
                return;
            }

            (
                std::mem::take(&mut slot.frames),
                slot.update.take(),
                slot.finalize,
            )
        };

        let scanout = (|| -> Result<(), DeviceError> {
            let mut device = shared.device.lock().expect("device mutex poisoned");
            device.set_power(true)?;

            let temperature = device.temperature()?;
            shared.temperature.store(temperature, Ordering::SeqCst);

            for frame in &frames {
                if let Some(update) = update.as_mut() {
                    update.record(|t| &mut t.vsync_start, shared.clock.now_micros());
                }

                device.back_buffer()?.copy_from_slice(frame);
                device.page_flip()?;

                if let Some(update) = update.as_mut() {
                    update.record(|t| &mut t.vsync_end, shared.clock.now_micros());
                }
            }

            Ok(())
        })();

        if let Err(err) = scanout {
            // Never unwind across the thread boundary: report and terminate
            error!("vsync thread terminating: {}", err);
            vsync_died(shared);
            return;
        }

        if finalize {
            if let Some(mut update) = update {
                if let Some(timeline) = update.timeline.take() {
                    shared.perf.lock().expect("perf mutex poisoned").push(PerfRecord {
                        ids: update.ids.clone(),
                        mode: update.mode,
                        immediate: update.immediate,
                        width: update.region.width,
                        height: update.region.height,
                        timeline,
                    });
                }

                let mut in_flight = shared.in_flight.lock().expect("in-flight mutex poisoned");
                for id in &update.ids {
                    in_flight.remove(id);
                }
                drop(in_flight);

                shared.completion_cv.notify_all();
            }
        }

        {
            let mut slot = shared.slot.lock().expect("slot mutex poisoned");
            // Hand the buffers back for reuse
            slot.frames = frames;
            slot.finalize = false;
            slot.readable = false;
        }
        shared.can_write_cv.notify_one();
    }
}

fn vsync_died(shared: &Arc<Shared>) {
    shared.vsync_alive.store(false, Ordering::SeqCst);
    // Wake anything blocked on the slot or on completions so the failure
    // is observed
    shared.can_write_cv.notify_all();
    shared.completion_cv.notify_all();
}
