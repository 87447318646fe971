//! Per-update timing records and the CSV performance report.

use std::fmt::Write as _;
use std::time::Instant;

use epd_waveform::ModeId;

use crate::update::UpdateId;

/// Microsecond clock anchored at pipeline start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PerfClock {
    epoch: Instant,
}

impl PerfClock {
    pub(crate) fn new() -> Self {
        PerfClock {
            epoch: Instant::now(),
        }
    }

    pub(crate) fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// Timestamps collected while an update batch moves through the pipeline.
///
/// Enqueue and dequeue times hold one entry per merged sub-update; the
/// generate and vsync lists hold one entry per frame.
#[derive(Debug, Clone, Default)]
pub struct UpdateTimeline {
    pub enqueue: Vec<u64>,
    pub dequeue: Vec<u64>,
    pub generate_start: Vec<u64>,
    pub generate_end: Vec<u64>,
    pub vsync_start: Vec<u64>,
    pub vsync_end: Vec<u64>,
}

impl UpdateTimeline {
    /// Fold another timeline into this one (update merging).
    pub(crate) fn absorb(&mut self, other: UpdateTimeline) {
        self.enqueue.extend(other.enqueue);
        self.dequeue.extend(other.dequeue);
        self.generate_start.extend(other.generate_start);
        self.generate_end.extend(other.generate_end);
        self.vsync_start.extend(other.vsync_start);
        self.vsync_end.extend(other.vsync_end);
    }
}

/// One finalized batch in the performance report.
#[derive(Debug, Clone)]
pub(crate) struct PerfRecord {
    pub ids: Vec<UpdateId>,
    pub mode: ModeId,
    pub immediate: bool,
    pub width: u32,
    pub height: u32,
    pub timeline: UpdateTimeline,
}

fn push_list<T: std::fmt::Display>(out: &mut String, values: &[T]) {
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            out.push(':');
        }
        let _ = write!(out, "{}", value);
    }
}

/// Accumulated performance report.
///
/// One row per processed batch; fields holding a variable number of values
/// are colon-separated.
#[derive(Debug, Default)]
pub(crate) struct PerfReport {
    records: Vec<PerfRecord>,
}

impl PerfReport {
    pub(crate) fn push(&mut self, record: PerfRecord) {
        self.records.push(record);
    }

    pub(crate) fn to_csv(&self) -> String {
        let mut out = String::from(
            "id,mode,immediate,width,height,enqueue_times,dequeue_times,\
             generate_start_times,generate_end_times,vsync_start_times,vsync_end_times\n",
        );

        for record in &self.records {
            push_list(&mut out, &record.ids);
            let _ = write!(
                out,
                ",{},{},{},{},",
                record.mode,
                u8::from(record.immediate),
                record.width,
                record.height
            );
            push_list(&mut out, &record.timeline.enqueue);
            out.push(',');
            push_list(&mut out, &record.timeline.dequeue);
            out.push(',');
            push_list(&mut out, &record.timeline.generate_start);
            out.push(',');
            push_list(&mut out, &record.timeline.generate_end);
            out.push(',');
            push_list(&mut out, &record.timeline.vsync_start);
            out.push(',');
            push_list(&mut out, &record.timeline.vsync_end);
            out.push('\n');
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_shape() {
        let mut report = PerfReport::default();
        report.push(PerfRecord {
            ids: vec![3, 4],
            mode: 2,
            immediate: true,
            width: 16,
            height: 8,
            timeline: UpdateTimeline {
                enqueue: vec![10, 20],
                dequeue: vec![30, 35],
                generate_start: vec![40],
                generate_end: vec![45],
                vsync_start: vec![50],
                vsync_end: vec![60],
            },
        });

        let csv = report.to_csv();
        let mut lines = csv.lines();

        let header = lines.next().unwrap();
        assert!(header.starts_with("id,mode,immediate,"));
        assert_eq!(header.split(',').count(), 11);

        let row = lines.next().unwrap();
        assert_eq!(row, "3:4,2,1,16,8,10:20,30:35,40,45,50,60");
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_timeline_absorb() {
        let mut timeline = UpdateTimeline {
            enqueue: vec![1],
            ..UpdateTimeline::default()
        };
        timeline.absorb(UpdateTimeline {
            enqueue: vec![2],
            dequeue: vec![3],
            ..UpdateTimeline::default()
        });

        assert_eq!(timeline.enqueue, vec![1, 2]);
        assert_eq!(timeline.dequeue, vec![3]);
    }
}
