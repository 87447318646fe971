//! Display update requests.

use epd_waveform::{Intensity, ModeId, INTENSITY_MASK};

use crate::perf::UpdateTimeline;
use crate::region::Region;

/// Identifier assigned to each accepted update.
pub type UpdateId = u32;

/// One update request moving through the pipeline.
///
/// Starts out with a single id; merging compatible queue neighbors into an
/// update appends their ids, extends the region to the bounding rectangle,
/// and folds their timing records.
#[derive(Debug, Clone)]
pub(crate) struct Update {
    /// Ids carried by this update (several after merging)
    pub ids: Vec<UpdateId>,

    pub mode: ModeId,
    pub immediate: bool,

    /// Affected region, in panel coordinates
    pub region: Region,

    /// Target intensities for the region, row-major
    pub buffer: Vec<Intensity>,

    /// Timing records, collected when perf reporting is enabled
    pub timeline: Option<UpdateTimeline>,
}

impl Update {
    pub(crate) fn new(
        id: UpdateId,
        mode: ModeId,
        immediate: bool,
        region: Region,
        buffer: Vec<Intensity>,
        record_perf: bool,
    ) -> Self {
        Update {
            ids: vec![id],
            mode,
            immediate,
            region,
            buffer,
            timeline: record_perf.then(UpdateTimeline::default),
        }
    }

    /// Copy the update's buffer into `target` at the update's region.
    ///
    /// `target` is a row-major intensity array `target_width` pixels wide.
    pub(crate) fn apply(&self, target: &mut [Intensity], target_width: u32) {
        let width = self.region.width as usize;
        let target_width = target_width as usize;

        for y in 0..self.region.height as usize {
            let src = y * width;
            let dst = (self.region.top as usize + y) * target_width + self.region.left as usize;
            target[dst..dst + width].copy_from_slice(&self.buffer[src..src + width]);
        }
    }

    /// Merge another update's metadata into this one.
    ///
    /// The region becomes the bounding rectangle of both regions; ids and
    /// timing records are appended. The caller is responsible for replaying
    /// the other update's buffer onto the shadow intensity array first.
    pub(crate) fn merge_with(&mut self, other: Update) {
        self.region.extend(&other.region);
        self.ids.extend(other.ids);

        if let (Some(timeline), Some(other_timeline)) = (&mut self.timeline, other.timeline) {
            timeline.absorb(other_timeline);
        }
    }

    /// Record a timestamp if perf reporting is enabled.
    pub(crate) fn record(&mut self, field: impl FnOnce(&mut UpdateTimeline) -> &mut Vec<u64>, at: u64) {
        if let Some(timeline) = &mut self.timeline {
            field(timeline).push(at);
        }
    }
}

/// Check whether a pending update would conflict with in-transition cells.
///
/// During an immediate update, a pending neighbor may merge in as long as
/// it does not change the target of any cell whose transition has already
/// emitted frames (`steps > 0`). Only cells inside the pending update's own
/// region are compared.
pub(crate) fn conflicts_with_transitions(
    steps: &[u32],
    next: &[Intensity],
    panel_width: u32,
    pending: &Update,
) -> bool {
    let width = panel_width as usize;
    let region = &pending.region;

    for y in 0..region.height as usize {
        let panel_row = (region.top as usize + y) * width + region.left as usize;
        let buffer_row = y * region.width as usize;

        for x in 0..region.width as usize {
            let cell = panel_row + x;

            if steps[cell] > 0 && next[cell] != pending.buffer[buffer_row + x] {
                return true;
            }
        }
    }

    false
}

/// Convert an update from client coordinates to panel coordinates.
///
/// The client origin is the top-left of the displayed image in the usual
/// tablet orientation; the panel's axes are swapped and flipped relative to
/// it. Produces the panel-space region and the permuted buffer, with every
/// intensity masked to its valid range.
///
/// Returns `None` when the buffer does not match the region or the region
/// falls outside the panel.
pub(crate) fn to_panel_coords(
    region: Region,
    buffer: &[Intensity],
    panel_width: u32,
    panel_height: u32,
) -> Option<(Region, Vec<Intensity>)> {
    let width = region.width as usize;
    let height = region.height as usize;

    if buffer.len() != width * height {
        return None;
    }

    let panel_region = Region {
        top: panel_height.checked_sub(region.left.checked_add(region.width)?)?,
        left: panel_width.checked_sub(region.top.checked_add(region.height)?)?,
        width: region.height,
        height: region.width,
    };

    let mut panel_buffer = vec![0; buffer.len()];

    for (k, value) in panel_buffer.iter_mut().enumerate() {
        let row = height - (k % height) - 1;
        let col = width - (k / height) - 1;
        *value = buffer[row * width + col] & INTENSITY_MASK;
    }

    Some((panel_region, panel_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_blits_rectangle() {
        let update = Update::new(
            0,
            0,
            false,
            Region::new(1, 2, 3, 2),
            vec![1, 2, 3, 4, 5, 6],
            false,
        );

        let mut target = vec![0; 6 * 4];
        update.apply(&mut target, 6);

        #[rustfmt::skip]
        let expected = vec![
            0, 0, 0, 0, 0, 0,
            0, 0, 1, 2, 3, 0,
            0, 0, 4, 5, 6, 0,
            0, 0, 0, 0, 0, 0,
        ];
        assert_eq!(target, expected);
    }

    #[test]
    fn test_merge_with_extends_and_collects_ids() {
        let mut update = Update::new(1, 0, false, Region::new(0, 0, 4, 4), vec![0; 16], false);
        let other = Update::new(2, 0, false, Region::new(4, 4, 4, 4), vec![0; 16], false);

        update.merge_with(other);

        assert_eq!(update.ids, vec![1, 2]);
        assert_eq!(update.region, Region::new(0, 0, 8, 8));
    }

    #[test]
    fn test_transform_formula() {
        // 2x3 client rectangle on a 10-wide, 8-high panel
        let region = Region::new(1, 2, 2, 3);
        let buffer = vec![10, 20, 11, 21, 12, 22];

        let (panel_region, panel_buffer) =
            to_panel_coords(region, &buffer, 10, 8).unwrap();

        assert_eq!(panel_region, Region::new(8 - 2 - 2, 10 - 1 - 3, 3, 2));

        // panel[k] = client[(H - k%H - 1) * W + (W - k/H - 1)]
        assert_eq!(panel_buffer, vec![22, 21, 20, 12, 11, 10]);
    }

    #[test]
    fn test_transform_masks_intensities() {
        let region = Region::new(0, 0, 1, 1);
        let (_, buffer) = to_panel_coords(region, &[0xFF], 4, 4).unwrap();
        assert_eq!(buffer, vec![0x1F]);
    }

    #[test]
    fn test_transform_rejects_bad_buffer() {
        assert!(to_panel_coords(Region::new(0, 0, 2, 2), &[0; 3], 8, 8).is_none());
    }

    #[test]
    fn test_transform_rejects_out_of_bounds() {
        // Region extends past the client area of an 8x8 panel
        assert!(to_panel_coords(Region::new(0, 5, 4, 4), &[0; 16], 8, 8).is_none());
    }

    #[test]
    fn test_conflict_requires_transition_in_progress() {
        // 8-wide, 2-high panel; pending covers cells 2 and 3 of the top row
        let mut steps = vec![0u32; 16];
        let next = vec![30u8; 16];
        let pending = Update::new(0, 0, true, Region::new(0, 2, 2, 1), vec![0, 30], false);

        // No cell has emitted frames yet
        assert!(!conflicts_with_transitions(&steps, &next, 8, &pending));

        // Cell 2 is mid-transition towards 30 and the pending update
        // retargets it
        steps[2] = 1;
        assert!(conflicts_with_transitions(&steps, &next, 8, &pending));

        // Agreeing on the in-flight target is not a conflict
        let agreeing = Update::new(1, 0, true, Region::new(0, 2, 2, 1), vec![30, 30], false);
        assert!(!conflicts_with_transitions(&steps, &next, 8, &agreeing));

        // Transitions outside the pending region are ignored
        steps[2] = 0;
        steps[7] = 3;
        assert!(!conflicts_with_transitions(&steps, &next, 8, &pending));
    }

    #[test]
    fn test_transform_involution_on_square() {
        let region = Region::new(2, 3, 4, 2);
        let buffer: Vec<u8> = (0..8).map(|v| v * 2).collect();

        let (mid_region, mid_buffer) = to_panel_coords(region, &buffer, 12, 12).unwrap();
        let (back_region, back_buffer) =
            to_panel_coords(mid_region, &mid_buffer, 12, 12).unwrap();

        assert_eq!(back_region, region);
        assert_eq!(back_buffer, buffer);
    }
}
