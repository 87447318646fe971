//! Frame computation.
//!
//! Turns intensity transitions into packed scanout frames. Eight display
//! pixels share one frame pixel: their phases are packed two bits each into
//! the first two bytes, with the fifth through eighth pixels in the first
//! byte and the first through fourth in the second (a little-endian 16-bit
//! word with the first pixel in the most significant bit pair).

use epd_waveform::{Intensity, Phase, PhaseMatrix, Waveform};

use crate::dims::FramebufferDimensions;
use crate::region::Region;

/// Byte offset of a panel region's first frame pixel inside a frame.
pub(crate) fn frame_offset(dims: &FramebufferDimensions, region: &Region) -> usize {
    ((dims.upper_margin + region.top) * dims.stride
        + (dims.left_margin + region.left / dims.packed_pixels) * dims.depth) as usize
}

/// Pack eight phases into their two scanout bytes.
pub(crate) fn pack_phases(phases: &[Phase; 8]) -> [u8; 2] {
    [
        phases[4].bits() << 6 | phases[5].bits() << 4 | phases[6].bits() << 2 | phases[7].bits(),
        phases[0].bits() << 6 | phases[1].bits() << 4 | phases[2].bits() << 2 | phases[3].bits(),
    ]
}

/// Mark the 8-pixel groups whose transition equals their predecessor's in
/// scan order.
///
/// Identical consecutive groups pack to identical bytes, so the frame
/// filler can reuse the previous group's bytes instead of recomputing the
/// eight matrix lookups. Large uniform updates hit this path almost always.
pub(crate) fn check_consecutive(
    dims: &FramebufferDimensions,
    region: &Region,
    current: &[Intensity],
    next: &[Intensity],
) -> Vec<bool> {
    let packed = dims.packed_pixels as usize;
    let real_width = dims.real_width as usize;
    let groups_per_row = region.width as usize / packed;

    let mut result = vec![false; groups_per_row * region.height as usize];
    let mut previous: Option<usize> = None;
    let mut index = 0;

    for y in 0..region.height as usize {
        let row = (region.top as usize + y) * real_width + region.left as usize;

        for x in 0..groups_per_row {
            let group = row + x * packed;

            if let Some(last) = previous {
                result[index] = current[last..last + packed] == current[group..group + packed]
                    && next[last..last + packed] == next[group..group + packed];
            }

            previous = Some(group);
            index += 1;
        }
    }

    result
}

/// Fill one batch frame for the given phase matrix.
///
/// `frame` must start out as a copy of the blank frame; only the first two
/// bytes of the frame pixels inside the (aligned) region are written.
pub(crate) fn fill_batch_frame(
    frame: &mut [u8],
    dims: &FramebufferDimensions,
    matrix: &PhaseMatrix,
    region: &Region,
    current: &[Intensity],
    next: &[Intensity],
    consecutive: &[bool],
) {
    let packed = dims.packed_pixels as usize;
    let depth = dims.depth as usize;
    let stride = dims.stride as usize;
    let real_width = dims.real_width as usize;
    let groups_per_row = region.width as usize / packed;

    let mut data = frame_offset(dims, region);
    let mut bytes = [0u8; 2];
    let mut index = 0;

    for y in 0..region.height as usize {
        let row = (region.top as usize + y) * real_width + region.left as usize;
        let mut offset = data;

        for x in 0..groups_per_row {
            if !consecutive[index] {
                let group = row + x * packed;
                let mut phases = [Phase::Noop; 8];

                for (pixel, phase) in phases.iter_mut().enumerate() {
                    let from = current[group + pixel] as usize;
                    let to = next[group + pixel] as usize;
                    *phase = matrix[from][to];
                }

                bytes = pack_phases(&phases);
            }

            frame[offset] = bytes[0];
            frame[offset + 1] = bytes[1];
            offset += depth;
            index += 1;
        }

        data += stride;
    }
}

/// Advance every in-transition pixel of the region by one frame.
///
/// Pixels whose target differs from their current value emit the phase for
/// their transition step and move one step forward; a pixel that completes
/// its waveform commits its new intensity. Returns the bounding region of
/// the pixels that advanced; an empty result means the frame was a no-op
/// and the update is finished.
pub(crate) fn fill_immediate_frame(
    frame: &mut [u8],
    dims: &FramebufferDimensions,
    waveform: &Waveform,
    region: &Region,
    current: &mut [Intensity],
    next: &[Intensity],
    steps: &mut [u32],
) -> Region {
    let packed = dims.packed_pixels as usize;
    let depth = dims.depth as usize;
    let stride = dims.stride as usize;
    let real_width = dims.real_width as usize;
    let groups_per_row = region.width as usize / packed;
    let length = waveform.len() as u32;

    let mut active = Region::EMPTY;
    let mut data = frame_offset(dims, region);

    for y in 0..region.height as usize {
        let row = (region.top as usize + y) * real_width + region.left as usize;
        let mut offset = data;

        for x in 0..groups_per_row {
            let group = row + x * packed;
            let mut phases = [Phase::Noop; 8];

            for (pixel, phase) in phases.iter_mut().enumerate() {
                let cell = group + pixel;

                if current[cell] == next[cell] {
                    continue;
                }

                let step = steps[cell] as usize;
                *phase = waveform[step][current[cell] as usize][next[cell] as usize];

                active.extend_point(
                    (region.left as usize + x * packed + pixel) as u32,
                    region.top + y as u32,
                );

                steps[cell] += 1;

                if steps[cell] == length {
                    steps[cell] = 0;
                    current[cell] = next[cell];
                }
            }

            let bytes = pack_phases(&phases);
            frame[offset] = bytes[0];
            frame[offset + 1] = bytes[1];
            offset += depth;
        }

        data += stride;
    }

    active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::build_blank_frame;
    use epd_waveform::uniform_matrix;

    // 260-pixel lines, 16 usable pixels per row, 4 usable rows
    fn test_dims() -> FramebufferDimensions {
        FramebufferDimensions::new(260, 4, 8, 8, 3, 258, 0, 3, 1)
    }

    #[test]
    fn test_pack_phases_orders_bytes() {
        let phases = [
            Phase::White,
            Phase::White,
            Phase::White,
            Phase::White,
            Phase::Black,
            Phase::Black,
            Phase::Black,
            Phase::Black,
        ];

        // First four pixels land in the second byte
        assert_eq!(pack_phases(&phases), [0b0101_0101, 0b1010_1010]);
        assert_eq!(pack_phases(&[Phase::White; 8]), [0xAA, 0xAA]);
        assert_eq!(pack_phases(&[Phase::Noop; 8]), [0x00, 0x00]);
    }

    #[test]
    fn test_frame_offset_applies_margins() {
        let dims = test_dims();
        let region = Region::new(1, 8, 8, 1);

        assert_eq!(
            frame_offset(&dims, &region),
            ((3 + 1) * 1040 + (258 + 1) * 4) as usize
        );
    }

    #[test]
    fn test_batch_frame_packs_region_and_preserves_blank() {
        let dims = test_dims();
        let blank = build_blank_frame(&dims);
        let real_size = dims.real_size as usize;

        let current = vec![0u8; real_size];
        let mut next = vec![0u8; real_size];
        let region = Region::new(0, 0, 8, 1);
        for x in 0..8 {
            next[x] = 30;
        }

        let matrix = uniform_matrix(Phase::White);
        let consecutive = check_consecutive(&dims, &region, &current, &next);

        let mut frame = blank.clone();
        fill_batch_frame(&mut frame, &dims, &matrix, &region, &current, &next, &consecutive);

        let offset = frame_offset(&dims, &region);
        assert_eq!(frame[offset], 0xAA);
        assert_eq!(frame[offset + 1], 0xAA);

        // Everything else, including sync bytes inside the region, is blank
        let mut reverted = frame.clone();
        reverted[offset] = 0;
        reverted[offset + 1] = 0;
        assert_eq!(reverted, blank);
    }

    #[test]
    fn test_batch_frame_padding_is_noop() {
        let dims = test_dims();
        let real_size = dims.real_size as usize;
        let real_width = dims.real_width as usize;

        // Single-pixel update at (2, 1); the aligned region spans pixels 0..8
        let mut current = vec![0u8; real_size];
        for (i, value) in current.iter_mut().enumerate() {
            *value = ((i % 16) * 2) as u8;
        }
        let mut next = current.clone();
        next[real_width + 2] = 30;

        let region = Region::new(1, 2, 1, 1).aligned(8);
        assert_eq!(region, Region::new(1, 0, 8, 1));

        // A matrix that drives every proper transition but leaves settled
        // pixels alone, so non-noop padding would show in the packed bytes
        let mut matrix = uniform_matrix(Phase::Black);
        for value in 0..32 {
            matrix[value][value] = Phase::Noop;
        }
        let consecutive = check_consecutive(&dims, &region, &current, &next);

        let mut frame = build_blank_frame(&dims);
        fill_batch_frame(&mut frame, &dims, &matrix, &region, &current, &next, &consecutive);

        let offset = frame_offset(&dims, &region);
        // Pixel 2 sits in the second byte (first four pixels), bit pair 2
        assert_eq!(frame[offset], 0x00);
        assert_eq!(frame[offset + 1], 0b0000_0100);
    }

    #[test]
    fn test_check_consecutive_marks_repeats() {
        let dims = test_dims();
        let real_size = dims.real_size as usize;

        let current = vec![0u8; real_size];
        let mut next = vec![30u8; real_size];
        let region = Region::new(0, 0, 16, 2);

        let consecutive = check_consecutive(&dims, &region, &current, &next);
        assert_eq!(consecutive, vec![false, true, true, true]);

        // Break the repetition in the second group
        next[8] = 0;
        let consecutive = check_consecutive(&dims, &region, &current, &next);
        assert_eq!(consecutive, vec![false, false, false, true]);
    }

    #[test]
    fn test_immediate_frame_steps_and_commits() {
        let dims = test_dims();
        let real_size = dims.real_size as usize;

        let mut current = vec![0u8; real_size];
        let next = {
            let mut next = current.clone();
            for x in 0..8 {
                next[x] = 30;
            }
            next
        };
        let mut steps = vec![0u32; real_size];

        let waveform: Waveform =
            vec![uniform_matrix(Phase::White), uniform_matrix(Phase::Black)];
        let region = Region::new(0, 0, 8, 1);

        let mut frame = build_blank_frame(&dims);
        let active = fill_immediate_frame(
            &mut frame, &dims, &waveform, &region, &mut current, &next, &mut steps,
        );

        assert_eq!(active, Region::new(0, 0, 8, 1));
        assert_eq!(steps[0], 1);
        assert_eq!(current[0], 0, "pixel must not commit before the last step");
        let offset = frame_offset(&dims, &region);
        assert_eq!([frame[offset], frame[offset + 1]], [0xAA, 0xAA]);

        // Second frame completes the waveform and commits
        let mut frame = build_blank_frame(&dims);
        let active = fill_immediate_frame(
            &mut frame, &dims, &waveform, &region, &mut current, &next, &mut steps,
        );

        assert_eq!(active, Region::new(0, 0, 8, 1));
        assert_eq!(steps[0], 0);
        assert_eq!(current[0], 30);
        let offset = frame_offset(&dims, &region);
        assert_eq!([frame[offset], frame[offset + 1]], [0x55, 0x55]);

        // Third frame has nothing left to do
        let mut frame = build_blank_frame(&dims);
        let active = fill_immediate_frame(
            &mut frame, &dims, &waveform, &region, &mut current, &next, &mut steps,
        );

        assert!(active.is_empty());
        assert_eq!([frame[offset], frame[offset + 1]], [0x00, 0x00]);
    }
}
