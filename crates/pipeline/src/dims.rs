//! Scanout framebuffer geometry.

/// Fixed geometry of the scanout framebuffer and the panel behind it.
///
/// The controller scans out *frame pixels*, each of which packs several
/// actual display pixels in its first two bytes. Margins are blanking
/// intervals that carry no pixel data; the usable panel area is what
/// remains after removing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDimensions {
    /// Number of frame pixels in a line
    pub width: u32,

    /// Number of bytes per frame pixel
    pub depth: u32,

    /// Number of bytes per line
    pub stride: u32,

    /// Number of actual display pixels packed inside a frame pixel
    pub packed_pixels: u32,

    /// Number of lines in a frame
    pub height: u32,

    /// Number of bytes per frame
    pub frame_size: u32,

    /// Number of frames allocated in the framebuffer
    pub frame_count: u32,

    /// Number of bytes in the whole framebuffer
    pub total_size: u32,

    /// Blanking margins, in frame pixels and lines
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,

    /// Number of usable display pixels in a line
    pub real_width: u32,

    /// Number of usable lines in a frame
    pub real_height: u32,

    /// Number of usable display pixels in a frame
    pub real_size: u32,
}

impl FramebufferDimensions {
    /// Compute the derived sizes from the base geometry.
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        width: u32,
        depth: u32,
        packed_pixels: u32,
        height: u32,
        frame_count: u32,
        left_margin: u32,
        right_margin: u32,
        upper_margin: u32,
        lower_margin: u32,
    ) -> Self {
        let stride = width * depth;
        let frame_size = stride * height;
        let real_width = (width - left_margin - right_margin) * packed_pixels;
        let real_height = height - upper_margin - lower_margin;

        FramebufferDimensions {
            width,
            depth,
            stride,
            packed_pixels,
            height,
            frame_size,
            frame_count,
            total_size: frame_size * frame_count,
            left_margin,
            right_margin,
            upper_margin,
            lower_margin,
            real_width,
            real_height,
            real_size: real_width * real_height,
        }
    }

    /// Geometry of the reMarkable 2 scanout buffer.
    ///
    /// 17 frames of 260×1408 four-byte frame pixels, eight display pixels
    /// per frame pixel, with a 26-pixel left margin and 3+1 lines of
    /// vertical blanking. The usable panel is 1872×1404.
    pub const REMARKABLE2: Self =
        FramebufferDimensions::new(260, 4, 8, 1408, 17, 26, 0, 3, 1);

    /// Index of the frame slot the hardware falls back to between flips.
    ///
    /// The scan controller automatically pans to the last frame of the
    /// buffer after each vsync interval unless another flip is scheduled
    /// first. That slot must keep holding a blank frame for as long as the
    /// buffer is mapped.
    pub const fn default_frame(&self) -> u32 {
        self.frame_count - 1
    }

    /// Byte offset of a frame slot inside the framebuffer.
    pub const fn frame_offset(&self, index: u32) -> usize {
        (index * self.frame_size) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remarkable2_derived_sizes() {
        let dims = FramebufferDimensions::REMARKABLE2;

        assert_eq!(dims.stride, 1040);
        assert_eq!(dims.frame_size, 1_464_320);
        assert_eq!(dims.total_size, 24_893_440);
        assert_eq!(dims.real_width, 1872);
        assert_eq!(dims.real_height, 1404);
        assert_eq!(dims.real_size, 2_628_288);
        assert_eq!(dims.default_frame(), 16);
    }

    #[test]
    fn test_frame_offset() {
        let dims = FramebufferDimensions::REMARKABLE2;
        assert_eq!(dims.frame_offset(0), 0);
        assert_eq!(dims.frame_offset(2), 2 * 1_464_320);
    }
}
