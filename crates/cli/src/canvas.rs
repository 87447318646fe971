//! Drawing surface producing update buffers.
//!
//! Bridges `embedded-graphics` to the driver's intensity buffers: drawing
//! targets `Gray4` (the panel's 16 gray levels) and each luma maps to the
//! even 5-bit intensity the waveform tables index by.

use embedded_graphics::pixelcolor::Gray4;
use embedded_graphics::prelude::*;

use epd_waveform::Intensity;

/// In-memory canvas whose contents can be pushed as one update.
pub struct IntensityCanvas {
    width: u32,
    height: u32,
    pixels: Vec<Intensity>,
}

impl IntensityCanvas {
    /// Create a canvas filled with white.
    pub fn new(width: u32, height: u32) -> Self {
        IntensityCanvas {
            width,
            height,
            pixels: vec![30; (width * height) as usize],
        }
    }

    /// Row-major intensity buffer, ready for `push_update`.
    pub fn data(&self) -> &[Intensity] {
        &self.pixels
    }

    /// Fill the whole canvas with one gray level.
    pub fn fill(&mut self, color: Gray4) {
        self.pixels.fill(color.luma() * 2);
    }
}

impl OriginDimensions for IntensityCanvas {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for IntensityCanvas {
    type Color = Gray4;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x >= 0
                && point.y >= 0
                && (point.x as u32) < self.width
                && (point.y as u32) < self.height
            {
                let index = point.y as u32 * self.width + point.x as u32;
                self.pixels[index as usize] = color.luma() * 2;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};

    #[test]
    fn test_canvas_starts_white() {
        let canvas = IntensityCanvas::new(4, 2);
        assert_eq!(canvas.data(), &[30; 8]);
    }

    #[test]
    fn test_drawing_maps_luma_to_intensity() {
        let mut canvas = IntensityCanvas::new(4, 4);

        Rectangle::new(Point::new(1, 1), Size::new(2, 2))
            .into_styled(PrimitiveStyle::with_fill(Gray4::new(5)))
            .draw(&mut canvas)
            .unwrap();

        assert_eq!(canvas.data()[0], 30);
        assert_eq!(canvas.data()[5], 10);
        assert_eq!(canvas.data()[6], 10);
        assert_eq!(canvas.data()[10], 10);
    }

    #[test]
    fn test_out_of_bounds_pixels_are_clipped() {
        let mut canvas = IntensityCanvas::new(2, 2);

        Rectangle::new(Point::new(-1, -1), Size::new(10, 10))
            .into_styled(PrimitiveStyle::with_fill(Gray4::BLACK))
            .draw(&mut canvas)
            .unwrap();

        assert_eq!(canvas.data(), &[0; 4]);
    }
}
