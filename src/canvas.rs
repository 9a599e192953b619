//! Bitmap canvas handed to paint callbacks, and the rendered image a layer displays.
//! Geometry is in logical units; the canvas maps it to device pixels by `scale`.

use std::fmt;
use std::sync::Arc;

use image::{Pixel, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const ZERO: Self = Self {
        width: 0.0,
        height: 0.0,
    };

    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Nothing worth painting: either dimension below one logical unit.
    pub fn is_degenerate(&self) -> bool {
        !(self.width >= 1.0 && self.height >= 1.0)
    }

    /// Device pixel dimensions at `scale`, rounded up.
    pub fn to_pixels(&self, scale: f64) -> (u32, u32) {
        fn px(v: f64) -> u32 {
            let v = v.ceil();
            if v.is_finite() && v > 0.0 {
                v.min(u32::MAX as f64) as u32
            } else {
                0
            }
        }
        (px(self.width * scale), px(self.height * scale))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(size: Size) -> Self {
        Self::new(0.0, 0.0, size.width, size.height)
    }
}

/// Straight (non-premultiplied) RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Self = Self::rgba(255, 255, 255, 255);
    pub const BLACK: Self = Self::rgba(0, 0, 0, 255);
    pub const TRANSPARENT: Self = Self::rgba(0, 0, 0, 0);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::rgba(r, g, b, 255)
    }

    pub fn is_opaque(&self) -> bool {
        self.a == 255
    }

    fn to_pixel(self) -> Rgba<u8> {
        Rgba([self.r, self.g, self.b, self.a])
    }
}

/// Source-over composite of `src` onto `dst`.
fn blend(dst: &mut Rgba<u8>, src: Color) {
    match src.a {
        255 => *dst = src.to_pixel(),
        0 => {}
        _ => dst.blend(&src.to_pixel()),
    }
}

/// Drawing target for one render attempt.
pub struct Canvas {
    pixels: RgbaImage,
    size: Size,
    scale: f64,
    opaque: bool,
}

impl fmt::Debug for Canvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canvas")
            .field("size", &self.size)
            .field("scale", &self.scale)
            .field("pixels", &self.pixels.dimensions())
            .field("opaque", &self.opaque)
            .finish()
    }
}

impl Canvas {
    /// Transparent canvas of `size` logical units at `scale`. None if the
    /// pixel dimensions come out empty.
    pub fn new(size: Size, opaque: bool, scale: f64) -> Option<Self> {
        let (w, h) = size.to_pixels(scale);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Self {
            pixels: RgbaImage::new(w, h),
            size,
            scale,
            opaque,
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    pub fn pixel_dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Fill a rectangle given in logical units.
    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let (pw, ph) = self.pixels.dimensions();
        let to_px = |v: f64, max: u32| -> u32 { (v * self.scale).round().clamp(0.0, max as f64) as u32 };
        let x0 = to_px(rect.x, pw);
        let y0 = to_px(rect.y, ph);
        let x1 = to_px(rect.x + rect.width, pw);
        let y1 = to_px(rect.y + rect.height, ph);
        for y in y0..y1 {
            for x in x0..x1 {
                blend(self.pixels.get_pixel_mut(x, y), color);
            }
        }
    }

    pub fn fill(&mut self, color: Color) {
        self.fill_rect(Rect::from_size(self.size), color);
    }

    /// Device-pixel read, for paint callbacks that composite.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        self.pixels
            .get_pixel_checked(x, y)
            .map(|p| Color::rgba(p.0[0], p.0[1], p.0[2], p.0[3]))
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, color: Color) {
        if let Some(p) = self.pixels.get_pixel_mut_checked(x, y) {
            *p = color.to_pixel();
        }
    }

    /// Extract the finished bitmap.
    pub fn into_image(self) -> RenderedImage {
        RenderedImage {
            pixels: Arc::new(self.pixels),
            scale: self.scale,
            opaque: self.opaque,
        }
    }
}

/// Cheaply cloneable handle to a finished bitmap.
#[derive(Clone)]
pub struct RenderedImage {
    pixels: Arc<RgbaImage>,
    scale: f64,
    opaque: bool,
}

impl fmt::Debug for RenderedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedImage")
            .field("pixels", &self.pixels.dimensions())
            .field("scale", &self.scale)
            .field("opaque", &self.opaque)
            .finish()
    }
}

impl RenderedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        self.pixels
            .get_pixel_checked(x, y)
            .map(|p| Color::rgba(p.0[0], p.0[1], p.0[2], p.0[3]))
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.pixels
    }

    /// True if both handles share the same bitmap.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

/// Hands out drawing targets. Returning None means the environment could not
/// provide one and the render attempt stops.
pub trait CanvasProvider: Send + Sync {
    fn begin(&self, size: Size, opaque: bool, scale: f64) -> Option<Canvas>;
}

/// In-memory RGBA bitmaps with an upper bound on device pixels.
#[derive(Debug, Clone)]
pub struct BitmapCanvasProvider {
    max_pixels: u64,
}

impl BitmapCanvasProvider {
    pub fn new(max_pixels: u64) -> Self {
        Self { max_pixels }
    }
}

impl CanvasProvider for BitmapCanvasProvider {
    fn begin(&self, size: Size, opaque: bool, scale: f64) -> Option<Canvas> {
        let (w, h) = size.to_pixels(scale);
        let pixels = u64::from(w) * u64::from(h);
        if pixels > self.max_pixels {
            warn!(width = w, height = h, max = self.max_pixels, "canvas request too large");
            return None;
        }
        Canvas::new(size, opaque, scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_sizes() {
        assert!(Size::ZERO.is_degenerate());
        assert!(Size::new(0.5, 10.0).is_degenerate());
        assert!(Size::new(10.0, 0.0).is_degenerate());
        assert!(Size::new(f64::NAN, 10.0).is_degenerate());
        assert!(!Size::new(1.0, 1.0).is_degenerate());
    }

    #[test]
    fn pixels_follow_scale() {
        assert_eq!(Size::new(100.0, 50.0).to_pixels(2.0), (200, 100));
        assert_eq!(Size::new(1.5, 1.5).to_pixels(1.0), (2, 2));
        assert_eq!(Size::new(-3.0, 4.0).to_pixels(1.0), (0, 4));
    }

    #[test]
    fn fill_covers_whole_canvas() {
        let mut canvas = Canvas::new(Size::new(3.0, 2.0), true, 2.0).unwrap();
        canvas.fill(Color::rgb(10, 20, 30));
        let image = canvas.into_image();
        assert_eq!((image.width(), image.height()), (6, 4));
        for y in 0..4 {
            for x in 0..6 {
                assert_eq!(image.pixel(x, y), Some(Color::rgb(10, 20, 30)));
            }
        }
    }

    #[test]
    fn fill_rect_is_clipped_and_scaled() {
        let mut canvas = Canvas::new(Size::new(4.0, 4.0), false, 1.0).unwrap();
        canvas.fill_rect(Rect::new(2.0, 2.0, 10.0, 10.0), Color::BLACK);
        assert_eq!(canvas.pixel(1, 1), Some(Color::TRANSPARENT));
        assert_eq!(canvas.pixel(3, 3), Some(Color::BLACK));
        assert_eq!(canvas.pixel(4, 4), None);
    }

    #[test]
    fn translucent_fill_blends_over_white() {
        let mut canvas = Canvas::new(Size::new(1.0, 1.0), true, 1.0).unwrap();
        canvas.fill(Color::WHITE);
        canvas.fill(Color::rgba(0, 0, 0, 128));
        let p = canvas.pixel(0, 0).unwrap();
        assert!(p.a >= 254, "got {p:?}");
        assert!(p.r > 120 && p.r < 135, "got {p:?}");
    }

    #[test]
    fn translucent_fill_over_transparent_keeps_color() {
        let mut canvas = Canvas::new(Size::new(1.0, 1.0), false, 1.0).unwrap();
        canvas.fill(Color::rgba(200, 100, 50, 128));
        let p = canvas.pixel(0, 0).unwrap();
        let near = |got: u8, want: u8| got.abs_diff(want) <= 1;
        assert!(near(p.r, 200) && near(p.g, 100) && near(p.b, 50), "got {p:?}");
        assert!(near(p.a, 128), "got {p:?}");
    }

    #[test]
    fn fully_transparent_fill_is_a_no_op() {
        let mut canvas = Canvas::new(Size::new(1.0, 1.0), true, 1.0).unwrap();
        canvas.fill(Color::BLACK);
        canvas.fill(Color::TRANSPARENT);
        assert_eq!(canvas.pixel(0, 0), Some(Color::BLACK));
    }

    #[test]
    fn provider_refuses_oversized_and_empty() {
        let provider = BitmapCanvasProvider::new(100);
        assert!(provider.begin(Size::new(10.0, 10.0), true, 1.0).is_some());
        assert!(provider.begin(Size::new(11.0, 10.0), true, 1.0).is_none());
        assert!(provider.begin(Size::ZERO, true, 1.0).is_none());
    }

    #[test]
    fn rendered_image_clones_share_pixels() {
        let image = Canvas::new(Size::new(1.0, 1.0), true, 1.0).unwrap().into_image();
        let copy = image.clone();
        assert!(image.ptr_eq(&copy));
    }
}
