//! Places a decoded image on an output-sized canvas.

use anyhow::{Context, Result};
use common::{BackgroundMode, Color};
use fast_image_resize as fr;
use rayon::prelude::*;
use std::borrow::Cow;

use crate::decoder::DecodedBitmap;

/// A premultiplied RGBA drawing surface the size of an output buffer.
#[derive(Debug, Clone)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    /// A fully transparent canvas.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    pub fn fill(&mut self, color: Color) {
        let px = color.premultiplied();
        self.pixels
            .par_chunks_exact_mut(4)
            .for_each(|dst| dst.copy_from_slice(&px));
    }

    fn row_len(&self) -> usize {
        self.width as usize * 4
    }
}

/// Which destination axis a uniform scale was chosen to match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Width,
    Height,
}

/// Where the image lands on the destination, in destination pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub scale_x: f64,
    pub scale_y: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Set for the uniformly scaled modes.
    pub matched: Option<Axis>,
}

impl Placement {
    /// Compute the placement of an `image` sized bitmap on a `dest` sized
    /// buffer. `None` for modes that do not position a single copy of the
    /// image (`tile` and `solid_color`).
    pub fn for_mode(mode: BackgroundMode, image: (u32, u32), dest: (u32, u32)) -> Option<Self> {
        let (w, h) = (image.0 as f64, image.1 as f64);
        let (dw, dh) = (dest.0 as f64, dest.1 as f64);

        // Compares dest.0 / dest.1 against image.0 / image.1 without rounding.
        let dest_is_wider = dest.0 as u64 * image.1 as u64 > image.0 as u64 * dest.1 as u64;

        let placement = match mode {
            BackgroundMode::Stretch => Self {
                scale_x: dw / w,
                scale_y: dh / h,
                x: 0.0,
                y: 0.0,
                width: dw,
                height: dh,
                matched: None,
            },
            BackgroundMode::Fill if dest_is_wider => Self::matching_width(image, dest),
            BackgroundMode::Fill => Self::matching_height(image, dest),
            BackgroundMode::Fit if dest_is_wider => Self::matching_height(image, dest),
            BackgroundMode::Fit => Self::matching_width(image, dest),
            BackgroundMode::Center => Self {
                scale_x: 1.0,
                scale_y: 1.0,
                x: (dest.0 as i64 - image.0 as i64).div_euclid(2) as f64,
                y: (dest.1 as i64 - image.1 as i64).div_euclid(2) as f64,
                width: w,
                height: h,
                matched: None,
            },
            BackgroundMode::Tile | BackgroundMode::SolidColor => return None,
        };

        Some(placement)
    }

    fn matching_width(image: (u32, u32), dest: (u32, u32)) -> Self {
        let scale = dest.0 as f64 / image.0 as f64;
        let width = dest.0 as f64;
        let height = image.1 as f64 * dest.0 as f64 / image.0 as f64;
        Self {
            scale_x: scale,
            scale_y: scale,
            x: 0.0,
            y: (dest.1 as f64 - height) / 2.0,
            width,
            height,
            matched: Some(Axis::Width),
        }
    }

    fn matching_height(image: (u32, u32), dest: (u32, u32)) -> Self {
        let scale = dest.1 as f64 / image.1 as f64;
        let width = image.0 as f64 * dest.1 as f64 / image.1 as f64;
        let height = dest.1 as f64;
        Self {
            scale_x: scale,
            scale_y: scale,
            x: (dest.0 as f64 - width) / 2.0,
            y: 0.0,
            width,
            height,
            matched: Some(Axis::Height),
        }
    }
}

/// Paint one output's wallpaper onto `canvas`.
///
/// The background color goes down first (except for `tile`, which covers
/// the whole canvas), then the image is composited over it. Without an
/// image only the color is painted.
pub fn composite(
    canvas: &mut Canvas,
    source: Option<&DecodedBitmap>,
    mode: BackgroundMode,
    background: Option<Color>,
) -> Result<()> {
    let source = source.filter(|_| mode != BackgroundMode::SolidColor);

    match source {
        Some(_) if mode == BackgroundMode::Tile => {}
        _ => canvas.fill(background.unwrap_or(Color::TRANSPARENT)),
    }

    let Some(source) = source else {
        return Ok(());
    };
    if canvas.width == 0 || canvas.height == 0 {
        return Ok(());
    }

    if mode == BackgroundMode::Tile {
        tile(canvas, source);
        return Ok(());
    }

    let Some(placement) = Placement::for_mode(
        mode,
        (source.width(), source.height()),
        (canvas.width, canvas.height),
    ) else {
        return Ok(());
    };

    if mode == BackgroundMode::Center {
        blend_over(
            canvas,
            source.pixels(),
            source.width(),
            source.height(),
            placement.x as i64,
            placement.y as i64,
        );
        return Ok(());
    }

    // Only the part of the scaled image that lands on the canvas is resampled.
    let x0 = placement.x.round().max(0.0) as u32;
    let y0 = placement.y.round().max(0.0) as u32;
    let x1 = ((placement.x + placement.width).round() as u32).min(canvas.width);
    let y1 = ((placement.y + placement.height).round() as u32).min(canvas.height);
    if x1 <= x0 || y1 <= y0 {
        return Ok(());
    }
    let (out_w, out_h) = (x1 - x0, y1 - y0);

    let src_w = source.width() as f64;
    let src_h = source.height() as f64;
    let left = ((x0 as f64 - placement.x) / placement.scale_x).clamp(0.0, src_w);
    let top = ((y0 as f64 - placement.y) / placement.scale_y).clamp(0.0, src_h);
    let crop_w = (out_w as f64 / placement.scale_x).min(src_w - left);
    let crop_h = (out_h as f64 / placement.scale_y).min(src_h - top);

    let scaled = resample(source, (left, top, crop_w, crop_h), (out_w, out_h))?;
    blend_over(canvas, &scaled, out_w, out_h, x0 as i64, y0 as i64);

    Ok(())
}

/// Bilinear resample of a cropped region of `source` to `size`.
fn resample<'a>(
    source: &'a DecodedBitmap,
    crop: (f64, f64, f64, f64),
    size: (u32, u32),
) -> Result<Cow<'a, [u8]>> {
    let (left, top, crop_w, crop_h) = crop;
    let untouched = left == 0.0
        && top == 0.0
        && crop_w == source.width() as f64
        && crop_h == source.height() as f64
        && size == (source.width(), source.height());
    if untouched {
        return Ok(Cow::Borrowed(source.pixels()));
    }

    let src = fr::images::ImageRef::new(
        source.width(),
        source.height(),
        source.pixels(),
        fr::PixelType::U8x4,
    )
    .context("Failed to wrap source image")?;

    let mut dst = fr::images::Image::new(size.0, size.1, fr::PixelType::U8x4);

    // Pixels are already premultiplied.
    let options = fr::ResizeOptions::new()
        .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear))
        .use_alpha(false)
        .crop(left, top, crop_w, crop_h);

    fr::Resizer::new()
        .resize(&src, &mut dst, &options)
        .context("Failed to resize image")?;

    Ok(Cow::Owned(dst.into_vec()))
}

/// Source-over blend of a premultiplied image with its top-left corner at
/// `(x, y)`. Parts outside the canvas are clipped.
fn blend_over(canvas: &mut Canvas, src: &[u8], src_w: u32, src_h: u32, x: i64, y: i64) {
    let canvas_w = canvas.width as i64;
    let canvas_h = canvas.height as i64;

    let x_start = x.max(0);
    let x_end = (x + src_w as i64).min(canvas_w);
    let y_start = y.max(0);
    let y_end = (y + src_h as i64).min(canvas_h);
    if x_start >= x_end || y_start >= y_end {
        return;
    }

    let src_stride = src_w as usize * 4;
    let row_len = canvas.row_len();
    let span = (x_end - x_start) as usize * 4;
    let src_x = (x_start - x) as usize * 4;
    let dst_x = x_start as usize * 4;

    canvas
        .pixels
        .par_chunks_exact_mut(row_len)
        .enumerate()
        .skip(y_start as usize)
        .take((y_end - y_start) as usize)
        .for_each(|(row, dst_row)| {
            let src_row = (row as i64 - y) as usize;
            let src = &src[src_row * src_stride + src_x..][..span];
            let dst = &mut dst_row[dst_x..dst_x + span];

            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                over(d, s);
            }
        });
}

#[inline]
fn over(dst: &mut [u8], src: &[u8]) {
    match src[3] {
        255 => dst.copy_from_slice(src),
        0 => {}
        alpha => {
            let inv = 255 - alpha as u32;
            for i in 0..4 {
                let blended = src[i] as u32 + (dst[i] as u32 * inv + 127) / 255;
                dst[i] = blended.min(255) as u8;
            }
        }
    }
}

/// Repeat the image from the top-left corner across the whole canvas.
fn tile(canvas: &mut Canvas, source: &DecodedBitmap) {
    let src_w = source.width() as usize;
    let src_h = source.height();
    let row_len = canvas.row_len();

    canvas
        .pixels
        .par_chunks_exact_mut(row_len)
        .enumerate()
        .for_each(|(y, dst_row)| {
            let src_row = source.row(y as u32 % src_h);
            for (x, dst) in dst_row.chunks_exact_mut(4).enumerate() {
                let sx = (x % src_w) * 4;
                dst.copy_from_slice(&src_row[sx..sx + 4]);
            }
        });
}
