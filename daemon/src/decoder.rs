//! Image decoding.
//!
//! Every supported source format ends up as a [`DecodedBitmap`]: tightly
//! packed, premultiplied 8-bit RGBA plus the CICP color description when the
//! file carries one.

use common::{Cicp, premultiply};
use image::{DynamicImage, ImageFormat};
use rayon::prelude::*;
use resvg::{tiny_skia, usvg};
use std::path::{Path, PathBuf};
use thiserror::Error;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Chunks whose color information is superseded by cICP.
const PNG_COLOR_CHUNKS: [&[u8; 4]; 4] = [b"iCCP", b"sRGB", b"gAMA", b"cHRM"];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognized image format: {}", .0.display())]
    UnknownFormat(PathBuf),

    #[error("failed to decode {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("unsupported pixel layout in {}: {detail}", path.display())]
    Layout { path: PathBuf, detail: String },

    #[error("invalid bitmap from {}: {source}", path.display())]
    Bitmap {
        path: PathBuf,
        #[source]
        source: BitmapError,
    },
}

/// Pixel data that does not describe a valid bitmap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitmapError {
    #[error("empty image ({width}x{height})")]
    Empty { width: u32, height: u32 },

    #[error("pixel buffer holds {len} bytes, {width}x{height} needs {expected}")]
    Size {
        len: usize,
        width: u32,
        height: u32,
        expected: usize,
    },
}

/// A decoded image in premultiplied RGBA order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBitmap {
    width: u32,
    height: u32,
    stride: usize,
    pixels: Vec<u8>,
    cicp: Option<Cicp>,
}

impl DecodedBitmap {
    /// Wrap already premultiplied, tightly packed RGBA rows.
    pub fn from_premultiplied(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        cicp: Option<Cicp>,
    ) -> Result<Self, BitmapError> {
        if width == 0 || height == 0 {
            return Err(BitmapError::Empty { width, height });
        }

        let stride = width as usize * 4;
        let expected = stride * height as usize;
        if pixels.len() != expected {
            return Err(BitmapError::Size {
                len: pixels.len(),
                width,
                height,
                expected,
            });
        }

        Ok(Self {
            width,
            height,
            stride,
            pixels,
            cicp,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn cicp(&self) -> Option<Cicp> {
        self.cicp
    }

    /// One row of pixels, `y` must be below `height`.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.pixels[start..start + self.width as usize * 4]
    }
}

/// Source of decoded images. The renderer decodes through this so tests can
/// count and fake loads.
pub trait ImageLoader: Sync {
    fn load(&self, path: &Path) -> Result<DecodedBitmap, DecodeError>;
}

/// Decodes images from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDecoder;

impl ImageLoader for FileDecoder {
    fn load(&self, path: &Path) -> Result<DecodedBitmap, DecodeError> {
        decode(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Png,
    Svg,
    Raster(ImageFormat),
}

/// Decode the file at `path`, choosing the decoder from its content first and
/// its extension second.
pub fn decode(path: &Path) -> Result<DecodedBitmap, DecodeError> {
    let data = std::fs::read(path).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match sniff(path, &data) {
        Some(SourceKind::Png) => decode_png(path, &data),
        Some(SourceKind::Svg) => decode_svg(path, &data),
        Some(SourceKind::Raster(format)) => {
            let image = image::load_from_memory_with_format(&data, format)
                .map_err(|e| malformed(path, e))?;
            finish(path, image, None)
        }
        None => Err(DecodeError::UnknownFormat(path.to_path_buf())),
    }
}

fn sniff(path: &Path, data: &[u8]) -> Option<SourceKind> {
    if data.starts_with(&PNG_SIGNATURE) {
        return Some(SourceKind::Png);
    }
    if let Ok(format) = image::guess_format(data) {
        return Some(SourceKind::Raster(format));
    }

    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

    if matches!(extension.as_deref(), Some("svg" | "svgz")) || looks_like_svg(data) {
        return Some(SourceKind::Svg);
    }

    extension
        .and_then(ImageFormat::from_extension)
        .map(SourceKind::Raster)
}

fn looks_like_svg(data: &[u8]) -> bool {
    let head = &data[..data.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}

fn malformed(path: &Path, err: impl std::fmt::Display) -> DecodeError {
    DecodeError::Malformed {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn decode_png(path: &Path, data: &[u8]) -> Result<DecodedBitmap, DecodeError> {
    let color = scan_png_color_chunks(data).map_err(|message| DecodeError::Malformed {
        path: path.to_path_buf(),
        message,
    })?;

    if let Some(cicp) = color.cicp {
        log::debug!(
            "{}: cICP primaries={} transfer={} matrix={} range={}",
            path.display(),
            cicp.primaries,
            cicp.transfer,
            cicp.matrix,
            cicp.range
        );
        if !color.overridden.is_empty() {
            log::debug!(
                "{}: ignoring {} in favour of cICP",
                path.display(),
                color.overridden.join(", ")
            );
        }
    }

    let image = image::load_from_memory_with_format(data, ImageFormat::Png)
        .map_err(|e| malformed(path, e))?;
    finish(path, image, color.cicp)
}

#[derive(Debug, Default)]
struct PngColorInfo {
    cicp: Option<Cicp>,
    overridden: Vec<String>,
}

/// Walk the chunks ahead of the image data looking for color metadata.
fn scan_png_color_chunks(data: &[u8]) -> Result<PngColorInfo, String> {
    let mut info = PngColorInfo::default();
    let mut pos = PNG_SIGNATURE.len();

    while pos + 8 <= data.len() {
        let length = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let kind = &data[pos + 4..pos + 8];
        let body_start = pos + 8;
        let body_end = body_start
            .checked_add(length)
            .filter(|end| end + 4 <= data.len())
            .ok_or_else(|| format!("truncated {} chunk", String::from_utf8_lossy(kind)))?;
        let body = &data[body_start..body_end];

        match kind {
            b"cICP" => {
                if body.len() != 4 {
                    return Err(format!("cICP chunk has {} bytes, expected 4", body.len()));
                }
                info.cicp = Some(Cicp {
                    primaries: body[0],
                    transfer: body[1],
                    matrix: body[2],
                    range: body[3],
                });
            }
            b"IDAT" | b"IEND" => break,
            _ if PNG_COLOR_CHUNKS.iter().any(|chunk| chunk.as_slice() == kind) => {
                info.overridden.push(String::from_utf8_lossy(kind).into_owned());
            }
            _ => {}
        }

        pos = body_end + 4;
    }

    Ok(info)
}

fn decode_svg(path: &Path, data: &[u8]) -> Result<DecodedBitmap, DecodeError> {
    let mut options = usvg::Options {
        resources_dir: path.parent().map(Path::to_path_buf),
        ..usvg::Options::default()
    };
    options.fontdb_mut().load_system_fonts();

    let tree = usvg::Tree::from_data(data, &options).map_err(|e| malformed(path, e))?;
    let size = tree.size().to_int_size();

    let mut pixmap =
        tiny_skia::Pixmap::new(size.width(), size.height()).ok_or_else(|| DecodeError::Layout {
            path: path.to_path_buf(),
            detail: format!("cannot rasterize at {}x{}", size.width(), size.height()),
        })?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

    log::debug!(
        "Rasterized SVG {} at {}x{}",
        path.display(),
        size.width(),
        size.height()
    );

    // tiny-skia already stores premultiplied RGBA.
    DecodedBitmap::from_premultiplied(size.width(), size.height(), pixmap.take(), None)
        .map_err(|source| DecodeError::Bitmap {
            path: path.to_path_buf(),
            source,
        })
}

fn finish(path: &Path, image: DynamicImage, cicp: Option<Cicp>) -> Result<DecodedBitmap, DecodeError> {
    let source_color = image.color();
    let rgba = image.into_rgba8();

    let layout = rgba.sample_layout();
    if layout.channels != 4 || layout.channel_stride != 1 || layout.width_stride != 4 {
        return Err(DecodeError::Layout {
            path: path.to_path_buf(),
            detail: format!("{:?} did not convert to packed RGBA8", source_color),
        });
    }

    let (width, height) = rgba.dimensions();
    let mut pixels = rgba.into_raw();
    premultiply_in_place(&mut pixels);

    log::debug!(
        "Decoded {} ({}x{}, {:?})",
        path.display(),
        width,
        height,
        source_color
    );

    DecodedBitmap::from_premultiplied(width, height, pixels, cicp).map_err(|source| {
        DecodeError::Bitmap {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn premultiply_in_place(pixels: &mut [u8]) {
    pixels.par_chunks_exact_mut(4).for_each(|px| {
        let alpha = px[3];
        if alpha != 255 {
            px[0] = premultiply(px[0], alpha);
            px[1] = premultiply(px[1], alpha);
            px[2] = premultiply(px[2], alpha);
        }
    });
}
