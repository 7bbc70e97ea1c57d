use anyhow::Context;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wayland_client::protocol::{wl_buffer, wl_shm, wl_shm_pool};
use wayland_client::{Dispatch, QueueHandle};

use crate::compositor::Canvas;

/// Pixel layouts the renderer can write into a shared-memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8 bits per channel, little-endian `[b, g, r, a]` in memory.
    Argb8888,
    /// 10 bits per color channel, padding in the top two bits. Used for
    /// images that carry a CICP description.
    Xrgb2101010,
}

impl PixelFormat {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub fn wl_format(self) -> wl_shm::Format {
        match self {
            Self::Argb8888 => wl_shm::Format::Argb8888,
            Self::Xrgb2101010 => wl_shm::Format::Xrgb2101010,
        }
    }

    /// Write a premultiplied RGBA canvas into `dest`, whose rows are `stride`
    /// bytes apart.
    pub fn encode(self, canvas: &Canvas, dest: &mut [u8], stride: usize) {
        let row_len = canvas.width() as usize * Self::BYTES_PER_PIXEL;
        if row_len == 0 {
            return;
        }

        for (src_row, dst_row) in canvas
            .pixels()
            .chunks_exact(row_len)
            .zip(dest.chunks_mut(stride))
        {
            for (src, dst) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(4)) {
                dst.copy_from_slice(&self.encode_pixel([src[0], src[1], src[2], src[3]]));
            }
        }
    }

    fn encode_pixel(self, [r, g, b, a]: [u8; 4]) -> [u8; 4] {
        match self {
            Self::Argb8888 => [b, g, r, a],
            Self::Xrgb2101010 => {
                let widen = |v: u8| (v as u32 * 1023 + 127) / 255;
                (widen(r) << 20 | widen(g) << 10 | widen(b)).to_le_bytes()
            }
        }
    }
}

/// Memory the renderer can draw an output's wallpaper into.
pub trait PixelBuffer {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn stride(&self) -> usize;
    fn format(&self) -> PixelFormat;
    fn data_mut(&mut self) -> &mut [u8];
}

/// Set by the compositor's `release` event once it stops reading a buffer.
#[derive(Debug, Clone, Default)]
pub struct ReleaseFlag(Arc<AtomicBool>);

impl ReleaseFlag {
    pub fn set_released(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn mark_busy(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Helper for creating and managing shared memory buffers for Wayland
pub struct ShmBuffer {
    pool: wl_shm_pool::WlShmPool,
    buffer: wl_buffer::WlBuffer,
    mmap: memmap2::MmapMut,
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
    release: ReleaseFlag,
}

impl ShmBuffer {
    pub fn new<D>(
        shm: &wl_shm::WlShm,
        width: u32,
        height: u32,
        format: PixelFormat,
        qh: &QueueHandle<D>,
    ) -> anyhow::Result<Self>
    where
        D: Dispatch<wl_shm_pool::WlShmPool, ()> + Dispatch<wl_buffer::WlBuffer, ReleaseFlag> + 'static,
    {
        let stride = width as usize * PixelFormat::BYTES_PER_PIXEL;
        let size = stride
            .checked_mul(height as usize)
            .filter(|size| *size > 0 && *size <= i32::MAX as usize)
            .with_context(|| format!("Cannot allocate a {}x{} buffer", width, height))?;

        let file = tempfile::tempfile().context("Failed to create shared memory file")?;
        file.set_len(size as u64)?;

        // The file is private to this process and sized above.
        let mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };

        let pool = shm.create_pool(file.as_fd(), size as i32, qh, ());

        let release = ReleaseFlag::default();
        let buffer = pool.create_buffer(
            0,
            width as i32,
            height as i32,
            stride as i32,
            format.wl_format(),
            qh,
            release.clone(),
        );

        Ok(Self {
            pool,
            buffer,
            mmap,
            width,
            height,
            stride,
            format,
            release,
        })
    }

    pub fn buffer(&self) -> &wl_buffer::WlBuffer {
        &self.buffer
    }

    pub fn is_released(&self) -> bool {
        self.release.is_released()
    }

    /// Called once the buffer has been attached and committed.
    pub fn mark_busy(&self) {
        self.release.mark_busy();
    }
}

impl PixelBuffer for ShmBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
        self.pool.destroy();
    }
}
