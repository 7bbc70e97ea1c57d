//! Core types and data structures for the Wayland client.
//!
//! `WallpaperDaemon` is the dispatch state handed to every protocol handler;
//! `SurfaceData` holds the protocol objects behind one output's wallpaper.

use anyhow::Error;
use smithay_client_toolkit::{output::OutputState, registry::RegistryState, shell::wlr_layer::LayerSurface};
use wayland_protocols::wp::{
    fractional_scale::v1::client::wp_fractional_scale_v1, viewporter::client::wp_viewport,
};

use super::backend::WaylandBackend;
use crate::buffer::ShmBuffer;
use crate::decoder::FileDecoder;
use crate::reconciler::Reconciler;

/// Main Wayland client state.
pub struct WallpaperDaemon {
    pub(super) registry_state: RegistryState,
    pub(super) output_state: OutputState,
    pub(super) backend: WaylandBackend,
    pub(super) reconciler: Reconciler,
    pub(super) loader: FileDecoder,
    /// First fatal error raised inside a protocol handler.
    pub(super) fatal: Option<Error>,
}

/// Per-output surface objects.
pub struct SurfaceData {
    pub(super) layer_surface: LayerSurface,
    pub(super) viewport: Option<wp_viewport::WpViewport>,
    pub(super) fractional_scale: Option<wp_fractional_scale_v1::WpFractionalScaleV1>,
    /// The buffer currently attached.
    pub(super) buffer: Option<ShmBuffer>,
    /// Superseded buffers the compositor may still be reading.
    pub(super) retired: Vec<ShmBuffer>,
}

impl SurfaceData {
    pub(super) fn new(
        layer_surface: LayerSurface,
        viewport: Option<wp_viewport::WpViewport>,
        fractional_scale: Option<wp_fractional_scale_v1::WpFractionalScaleV1>,
    ) -> Self {
        Self {
            layer_surface,
            viewport,
            fractional_scale,
            buffer: None,
            retired: Vec::new(),
        }
    }

    /// Make `new_buffer` current, parking the old one until it is released.
    pub(super) fn swap_buffer(&mut self, new_buffer: ShmBuffer) {
        if let Some(old_buffer) = self.buffer.replace(new_buffer) {
            self.retired.push(old_buffer);
            log::debug!("Parked old buffer ({} awaiting release)", self.retired.len());
        }
    }

    /// Drop parked buffers the compositor has released.
    pub(super) fn collect_released(&mut self) {
        let before = self.retired.len();
        self.retired.retain(|buffer| !buffer.is_released());

        let dropped = before - self.retired.len();
        if dropped > 0 {
            log::debug!(
                "Dropped {} released buffer(s) ({} still busy)",
                dropped,
                self.retired.len()
            );
        }
    }
}

impl Drop for SurfaceData {
    fn drop(&mut self) {
        if let Some(fractional_scale) = self.fractional_scale.take() {
            fractional_scale.destroy();
        }
        if let Some(viewport) = self.viewport.take() {
            viewport.destroy();
        }
    }
}
