//! [`DisplayBackend`] implementation on top of a live Wayland connection.

use anyhow::{Context, Result};
use common::Color;
use smithay_client_toolkit::{
    compositor::CompositorState,
    shell::{WaylandSurface, wlr_layer::LayerShell},
    shm::Shm,
};
use std::collections::HashMap;
use wayland_client::{
    QueueHandle,
    protocol::{wl_output, wl_shm},
};
use wayland_protocols::wp::{
    fractional_scale::v1::client::wp_fractional_scale_manager_v1,
    single_pixel_buffer::v1::client::wp_single_pixel_buffer_manager_v1,
    viewporter::client::wp_viewporter,
};

use super::types::{SurfaceData, WallpaperDaemon};
use crate::buffer::{PixelFormat, ReleaseFlag, ShmBuffer};
use crate::output::{Capabilities, OutputId, RenderTarget, SurfaceScale};
use crate::reconciler::DisplayBackend;

pub struct WaylandBackend {
    pub(super) qh: QueueHandle<WallpaperDaemon>,
    pub(super) compositor_state: CompositorState,
    pub(super) layer_shell: LayerShell,
    pub(super) shm: Shm,
    pub(super) viewporter: Option<wp_viewporter::WpViewporter>,
    pub(super) fractional_scale_manager:
        Option<wp_fractional_scale_manager_v1::WpFractionalScaleManagerV1>,
    pub(super) single_pixel_manager:
        Option<wp_single_pixel_buffer_manager_v1::WpSinglePixelBufferManagerV1>,
    pub(super) wl_outputs: HashMap<OutputId, wl_output::WlOutput>,
    pub(super) surfaces: HashMap<OutputId, SurfaceData>,
}

impl WaylandBackend {
    /// The output whose layer surface owns `surface`.
    pub(super) fn owner_of(&self, surface: &wayland_client::protocol::wl_surface::WlSurface) -> Option<OutputId> {
        self.surfaces
            .iter()
            .find(|(_, data)| data.layer_surface.wl_surface() == surface)
            .map(|(id, _)| *id)
    }

    pub(super) fn collect_released(&mut self) {
        for surface in self.surfaces.values_mut() {
            surface.collect_released();
        }
    }

    fn apply_scale(surface: &SurfaceData, target: &RenderTarget) {
        let wl_surface = surface.layer_surface.wl_surface();
        match target.scale {
            SurfaceScale::Integer(scale) => {
                wl_surface.set_buffer_scale(scale);
                if let Some(viewport) = &surface.viewport {
                    viewport.set_destination(-1, -1);
                }
            }
            SurfaceScale::Fractional(_) => {
                wl_surface.set_buffer_scale(1);
                if let Some(viewport) = &surface.viewport {
                    viewport.set_destination(target.logical_size.0 as i32, target.logical_size.1 as i32);
                }
            }
        }
    }
}

impl DisplayBackend for WaylandBackend {
    type Buffer = ShmBuffer;

    fn capabilities(&self) -> Capabilities {
        let viewport = self.viewporter.is_some();
        Capabilities {
            single_pixel: viewport && self.single_pixel_manager.is_some(),
            fractional_scale: viewport && self.fractional_scale_manager.is_some(),
            deep_color: self.shm.formats().contains(&wl_shm::Format::Xrgb2101010),
        }
    }

    fn create_surface(&mut self, id: OutputId) -> Result<()> {
        let output = self
            .wl_outputs
            .get(&id)
            .with_context(|| format!("No wl_output for output {}", id))?
            .clone();

        let layer_surface = super::outputs::create_layer_surface(self, &output)?;

        let viewport = self
            .viewporter
            .as_ref()
            .map(|viewporter| viewporter.get_viewport(layer_surface.wl_surface(), &self.qh, ()));

        let fractional_scale = match (&self.fractional_scale_manager, &viewport) {
            (Some(manager), Some(_)) => {
                Some(manager.get_fractional_scale(layer_surface.wl_surface(), &self.qh, id))
            }
            _ => None,
        };

        layer_surface.commit();

        self.surfaces
            .insert(id, SurfaceData::new(layer_surface, viewport, fractional_scale));
        log::info!("Created layer surface for output {}", id);
        Ok(())
    }

    fn ack_configure(&mut self, id: OutputId, serial: u32) {
        // The layer shell delegate acks each configure before our handler
        // sees it, so nothing is left to send here.
        log::trace!("Configure {} for output {} acknowledged", serial, id);
    }

    fn allocate(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<ShmBuffer> {
        ShmBuffer::new(self.shm.wl_shm(), width, height, format, &self.qh)
    }

    fn commit_buffer(&mut self, id: OutputId, buffer: ShmBuffer, target: &RenderTarget) {
        let Some(surface) = self.surfaces.get_mut(&id) else {
            log::warn!("No surface for output {}, dropping buffer", id);
            return;
        };

        Self::apply_scale(surface, target);

        let wl_surface = surface.layer_surface.wl_surface();
        wl_surface.attach(Some(buffer.buffer()), 0, 0);
        wl_surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        wl_surface.commit();

        buffer.mark_busy();
        surface.swap_buffer(buffer);
    }

    fn commit_solid_color(&mut self, id: OutputId, color: Color, target: &RenderTarget) {
        let (Some(surface), Some(manager)) = (self.surfaces.get_mut(&id), &self.single_pixel_manager)
        else {
            log::warn!("Cannot commit a single-pixel buffer to output {}", id);
            return;
        };
        let Some(viewport) = &surface.viewport else {
            log::warn!("Output {} has no viewport", id);
            return;
        };

        let widen = |channel: u8| channel as u32 * (u32::MAX / 0xff);
        let [r, g, b, a] = color.premultiplied();
        let buffer = manager.create_u32_rgba_buffer(
            widen(r),
            widen(g),
            widen(b),
            widen(a),
            &self.qh,
            ReleaseFlag::default(),
        );

        let wl_surface = surface.layer_surface.wl_surface();
        wl_surface.set_buffer_scale(1);
        wl_surface.attach(Some(&buffer), 0, 0);
        wl_surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        viewport.set_destination(target.logical_size.0 as i32, target.logical_size.1 as i32);
        wl_surface.commit();

        // The surface keeps its contents after the buffer object is gone.
        buffer.destroy();

        // Any shm buffer attached before is now superseded.
        if let Some(old_buffer) = surface.buffer.take() {
            surface.retired.push(old_buffer);
        }
    }

    fn commit_scale(&mut self, id: OutputId, target: &RenderTarget) {
        let Some(surface) = self.surfaces.get(&id) else {
            return;
        };
        Self::apply_scale(surface, target);
        surface.layer_surface.wl_surface().commit();
    }

    fn destroy_surface(&mut self, id: OutputId) {
        if self.surfaces.remove(&id).is_some() {
            log::info!("Destroyed layer surface for output {}", id);
        }
    }
}
