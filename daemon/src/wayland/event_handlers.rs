use smithay_client_toolkit::{
    compositor::CompositorHandler,
    delegate_compositor, delegate_layer, delegate_output, delegate_registry, delegate_shm,
    output::{OutputHandler, OutputState},
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::{
        WaylandSurface,
        wlr_layer::{LayerShellHandler, LayerSurface, LayerSurfaceConfigure},
    },
    shm::{Shm, ShmHandler},
};
use wayland_client::{
    Connection, Dispatch, QueueHandle, delegate_noop,
    protocol::{wl_buffer, wl_output, wl_shm_pool, wl_surface},
};
use wayland_protocols::wp::{
    fractional_scale::v1::client::{wp_fractional_scale_manager_v1, wp_fractional_scale_v1},
    single_pixel_buffer::v1::client::wp_single_pixel_buffer_manager_v1,
    viewporter::client::{wp_viewport, wp_viewporter},
};

use super::WallpaperDaemon;
use super::outputs::{forward_output_info, output_id};
use crate::buffer::ReleaseFlag;
use crate::output::OutputId;
use crate::reconciler::OutputEvent;

impl WallpaperDaemon {
    /// Hand an event to the reconciler, keeping the first fatal error.
    pub(super) fn dispatch(&mut self, id: OutputId, event: OutputEvent) {
        if let Err(e) = self.reconciler.handle(id, event, &mut self.backend) {
            log::error!("{:#}", e);
            self.fatal.get_or_insert(e);
        }
    }

    fn layer_owner(&self, layer: &LayerSurface) -> Option<OutputId> {
        self.backend.owner_of(layer.wl_surface())
    }
}

impl CompositorHandler for WallpaperDaemon {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        new_factor: i32,
    ) {
        if let Some(id) = self.backend.owner_of(surface) {
            self.dispatch(id, OutputEvent::Scale(new_factor));
        }
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for WallpaperDaemon {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        let id = output_id(&output);
        log::info!("New output {} detected", id);

        self.backend.wl_outputs.insert(id, output.clone());
        self.dispatch(id, OutputEvent::Announced);
        forward_output_info(self, &output);
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        forward_output_info(self, &output);
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        let id = output_id(&output);
        log::info!("Output {} destroyed", id);
        self.dispatch(id, OutputEvent::Removed);
        self.backend.wl_outputs.remove(&id);
    }
}

impl LayerShellHandler for WallpaperDaemon {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        if let Some(id) = self.layer_owner(layer) {
            log::info!("Layer surface for output {} closed", id);
            self.dispatch(id, OutputEvent::Closed);
        }
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        serial: u32,
    ) {
        let Some(id) = self.layer_owner(layer) else {
            log::warn!("Configure for an unknown layer surface");
            return;
        };

        let (width, height) = configure.new_size;
        self.dispatch(
            id,
            OutputEvent::Configure {
                serial,
                width,
                height,
            },
        );
    }
}

impl ProvidesRegistryState for WallpaperDaemon {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }

    registry_handlers![OutputState];
}

impl ShmHandler for WallpaperDaemon {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.backend.shm
    }
}

impl Dispatch<wl_buffer::WlBuffer, ReleaseFlag> for WallpaperDaemon {
    fn event(
        _state: &mut Self,
        _proxy: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        data: &ReleaseFlag,
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            data.set_released();
            log::trace!("Buffer released by compositor");
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for WallpaperDaemon {
    fn event(
        _state: &mut Self,
        _proxy: &wl_shm_pool::WlShmPool,
        _event: wl_shm_pool::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        // wl_shm_pool has no events
    }
}

impl Dispatch<wp_fractional_scale_v1::WpFractionalScaleV1, OutputId> for WallpaperDaemon {
    fn event(
        state: &mut Self,
        _proxy: &wp_fractional_scale_v1::WpFractionalScaleV1,
        event: wp_fractional_scale_v1::Event,
        id: &OutputId,
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
        if let wp_fractional_scale_v1::Event::PreferredScale { scale } = event {
            state.dispatch(*id, OutputEvent::PreferredScale(scale));
        }
    }
}

delegate_compositor!(WallpaperDaemon);
delegate_output!(WallpaperDaemon);
delegate_layer!(WallpaperDaemon);
delegate_shm!(WallpaperDaemon);
delegate_registry!(WallpaperDaemon);
delegate_noop!(WallpaperDaemon: wp_viewporter::WpViewporter);
delegate_noop!(WallpaperDaemon: wp_viewport::WpViewport);
delegate_noop!(WallpaperDaemon: wp_fractional_scale_manager_v1::WpFractionalScaleManagerV1);
delegate_noop!(WallpaperDaemon: wp_single_pixel_buffer_manager_v1::WpSinglePixelBufferManagerV1);
