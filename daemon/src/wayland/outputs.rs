use anyhow::{Context, Result};
use smithay_client_toolkit::{
    compositor::Region,
    output::OutputInfo,
    shell::wlr_layer::{Anchor, KeyboardInteractivity, Layer, LayerSurface},
};
use wayland_client::{Proxy, protocol::wl_output};

use super::backend::WaylandBackend;
use super::types::WallpaperDaemon;
use crate::output::OutputId;
use crate::reconciler::OutputEvent;

pub(super) fn output_id(output: &wl_output::WlOutput) -> OutputId {
    OutputId(output.id().protocol_id())
}

/// Create a background layer surface covering `output`. The caller commits it.
pub(super) fn create_layer_surface(
    backend: &WaylandBackend,
    output: &wl_output::WlOutput,
) -> Result<LayerSurface> {
    let surface = backend.compositor_state.create_surface(&backend.qh);

    // Pointer and touch input pass through to whatever is underneath.
    let input_region = Region::new(&backend.compositor_state).context("Failed to create input region")?;
    surface.set_input_region(Some(input_region.wl_region()));

    let layer_surface = backend.layer_shell.create_layer_surface(
        &backend.qh,
        surface,
        Layer::Background,
        Some("wallpaper"),
        Some(output),
    );

    layer_surface.set_size(0, 0);
    layer_surface.set_anchor(Anchor::all());
    layer_surface.set_exclusive_zone(-1);
    layer_surface.set_keyboard_interactivity(KeyboardInteractivity::None);

    Ok(layer_surface)
}

/// The metadata events carried by an output info snapshot, ending in `Done`.
pub(super) fn info_events(info: &OutputInfo) -> Vec<OutputEvent> {
    let mut events = Vec::with_capacity(4);
    if let Some(name) = &info.name {
        events.push(OutputEvent::Name(name.clone()));
    }
    if let Some(description) = &info.description {
        events.push(OutputEvent::Description(description.clone()));
    }
    events.push(OutputEvent::Scale(info.scale_factor));
    events.push(OutputEvent::Done);
    events
}

/// Feed the current metadata of `output` to the reconciler.
pub(super) fn forward_output_info(app_data: &mut WallpaperDaemon, output: &wl_output::WlOutput) {
    let id = output_id(output);
    let Some(info) = app_data.output_state.info(output) else {
        log::warn!("Output {} updated but no info available", id);
        return;
    };

    log::info!(
        "Output {}: {} ({}) scale {}",
        id,
        info.name.as_deref().unwrap_or("unnamed"),
        info.description.as_deref().unwrap_or("no description"),
        info.scale_factor
    );

    for event in info_events(&info) {
        app_data.dispatch(id, event);
    }
}
