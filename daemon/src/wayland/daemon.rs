use anyhow::{Context, Result};
use common::ConfigSet;
use smithay_client_toolkit::{
    compositor::CompositorState, output::OutputState, registry::RegistryState,
    shell::wlr_layer::LayerShell, shm::Shm,
};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wayland_client::{
    Connection, DispatchError, EventQueue, backend::WaylandError, globals::registry_queue_init,
};

use super::backend::WaylandBackend;
use super::types::WallpaperDaemon;
use crate::decoder::FileDecoder;
use crate::log_and_continue;
use crate::reconciler::Reconciler;

/// How long one wait for compositor events may block before the shutdown
/// flag is checked again.
const POLL_TIMEOUT_MS: i32 = 100;

/// Main entry point for the Wayland client
pub async fn run(configs: ConfigSet, shutdown: Arc<AtomicBool>) -> Result<()> {
    log::info!("Connecting to Wayland compositor...");

    // Wayland dispatch is synchronous, keep it off the async workers
    tokio::task::spawn_blocking(move || run_blocking(configs, shutdown)).await?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Disconnected,
}

fn run_blocking(configs: ConfigSet, shutdown: Arc<AtomicBool>) -> Result<()> {
    let conn = Connection::connect_to_env().context(
        "Unable to connect to the compositor. If your compositor is running, check or set the WAYLAND_DISPLAY environment variable.",
    )?;
    let (globals, mut event_queue) =
        registry_queue_init(&conn).context("Failed to initialize the Wayland registry")?;
    let qh = event_queue.handle();

    let compositor_state = CompositorState::bind(&globals, &qh)
        .context("Missing a required Wayland interface: wl_compositor")?;
    let shm = Shm::bind(&globals, &qh).context("Missing a required Wayland interface: wl_shm")?;
    let layer_shell = LayerShell::bind(&globals, &qh)
        .context("Missing a required Wayland interface: zwlr_layer_shell_v1")?;

    let backend = WaylandBackend {
        qh: qh.clone(),
        compositor_state,
        layer_shell,
        shm,
        viewporter: globals.bind(&qh, 1..=1, ()).ok(),
        fractional_scale_manager: globals.bind(&qh, 1..=1, ()).ok(),
        single_pixel_manager: globals.bind(&qh, 1..=1, ()).ok(),
        wl_outputs: HashMap::new(),
        surfaces: HashMap::new(),
    };

    log::info!(
        "Optional protocols: viewporter={} fractional-scale={} single-pixel-buffer={}",
        backend.viewporter.is_some(),
        backend.fractional_scale_manager.is_some(),
        backend.single_pixel_manager.is_some()
    );

    let mut app_data = WallpaperDaemon {
        registry_state: RegistryState::new(&globals),
        output_state: OutputState::new(&globals, &qh),
        backend,
        reconciler: Reconciler::new(configs),
        loader: FileDecoder,
        fatal: None,
    };

    log::info!("Connected to Wayland compositor");

    // Initial roundtrip to get outputs and create layer surfaces
    event_queue.roundtrip(&mut app_data)?;
    log::info!(
        "Found {} output(s)",
        app_data.output_state.outputs().count()
    );

    loop {
        if let Some(e) = app_data.fatal.take() {
            return Err(e);
        }

        let stats = app_data
            .reconciler
            .redraw(&mut app_data.backend, &app_data.loader)?;
        if stats.committed + stats.rescaled > 0 {
            log::debug!("Redraw pass: {:?}", stats);
        }

        app_data.backend.collect_released();

        if shutdown.load(Ordering::Relaxed) {
            log::info!("Shutdown requested");
            break;
        }

        match wait_for_events(&mut event_queue, &mut app_data)? {
            Flow::Continue => {}
            Flow::Disconnected => {
                log::info!("Compositor closed the connection");
                return Ok(());
            }
        }
    }

    log::info!("Exiting Wayland event loop");
    app_data.reconciler.shutdown(&mut app_data.backend);
    log_and_continue!(event_queue.flush(), "flush final requests");

    Ok(())
}

/// Flush requests, wait up to [`POLL_TIMEOUT_MS`] for the compositor, then
/// dispatch whatever arrived.
fn wait_for_events(
    event_queue: &mut EventQueue<WallpaperDaemon>,
    app_data: &mut WallpaperDaemon,
) -> Result<Flow> {
    if let Err(e) = event_queue.flush() {
        return disconnected_or(e);
    }

    if let Some(guard) = event_queue.prepare_read() {
        let readable = poll_readable(guard.connection_fd().as_raw_fd(), POLL_TIMEOUT_MS)
            .context("Failed to wait for Wayland events")?;

        if readable {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return disconnected_or(e),
            }
        }
    }

    match event_queue.dispatch_pending(app_data) {
        Ok(_) => Ok(Flow::Continue),
        Err(DispatchError::Backend(e)) => disconnected_or(e),
        Err(e) => Err(e).context("Failed to dispatch Wayland events"),
    }
}

/// A closed socket ends the session normally; anything else is fatal.
fn disconnected_or(error: WaylandError) -> Result<Flow> {
    match &error {
        WaylandError::Io(e)
            if matches!(
                e.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof
            ) =>
        {
            Ok(Flow::Disconnected)
        }
        _ => Err(error).context("Wayland connection error"),
    }
}

fn poll_readable(fd: RawFd, timeout_ms: i32) -> std::io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    // The descriptor stays open for the duration of the call.
    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(ret > 0)
}
