//! Output reconciler.
//!
//! Turns output metadata and surface events into per-output state, and on
//! every redraw pass brings each dirty output's surface in line with its
//! configuration. Everything that talks to the compositor goes through
//! [`DisplayBackend`] so the state machine can be driven without one.

use anyhow::{Context, Result};
use common::{Color, ConfigMatch, ConfigSet, OutputConfig};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::buffer::{PixelBuffer, PixelFormat};
use crate::compositor::{self, Canvas};
use crate::decoder::{DecodedBitmap, ImageLoader};
use crate::image_source::{ImageId, ImageSources};
use crate::output::{
    BufferKind, Capabilities, CommitAction, Lifecycle, Output, OutputId, RenderTarget,
    identifier_from_description,
};

/// Everything the reconciler reacts to, tagged with the output it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A new output global appeared.
    Announced,
    Name(String),
    Description(String),
    Scale(i32),
    /// Preferred fractional scale in 120ths.
    PreferredScale(u32),
    /// The end of a batch of output metadata.
    Done,
    Configure {
        serial: u32,
        width: u32,
        height: u32,
    },
    /// The compositor closed the output's layer surface.
    Closed,
    /// The output global went away.
    Removed,
}

/// The compositor operations the reconciler needs.
pub trait DisplayBackend {
    type Buffer: PixelBuffer;

    fn capabilities(&self) -> Capabilities;

    /// Create the background layer surface for an output.
    fn create_surface(&mut self, id: OutputId) -> Result<()>;

    fn ack_configure(&mut self, id: OutputId, serial: u32);

    fn allocate(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<Self::Buffer>;

    /// Attach `buffer` at `target`'s scale and commit. The backend keeps the
    /// buffer alive until the compositor releases it.
    fn commit_buffer(&mut self, id: OutputId, buffer: Self::Buffer, target: &RenderTarget);

    /// Commit a single-pixel buffer of `color` stretched to the logical size.
    fn commit_solid_color(&mut self, id: OutputId, color: Color, target: &RenderTarget);

    /// Update the surface scale without attaching a new buffer.
    fn commit_scale(&mut self, id: OutputId, target: &RenderTarget);

    fn destroy_surface(&mut self, id: OutputId);
}

/// Counters for one redraw pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RedrawStats {
    pub decoded: usize,
    pub committed: usize,
    pub rescaled: usize,
    pub skipped: usize,
}

struct Plan {
    id: OutputId,
    config_index: usize,
    target: RenderTarget,
    action: CommitAction,
}

pub struct Reconciler {
    configs: ConfigSet,
    images: ImageSources,
    outputs: BTreeMap<OutputId, Output>,
}

impl Reconciler {
    pub fn new(configs: ConfigSet) -> Self {
        let images = ImageSources::from_configs(&configs);
        log::debug!(
            "{} output configuration(s) referencing {} distinct image(s)",
            configs.len(),
            images.len()
        );

        Self {
            configs,
            images,
            outputs: BTreeMap::new(),
        }
    }

    pub fn output(&self, id: OutputId) -> Option<&Output> {
        self.outputs.get(&id)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values()
    }

    /// Apply one event. Errors are fatal to the process.
    pub fn handle<B: DisplayBackend>(
        &mut self,
        id: OutputId,
        event: OutputEvent,
        backend: &mut B,
    ) -> Result<()> {
        if event == OutputEvent::Announced {
            self.outputs.entry(id).or_insert_with(|| Output::new(id));
            return Ok(());
        }

        let caps = backend.capabilities();
        let Some(output) = self.outputs.get_mut(&id) else {
            log::debug!("Ignoring {:?} for unknown output {}", event, id);
            return Ok(());
        };

        match event {
            OutputEvent::Announced => {}
            OutputEvent::Name(name) => {
                output.name = Some(name);
                rematch(output, &self.configs);
            }
            OutputEvent::Description(description) => {
                output.identifier = identifier_from_description(&description);
                rematch(output, &self.configs);
            }
            OutputEvent::Scale(scale) => {
                output.scale = scale;
                self.refresh(id, caps);
            }
            OutputEvent::PreferredScale(scale) => {
                output.preferred_scale = Some(scale);
                self.refresh(id, caps);
            }
            OutputEvent::Done => self.bind(id, backend)?,
            OutputEvent::Configure {
                serial,
                width,
                height,
            } => {
                log::debug!(
                    "Configured output {} at {}x{} (serial {})",
                    output.describe(),
                    width,
                    height,
                    serial
                );
                output.logical_size = (width, height);
                output.pending_serial = Some(serial);
                output.lifecycle = Lifecycle::Configured;
                output.dirty = true;
            }
            OutputEvent::Closed | OutputEvent::Removed => self.close(id, backend),
        }

        Ok(())
    }

    /// Mark an output dirty if its surface no longer matches its target.
    fn refresh(&mut self, id: OutputId, caps: Capabilities) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if output.lifecycle != Lifecycle::Configured {
            return;
        }
        let Some(config) = output.config.and_then(|m| self.configs.get(m.index)) else {
            return;
        };

        let target = output.target(config.mode, caps);
        if output.commit_action(&target) != CommitAction::Skip {
            output.dirty = true;
        }
    }

    fn bind<B: DisplayBackend>(&mut self, id: OutputId, backend: &mut B) -> Result<()> {
        let Some(output) = self.outputs.get_mut(&id) else {
            return Ok(());
        };

        let Some(found) = output.config else {
            log::debug!(
                "Could not find config for output {}, closing it",
                output.describe()
            );
            self.close(id, backend);
            return Ok(());
        };

        if output.lifecycle == Lifecycle::Unbound {
            if let Some(config) = self.configs.get(found.index) {
                log::debug!(
                    "Found config '{}' for output {} ({:?} match)",
                    config.selector,
                    output.describe(),
                    found.level
                );
            }
            backend
                .create_surface(id)
                .with_context(|| format!("Failed to create surface for output {}", output.describe()))?;
            output.lifecycle = Lifecycle::Bound;
        }

        Ok(())
    }

    fn close<B: DisplayBackend>(&mut self, id: OutputId, backend: &mut B) {
        if let Some(output) = self.outputs.remove(&id) {
            log::debug!("Destroying output {}", output.describe());
            if output.lifecycle != Lifecycle::Unbound {
                backend.destroy_surface(id);
            }
        }
    }

    /// One redraw pass over every dirty, configured output.
    ///
    /// Pending configures are acknowledged first, each distinct image
    /// needed by the pass is decoded once, and then each output is committed
    /// in turn.
    pub fn redraw<B, L>(&mut self, backend: &mut B, loader: &L) -> Result<RedrawStats>
    where
        B: DisplayBackend,
        L: ImageLoader,
    {
        let caps = backend.capabilities();
        let mut stats = RedrawStats::default();

        for output in self.outputs.values_mut() {
            if let Some(serial) = output.pending_serial.take() {
                backend.ack_configure(output.id, serial);
            }
        }

        let mut plans = Vec::new();
        let mut required = BTreeSet::new();

        for output in self.outputs.values() {
            if !output.dirty || output.lifecycle != Lifecycle::Configured {
                continue;
            }
            let Some(found) = output.config else {
                continue;
            };
            let Some(config) = self.configs.get(found.index) else {
                continue;
            };

            let target = output.target(config.mode, caps);
            let action = output.commit_action(&target);

            if action == CommitAction::Full && target.kind == BufferKind::Shm && !target.is_empty() {
                if let Some(image) = self.images.for_config(found.index) {
                    required.insert(image);
                }
            }

            plans.push(Plan {
                id: output.id,
                config_index: found.index,
                target,
                action,
            });
        }

        let bitmaps = self.decode(&required, loader);
        stats.decoded = bitmaps.len();

        for plan in plans {
            let Some(output) = self.outputs.get_mut(&plan.id) else {
                continue;
            };
            output.dirty = false;

            let Some(config) = self.configs.get(plan.config_index) else {
                continue;
            };

            match plan.action {
                CommitAction::Skip => stats.skipped += 1,
                CommitAction::ScaleOnly => {
                    log::debug!(
                        "Updating scale of output {} to {}",
                        output.describe(),
                        plan.target.scale
                    );
                    backend.commit_scale(plan.id, &plan.target);
                    output.committed = Some(plan.target);
                    stats.rescaled += 1;
                }
                CommitAction::Full => {
                    let bitmap = self
                        .images
                        .for_config(plan.config_index)
                        .and_then(|image| bitmaps.get(&image));

                    if paint(output, config, bitmap, &plan.target, caps, backend) {
                        output.committed = Some(plan.target);
                        stats.committed += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    fn decode<L: ImageLoader>(
        &self,
        required: &BTreeSet<ImageId>,
        loader: &L,
    ) -> HashMap<ImageId, DecodedBitmap> {
        required
            .par_iter()
            .filter_map(|&image| {
                let path = self.images.path(image);
                match loader.load(path) {
                    Ok(bitmap) => {
                        log::info!(
                            "Loaded image {} ({}x{})",
                            path.display(),
                            bitmap.width(),
                            bitmap.height()
                        );
                        Some((image, bitmap))
                    }
                    Err(e) => {
                        log::error!("Failed to load image {}: {}", path.display(), e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Destroy every surface.
    pub fn shutdown<B: DisplayBackend>(&mut self, backend: &mut B) {
        for (id, output) in std::mem::take(&mut self.outputs) {
            if output.lifecycle != Lifecycle::Unbound {
                backend.destroy_surface(id);
            }
        }
    }
}

/// Recompute the config an output matches from its name and identifier.
fn rematch(output: &mut Output, configs: &ConfigSet) {
    let found = configs.resolve(output.name.as_deref(), output.identifier.as_deref());
    if found.map(|m| m.index) == output.config.map(|m| m.index) {
        output.config = found;
        return;
    }

    if let Some(ConfigMatch { index, level }) = found
        && let Some(config) = configs.get(index)
    {
        log::debug!(
            "Output {} now matches '{}' ({:?})",
            output.describe(),
            config.selector,
            level
        );
    }

    output.config = found;
    if output.lifecycle == Lifecycle::Configured {
        output.committed = None;
        output.dirty = true;
    }
}

/// Render and commit one output. Returns whether something was committed.
fn paint<B: DisplayBackend>(
    output: &Output,
    config: &OutputConfig,
    bitmap: Option<&DecodedBitmap>,
    target: &RenderTarget,
    caps: Capabilities,
    backend: &mut B,
) -> bool {
    if target.is_empty() {
        log::warn!(
            "Output {} has an empty size, not drawing",
            output.describe()
        );
        return false;
    }

    if target.kind == BufferKind::SinglePixel {
        let color = config.color.unwrap_or(Color::TRANSPARENT);
        log::debug!(
            "Committing {} to output {} as a single pixel",
            color,
            output.describe()
        );
        backend.commit_solid_color(output.id, color, target);
        return true;
    }

    let (width, height) = target.buffer_size;
    let format = if caps.deep_color && bitmap.is_some_and(|b| b.cicp().is_some()) {
        PixelFormat::Xrgb2101010
    } else {
        PixelFormat::Argb8888
    };

    // The shm buffer bounds the size, so it is allocated before the canvas.
    let mut buffer = match backend.allocate(width, height, format) {
        Ok(buffer) => buffer,
        Err(e) => {
            log::error!(
                "Failed to allocate {}x{} buffer for output {}: {:#}",
                width,
                height,
                output.describe(),
                e
            );
            return false;
        }
    };

    let mut canvas = Canvas::new(width, height);
    if let Err(e) = compositor::composite(&mut canvas, bitmap, config.mode, config.color) {
        log::error!("Failed to render output {}: {:#}", output.describe(), e);
        return false;
    }

    let stride = buffer.stride();
    format.encode(&canvas, buffer.data_mut(), stride);

    log::debug!(
        "Committing {}x{} {:?} buffer to output {} at {}",
        width,
        height,
        format,
        output.describe(),
        target.scale
    );
    backend.commit_buffer(output.id, buffer, target);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodeError;
    use crate::output::SurfaceScale;
    use common::{BackgroundMode, Cicp, ConfigEntry, MatchLevel};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(OutputId),
        Ack(OutputId, u32),
        Commit {
            id: OutputId,
            size: (u32, u32),
            scale: SurfaceScale,
            first_pixel: [u8; 4],
        },
        Solid {
            id: OutputId,
            color: Color,
            logical: (u32, u32),
        },
        Rescale(OutputId, SurfaceScale),
        Destroy(OutputId),
    }

    struct FakeBuffer {
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    }

    impl PixelBuffer for FakeBuffer {
        fn width(&self) -> u32 {
            self.width
        }
        fn height(&self) -> u32 {
            self.height
        }
        fn stride(&self) -> usize {
            self.width as usize * 4
        }
        fn format(&self) -> PixelFormat {
            self.format
        }
        fn data_mut(&mut self) -> &mut [u8] {
            &mut self.data
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        caps: Capabilities,
        fail_allocation: bool,
        allocation_attempts: usize,
        calls: Vec<Call>,
        formats: Vec<PixelFormat>,
    }

    impl DisplayBackend for FakeBackend {
        type Buffer = FakeBuffer;

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        fn create_surface(&mut self, id: OutputId) -> Result<()> {
            self.calls.push(Call::Create(id));
            Ok(())
        }

        fn ack_configure(&mut self, id: OutputId, serial: u32) {
            self.calls.push(Call::Ack(id, serial));
        }

        fn allocate(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<FakeBuffer> {
            self.allocation_attempts += 1;
            if self.fail_allocation {
                anyhow::bail!("out of memory");
            }
            // Same limit as a wl_shm pool.
            if width as usize * height as usize * 4 > i32::MAX as usize {
                anyhow::bail!("Cannot allocate a {}x{} buffer", width, height);
            }
            self.formats.push(format);
            Ok(FakeBuffer {
                width,
                height,
                format,
                data: vec![0; width as usize * height as usize * 4],
            })
        }

        fn commit_buffer(&mut self, id: OutputId, buffer: FakeBuffer, target: &RenderTarget) {
            self.calls.push(Call::Commit {
                id,
                size: (buffer.width, buffer.height),
                scale: target.scale,
                first_pixel: [buffer.data[0], buffer.data[1], buffer.data[2], buffer.data[3]],
            });
        }

        fn commit_solid_color(&mut self, id: OutputId, color: Color, target: &RenderTarget) {
            self.calls.push(Call::Solid {
                id,
                color,
                logical: target.logical_size,
            });
        }

        fn commit_scale(&mut self, id: OutputId, target: &RenderTarget) {
            self.calls.push(Call::Rescale(id, target.scale));
        }

        fn destroy_surface(&mut self, id: OutputId) {
            self.calls.push(Call::Destroy(id));
        }
    }

    /// Hands out a 2x2 opaque green bitmap and counts loads per path. Paths
    /// starting with `/hdr` come back tagged with BT.2100 PQ CICP.
    #[derive(Default)]
    struct CountingLoader {
        fail: bool,
        loads: AtomicUsize,
        paths: Mutex<Vec<String>>,
    }

    const PQ: Cicp = Cicp {
        primaries: 9,
        transfer: 16,
        matrix: 0,
        range: 1,
    };

    impl ImageLoader for CountingLoader {
        fn load(&self, path: &Path) -> Result<DecodedBitmap, DecodeError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.paths
                .lock()
                .unwrap()
                .push(path.to_string_lossy().into_owned());
            if self.fail {
                return Err(DecodeError::UnknownFormat(path.to_path_buf()));
            }
            let cicp = path.to_string_lossy().starts_with("/hdr").then_some(PQ);
            Ok(DecodedBitmap::from_premultiplied(2, 2, [0, 255, 0, 255].repeat(4), cicp).unwrap())
        }
    }

    fn entry(selector: &str, image: Option<&str>, color: Option<&str>) -> ConfigEntry {
        ConfigEntry {
            selector: selector.to_string(),
            image: image.map(str::to_string),
            color: color.and_then(Color::parse),
            mode: None,
        }
    }

    /// Tiled so the fake 2x2 bitmap covers the buffer without resampling.
    fn image_entry(selector: &str, image: &str) -> ConfigEntry {
        let mut entry = entry(selector, Some(image), None);
        entry.mode = Some(BackgroundMode::Tile);
        entry
    }

    fn reconciler(entries: Vec<ConfigEntry>) -> Reconciler {
        Reconciler::new(ConfigSet::from_entries(entries).unwrap())
    }

    fn announce(
        rec: &mut Reconciler,
        backend: &mut FakeBackend,
        id: u32,
        name: &str,
        description: &str,
    ) {
        let id = OutputId(id);
        rec.handle(id, OutputEvent::Announced, backend).unwrap();
        rec.handle(id, OutputEvent::Name(name.to_string()), backend).unwrap();
        rec.handle(id, OutputEvent::Description(description.to_string()), backend)
            .unwrap();
        rec.handle(id, OutputEvent::Scale(1), backend).unwrap();
        rec.handle(id, OutputEvent::Done, backend).unwrap();
    }

    fn configure(rec: &mut Reconciler, backend: &mut FakeBackend, id: u32, serial: u32, size: (u32, u32)) {
        rec.handle(
            OutputId(id),
            OutputEvent::Configure {
                serial,
                width: size.0,
                height: size.1,
            },
            backend,
        )
        .unwrap();
    }

    #[test]
    fn test_name_beats_identifier_and_wildcard() {
        let mut rec = reconciler(vec![
            entry("*", None, Some("#000000")),
            entry("Dell 1", None, Some("#00ff00")),
            entry("DP-1", None, Some("#ff0000")),
        ]);
        let mut backend = FakeBackend::default();

        announce(&mut rec, &mut backend, 1, "DP-1", "Dell 1 (DP-1)");
        announce(&mut rec, &mut backend, 2, "DP-2", "Dell 1 (DP-2)");
        announce(&mut rec, &mut backend, 3, "DP-3", "Acer 2 (DP-3)");

        let level = |id| rec.output(OutputId(id)).unwrap().config.unwrap().level;
        assert_eq!(level(1), MatchLevel::Name);
        assert_eq!(level(2), MatchLevel::Identifier);
        assert_eq!(level(3), MatchLevel::Wildcard);
    }

    #[test]
    fn test_late_identifier_upgrades_wildcard_match() {
        let mut rec = reconciler(vec![
            entry("*", None, Some("#000000")),
            entry("Dell 1", None, Some("#00ff00")),
        ]);
        let mut backend = FakeBackend::default();
        let id = OutputId(4);

        rec.handle(id, OutputEvent::Announced, &mut backend).unwrap();
        rec.handle(id, OutputEvent::Name("DP-1".into()), &mut backend).unwrap();
        rec.handle(id, OutputEvent::Done, &mut backend).unwrap();
        assert_eq!(rec.output(id).unwrap().config.unwrap().level, MatchLevel::Wildcard);

        configure(&mut rec, &mut backend, 4, 1, (100, 100));
        rec.redraw(&mut backend, &CountingLoader::default()).unwrap();

        rec.handle(id, OutputEvent::Description("Dell 1 (DP-1)".into()), &mut backend)
            .unwrap();
        let output = rec.output(id).unwrap();
        assert_eq!(output.config.unwrap().level, MatchLevel::Identifier);
        assert!(output.dirty);

        rec.redraw(&mut backend, &CountingLoader::default()).unwrap();
        let commits: Vec<_> = backend
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Commit { first_pixel, .. } => Some(*first_pixel),
                _ => None,
            })
            .collect();
        assert_eq!(commits, [[0, 0, 0, 255], [0, 255, 0, 255]]);
    }

    #[test]
    fn test_unmatched_output_is_closed() {
        let mut rec = reconciler(vec![entry("DP-1", None, Some("#000000"))]);
        let mut backend = FakeBackend::default();

        announce(&mut rec, &mut backend, 9, "HDMI-A-1", "TV (HDMI-A-1)");

        assert!(rec.output(OutputId(9)).is_none());
        assert!(backend.calls.is_empty());
    }

    #[test]
    fn test_ack_precedes_commit_and_second_pass_is_idle() {
        let mut rec = reconciler(vec![image_entry("*", "/wall.png")]);
        let mut backend = FakeBackend::default();
        let loader = CountingLoader::default();

        announce(&mut rec, &mut backend, 1, "DP-1", "Dell 1 (DP-1)");
        configure(&mut rec, &mut backend, 1, 42, (4, 2));
        let stats = rec.redraw(&mut backend, &loader).unwrap();

        assert_eq!(stats.committed, 1);
        assert_eq!(
            backend.calls,
            [
                Call::Create(OutputId(1)),
                Call::Ack(OutputId(1), 42),
                Call::Commit {
                    id: OutputId(1),
                    size: (4, 2),
                    scale: SurfaceScale::Integer(1),
                    first_pixel: [0, 255, 0, 255],
                },
            ]
        );

        let before = backend.calls.len();
        let stats = rec.redraw(&mut backend, &loader).unwrap();
        assert_eq!(stats, RedrawStats::default());
        assert_eq!(backend.calls.len(), before);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_image_decoded_once_per_pass() {
        let mut rec = reconciler(vec![
            image_entry("DP-1", "/shared.png"),
            image_entry("DP-2", "/shared.png"),
            image_entry("DP-3", "/other.png"),
        ]);
        let mut backend = FakeBackend::default();
        let loader = CountingLoader::default();

        for (id, name) in [(1, "DP-1"), (2, "DP-2"), (3, "DP-3")] {
            announce(&mut rec, &mut backend, id, name, "");
            configure(&mut rec, &mut backend, id, id, (8, 8));
        }

        let stats = rec.redraw(&mut backend, &loader).unwrap();
        assert_eq!(stats.committed, 3);
        assert_eq!(stats.decoded, 2);

        let mut paths = loader.paths.lock().unwrap().clone();
        paths.sort();
        assert_eq!(paths, ["/other.png", "/shared.png"]);
    }

    #[test]
    fn test_scale_change_with_same_buffer_is_scale_only() {
        let mut rec = reconciler(vec![image_entry("*", "/wall.png")]);
        let mut backend = FakeBackend::default();
        let loader = CountingLoader::default();
        let id = OutputId(1);

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (200, 200));
        rec.redraw(&mut backend, &loader).unwrap();

        rec.handle(id, OutputEvent::Scale(2), &mut backend).unwrap();
        configure(&mut rec, &mut backend, 1, 2, (100, 100));
        let stats = rec.redraw(&mut backend, &loader).unwrap();

        assert_eq!(stats.rescaled, 1);
        assert_eq!(stats.committed, 0);
        assert_eq!(backend.calls.last(), Some(&Call::Rescale(id, SurfaceScale::Integer(2))));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        // A scale that changes the buffer size needs a new buffer.
        rec.handle(id, OutputEvent::Scale(3), &mut backend).unwrap();
        assert!(rec.output(id).unwrap().dirty);
        let stats = rec.redraw(&mut backend, &loader).unwrap();
        assert_eq!(stats.committed, 1);
        assert!(matches!(
            backend.calls.last(),
            Some(Call::Commit { size: (300, 300), .. })
        ));
    }

    #[test]
    fn test_fractional_scale_change_with_same_buffer_is_scale_only() {
        let mut rec = reconciler(vec![image_entry("*", "/wall.png")]);
        let mut backend = FakeBackend {
            caps: Capabilities {
                fractional_scale: true,
                ..Capabilities::default()
            },
            ..FakeBackend::default()
        };
        let loader = CountingLoader::default();
        let id = OutputId(1);

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        rec.handle(id, OutputEvent::PreferredScale(240), &mut backend).unwrap();
        configure(&mut rec, &mut backend, 1, 1, (100, 100));
        rec.redraw(&mut backend, &loader).unwrap();
        assert!(matches!(
            backend.calls.last(),
            Some(Call::Commit {
                size: (200, 200),
                scale: SurfaceScale::Fractional(240),
                ..
            })
        ));

        rec.handle(id, OutputEvent::PreferredScale(120), &mut backend).unwrap();
        configure(&mut rec, &mut backend, 1, 2, (200, 200));
        let stats = rec.redraw(&mut backend, &loader).unwrap();

        assert_eq!(stats.rescaled, 1);
        assert_eq!(stats.committed, 0);
        assert_eq!(
            backend.calls.last(),
            Some(&Call::Rescale(id, SurfaceScale::Fractional(120)))
        );
        assert_eq!(backend.formats.len(), 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unchanged_scale_does_not_dirty() {
        let mut rec = reconciler(vec![entry("*", None, Some("#101010"))]);
        let mut backend = FakeBackend::default();
        let id = OutputId(1);

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (10, 10));
        rec.redraw(&mut backend, &CountingLoader::default()).unwrap();

        rec.handle(id, OutputEvent::Scale(1), &mut backend).unwrap();
        assert!(!rec.output(id).unwrap().dirty);
    }

    #[test]
    fn test_fractional_scale_buffer_size() {
        let mut rec = reconciler(vec![entry("*", None, Some("#336699"))]);
        let mut backend = FakeBackend {
            caps: Capabilities {
                fractional_scale: true,
                ..Capabilities::default()
            },
            ..FakeBackend::default()
        };
        let id = OutputId(1);

        announce(&mut rec, &mut backend, 1, "eDP-1", "");
        rec.handle(id, OutputEvent::PreferredScale(180), &mut backend).unwrap();
        configure(&mut rec, &mut backend, 1, 5, (1001, 501));
        rec.redraw(&mut backend, &CountingLoader::default()).unwrap();

        assert!(matches!(
            backend.calls.last(),
            Some(Call::Commit {
                size: (1502, 752),
                scale: SurfaceScale::Fractional(180),
                ..
            })
        ));
    }

    #[test]
    fn test_single_pixel_solid_color() {
        let mut rec = reconciler(vec![entry("*", None, Some("#ff000080"))]);
        let mut backend = FakeBackend {
            caps: Capabilities {
                single_pixel: true,
                ..Capabilities::default()
            },
            ..FakeBackend::default()
        };
        let loader = CountingLoader::default();
        let id = OutputId(1);

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (1920, 1080));
        rec.redraw(&mut backend, &loader).unwrap();

        let solid = Call::Solid {
            id,
            color: Color::rgba(255, 0, 0, 128),
            logical: (1920, 1080),
        };
        assert_eq!(backend.calls.last(), Some(&solid));
        assert!(backend.formats.is_empty());

        // Same size: nothing to do. New size: a new single-pixel commit.
        configure(&mut rec, &mut backend, 1, 2, (1920, 1080));
        let stats = rec.redraw(&mut backend, &loader).unwrap();
        assert_eq!(stats.skipped, 1);

        configure(&mut rec, &mut backend, 1, 3, (2560, 1440));
        rec.redraw(&mut backend, &loader).unwrap();
        assert!(matches!(
            backend.calls.last(),
            Some(Call::Solid { logical: (2560, 1440), .. })
        ));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_failure_falls_back_to_color() {
        let mut rec = reconciler(vec![entry("*", Some("/broken.png"), Some("#0000ff"))]);
        let mut backend = FakeBackend::default();
        let loader = CountingLoader {
            fail: true,
            ..CountingLoader::default()
        };

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (4, 4));
        let stats = rec.redraw(&mut backend, &loader).unwrap();

        assert_eq!(stats.decoded, 0);
        assert_eq!(stats.committed, 1);
        // Blue in ARGB8888 byte order.
        assert!(matches!(
            backend.calls.last(),
            Some(Call::Commit {
                first_pixel: [255, 0, 0, 255],
                ..
            })
        ));
    }

    #[test]
    fn test_allocation_failure_is_not_fatal() {
        let mut rec = reconciler(vec![entry("*", None, Some("#000000"))]);
        let mut backend = FakeBackend {
            fail_allocation: true,
            ..FakeBackend::default()
        };
        let id = OutputId(1);

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (4, 4));
        let stats = rec.redraw(&mut backend, &CountingLoader::default()).unwrap();

        assert_eq!(stats.committed, 0);
        let output = rec.output(id).unwrap();
        assert!(!output.dirty);
        assert!(output.committed.is_none());
    }

    #[test]
    fn test_oversized_buffer_fails_before_rendering() {
        let mut rec = reconciler(vec![image_entry("*", "/wall.png")]);
        let mut backend = FakeBackend::default();
        let id = OutputId(1);

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        rec.handle(id, OutputEvent::Scale(4), &mut backend).unwrap();
        // 160000x160000 pixels, far beyond what a shm pool can hold.
        configure(&mut rec, &mut backend, 1, 1, (40_000, 40_000));
        let stats = rec.redraw(&mut backend, &CountingLoader::default()).unwrap();

        assert_eq!(stats.committed, 0);
        assert_eq!(backend.allocation_attempts, 1);
        assert!(backend.formats.is_empty());
        assert!(rec.output(id).unwrap().committed.is_none());
    }

    #[test]
    fn test_zero_size_is_skipped() {
        let mut rec = reconciler(vec![image_entry("*", "/wall.png")]);
        let mut backend = FakeBackend::default();
        let loader = CountingLoader::default();

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (0, 1080));
        let stats = rec.redraw(&mut backend, &loader).unwrap();

        assert_eq!(stats.committed, 0);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls.last(), Some(&Call::Ack(OutputId(1), 1)));
    }

    #[test]
    fn test_deep_color_only_for_cicp_images() {
        let mut rec = reconciler(vec![image_entry("*", "/wall.png")]);
        let mut backend = FakeBackend {
            caps: Capabilities {
                deep_color: true,
                ..Capabilities::default()
            },
            ..FakeBackend::default()
        };

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (4, 4));
        rec.redraw(&mut backend, &CountingLoader::default()).unwrap();

        assert_eq!(backend.formats, [PixelFormat::Argb8888]);
    }

    #[test]
    fn test_cicp_image_uses_deep_color_when_advertised() {
        let deep = Capabilities {
            deep_color: true,
            ..Capabilities::default()
        };

        let mut rec = reconciler(vec![image_entry("*", "/hdr.png")]);
        let mut backend = FakeBackend {
            caps: deep,
            ..FakeBackend::default()
        };
        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (4, 4));
        rec.redraw(&mut backend, &CountingLoader::default()).unwrap();
        assert_eq!(backend.formats, [PixelFormat::Xrgb2101010]);

        // Without the shm format the same image stays 8-bit.
        let mut rec = reconciler(vec![image_entry("*", "/hdr.png")]);
        let mut backend = FakeBackend::default();
        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (4, 4));
        rec.redraw(&mut backend, &CountingLoader::default()).unwrap();
        assert_eq!(backend.formats, [PixelFormat::Argb8888]);

        // A failed decode leaves only the color, drawn in 8-bit.
        let mut rec = reconciler(vec![entry("*", Some("/hdr.png"), Some("#202020"))]);
        let mut backend = FakeBackend {
            caps: deep,
            ..FakeBackend::default()
        };
        let failing = CountingLoader {
            fail: true,
            ..CountingLoader::default()
        };
        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (4, 4));
        let stats = rec.redraw(&mut backend, &failing).unwrap();
        assert_eq!(stats.committed, 1);
        assert_eq!(backend.formats, [PixelFormat::Argb8888]);
    }

    #[test]
    fn test_removed_output_destroys_surface() {
        let mut rec = reconciler(vec![entry("*", None, Some("#000000"))]);
        let mut backend = FakeBackend::default();
        let id = OutputId(1);

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        configure(&mut rec, &mut backend, 1, 1, (4, 4));
        rec.handle(id, OutputEvent::Removed, &mut backend).unwrap();

        assert_eq!(backend.calls.last(), Some(&Call::Destroy(id)));
        assert!(rec.output(id).is_none());

        // Late events for the removed output are ignored.
        configure(&mut rec, &mut backend, 1, 2, (8, 8));
        assert_eq!(rec.redraw(&mut backend, &CountingLoader::default()).unwrap(), RedrawStats::default());
    }

    #[test]
    fn test_shutdown_destroys_bound_surfaces() {
        let mut rec = reconciler(vec![entry("DP-1", None, Some("#000000"))]);
        let mut backend = FakeBackend::default();

        announce(&mut rec, &mut backend, 1, "DP-1", "");
        rec.handle(OutputId(2), OutputEvent::Announced, &mut backend).unwrap();
        rec.shutdown(&mut backend);

        assert_eq!(
            backend.calls,
            [Call::Create(OutputId(1)), Call::Destroy(OutputId(1))]
        );
        assert_eq!(rec.outputs().count(), 0);
    }
}
