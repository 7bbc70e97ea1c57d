//! Per-output bookkeeping for the reconciler.

use common::{BackgroundMode, ConfigMatch};
use std::fmt;

/// Denominator of the preferred fractional scale (a value of 120 means 1.0).
pub const FRACTIONAL_SCALE_DENOMINATOR: u32 = 120;

/// Protocol id of the output global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputId(pub u32);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceScale {
    /// Integer buffer scale.
    Integer(i32),
    /// Fractional scale in 120ths, applied through a viewport.
    Fractional(u32),
}

impl fmt::Display for SurfaceScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(scale) => write!(f, "{}x", scale),
            Self::Fractional(scale) => {
                write!(f, "{:.3}x", *scale as f64 / FRACTIONAL_SCALE_DENOMINATOR as f64)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// A full-size shared memory buffer.
    Shm,
    /// A 1x1 solid color buffer stretched by the viewport.
    SinglePixel,
}

/// What an output's surface needs to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub kind: BufferKind,
    pub buffer_size: (u32, u32),
    pub logical_size: (u32, u32),
    pub scale: SurfaceScale,
}

impl RenderTarget {
    pub fn is_empty(&self) -> bool {
        self.buffer_size.0 == 0 || self.buffer_size.1 == 0
    }
}

/// Optional compositor features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Single-pixel buffers plus a viewport to stretch them.
    pub single_pixel: bool,
    /// Preferred fractional scale plus a viewport to apply it.
    pub fractional_scale: bool,
    /// The shm global advertises `xrgb2101010`.
    pub deep_color: bool,
}

/// How a redraw pass treats an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// The surface already shows this target.
    Skip,
    /// Same buffer contents, only scale or viewport bookkeeping changed.
    ScaleOnly,
    /// Render and commit a new buffer.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Known global, no layer surface yet.
    Unbound,
    /// Layer surface created, waiting for the first configure.
    Bound,
    /// Has a size and can be drawn.
    Configured,
}

#[derive(Debug, Clone)]
pub struct Output {
    pub id: OutputId,
    pub name: Option<String>,
    pub identifier: Option<String>,
    pub config: Option<ConfigMatch>,
    pub lifecycle: Lifecycle,
    pub logical_size: (u32, u32),
    pub scale: i32,
    pub preferred_scale: Option<u32>,
    /// Configure serial not yet acknowledged.
    pub pending_serial: Option<u32>,
    pub dirty: bool,
    /// What the surface shows since the last commit.
    pub committed: Option<RenderTarget>,
}

impl Output {
    pub fn new(id: OutputId) -> Self {
        Self {
            id,
            name: None,
            identifier: None,
            config: None,
            lifecycle: Lifecycle::Unbound,
            logical_size: (0, 0),
            scale: 1,
            preferred_scale: None,
            pending_serial: None,
            dirty: false,
            committed: None,
        }
    }

    /// The buffer this output needs for `mode` given the compositor's features.
    pub fn target(&self, mode: BackgroundMode, caps: Capabilities) -> RenderTarget {
        let logical_size = self.logical_size;

        if mode == BackgroundMode::SolidColor && caps.single_pixel {
            return RenderTarget {
                kind: BufferKind::SinglePixel,
                buffer_size: (1, 1),
                logical_size,
                scale: SurfaceScale::Integer(1),
            };
        }

        match self.preferred_scale {
            Some(scale) if caps.fractional_scale => RenderTarget {
                kind: BufferKind::Shm,
                buffer_size: (
                    scale_to_buffer(logical_size.0, scale),
                    scale_to_buffer(logical_size.1, scale),
                ),
                logical_size,
                scale: SurfaceScale::Fractional(scale),
            },
            _ => {
                let scale = self.scale.max(1);
                RenderTarget {
                    kind: BufferKind::Shm,
                    buffer_size: (
                        logical_size.0.saturating_mul(scale as u32),
                        logical_size.1.saturating_mul(scale as u32),
                    ),
                    logical_size,
                    scale: SurfaceScale::Integer(scale),
                }
            }
        }
    }

    /// Compare `target` with what the surface already shows.
    pub fn commit_action(&self, target: &RenderTarget) -> CommitAction {
        let Some(committed) = self.committed else {
            return CommitAction::Full;
        };

        match (committed.kind, target.kind) {
            (BufferKind::SinglePixel, BufferKind::SinglePixel) => {
                if committed.logical_size == target.logical_size {
                    CommitAction::Skip
                } else {
                    CommitAction::Full
                }
            }
            (BufferKind::Shm, BufferKind::Shm) => {
                if committed.buffer_size != target.buffer_size {
                    CommitAction::Full
                } else if committed.scale != target.scale
                    || committed.logical_size != target.logical_size
                {
                    CommitAction::ScaleOnly
                } else {
                    CommitAction::Skip
                }
            }
            _ => CommitAction::Full,
        }
    }

    /// Name and description for log messages.
    pub fn describe(&self) -> String {
        match (&self.name, &self.identifier) {
            (Some(name), Some(identifier)) => format!("{} ({})", name, identifier),
            (Some(name), None) => name.clone(),
            (None, Some(identifier)) => identifier.clone(),
            (None, None) => self.id.to_string(),
        }
    }
}

/// Buffer length for a logical length at a fractional scale, rounding half up.
pub fn scale_to_buffer(logical: u32, scale: u32) -> u32 {
    let half = FRACTIONAL_SCALE_DENOMINATOR as u64 / 2;
    ((logical as u64 * scale as u64 + half) / FRACTIONAL_SCALE_DENOMINATOR as u64) as u32
}

/// The persistent identifier within an output description of the form
/// `make model serial (name)`: everything before the last `(`, without
/// trailing whitespace.
pub fn identifier_from_description(description: &str) -> Option<String> {
    let end = description.rfind('(')?;
    let identifier = description[..end].trim_end();
    (!identifier.is_empty()).then(|| identifier.to_string())
}
