//! Wayland compositor integration module
//!
//! - daemon: connection setup and the dispatch loop
//! - backend: the reconciler's `DisplayBackend` on live protocol objects
//! - outputs: layer surface creation and output metadata forwarding
//! - event_handlers: Wayland protocol event handlers
//! - types: dispatch state and per-output surface data

mod backend;
mod daemon;
mod event_handlers;
mod outputs;
mod types;

pub use daemon::run;

pub(crate) use types::WallpaperDaemon;
