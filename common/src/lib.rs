//! Common types for backdrop.
//!
//! This crate holds the data model shared by the CLI, the configuration file
//! loader and the renderer: background modes, colors, CICP color metadata and
//! the per-output configuration set together with its selector matching rules.
//!
//! # Examples
//!
//! ```
//! use common::{BackgroundMode, Color, ConfigEntry, ConfigSet, MatchLevel};
//!
//! let mut all = ConfigEntry::new("*");
//! all.color = Color::parse("#1e1e1e");
//!
//! let mut laptop = ConfigEntry::new("eDP-1");
//! laptop.image = Some("/usr/share/backgrounds/default.png".to_string());
//! laptop.mode = Some(BackgroundMode::Fill);
//!
//! let configs = ConfigSet::from_entries([all, laptop]).unwrap();
//! let found = configs.resolve(Some("eDP-1"), None).unwrap();
//! assert_eq!(found.level, MatchLevel::Name);
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Selector matching every output.
pub const WILDCARD: &str = "*";

/// Errors produced while building a [`ConfigSet`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no usable output configuration (every entry lacks both an image and a color)")]
    Empty,

    #[error("invalid color '{0}', expected RRGGBB or RRGGBBAA with an optional leading '#'")]
    InvalidColor(String),

    #[error("invalid background mode '{0}', expected one of: {modes}", modes = BackgroundMode::NAMES.join(", "))]
    InvalidMode(String),
}

/// How an image is placed on an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackgroundMode {
    /// Scale both axes independently to cover the output exactly.
    Stretch,
    /// Scale uniformly to cover the output, cropping one axis.
    Fill,
    /// Scale uniformly to fit inside the output, letterboxing one axis.
    Fit,
    /// No scaling, centered.
    Center,
    /// No scaling, repeated from the top-left corner.
    Tile,
    /// No image, only the background color.
    SolidColor,
}

impl BackgroundMode {
    pub const NAMES: [&'static str; 6] = ["stretch", "fill", "fit", "center", "tile", "solid_color"];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stretch => "stretch",
            Self::Fill => "fill",
            Self::Fit => "fit",
            Self::Center => "center",
            Self::Tile => "tile",
            Self::SolidColor => "solid_color",
        }
    }
}

impl FromStr for BackgroundMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stretch" => Ok(Self::Stretch),
            "fill" => Ok(Self::Fill),
            "fit" => Ok(Self::Fit),
            "center" => Ok(Self::Center),
            "tile" => Ok(Self::Tile),
            "solid_color" => Ok(Self::SolidColor),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for BackgroundMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Straight (non-premultiplied) 8-bit RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parse a hex color string (e.g., "#FF5733", "FF5733" or "#FF573380").
    pub fn parse(color: &str) -> Option<Self> {
        let color = color.strip_prefix('#').unwrap_or(color);

        if (color.len() != 6 && color.len() != 8) || !color.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        let r = u8::from_str_radix(&color[0..2], 16).ok()?;
        let g = u8::from_str_radix(&color[2..4], 16).ok()?;
        let b = u8::from_str_radix(&color[4..6], 16).ok()?;
        let a = if color.len() == 8 {
            u8::from_str_radix(&color[6..8], 16).ok()?
        } else {
            255
        };

        Some(Self { r, g, b, a })
    }

    /// Premultiplied RGBA bytes, using the same truncating rule as image decoding.
    pub fn premultiplied(self) -> [u8; 4] {
        [
            premultiply(self.r, self.a),
            premultiply(self.g, self.a),
            premultiply(self.b, self.a),
            self.a,
        ]
    }
}

impl FromStr for Color {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ConfigError::InvalidColor(s.to_string()))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }
}

/// Scale a color channel by alpha: `channel * alpha / 255`, truncating.
#[inline]
pub fn premultiply(channel: u8, alpha: u8) -> u8 {
    (channel as u16 * alpha as u16 / 255) as u8
}

/// Coding-independent code points describing an image's color encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cicp {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub range: u8,
}

/// One configuration entry as written by the user. Every field but the
/// selector is optional so that later entries can be merged onto earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigEntry {
    /// Output name, persistent identifier, or `*`.
    pub selector: String,
    pub image: Option<String>,
    pub color: Option<Color>,
    pub mode: Option<BackgroundMode>,
}

impl ConfigEntry {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            ..Default::default()
        }
    }

    /// Overwrite every field that `other` sets.
    fn merge_from(&mut self, other: ConfigEntry) {
        if other.image.is_some() {
            self.image = other.image;
        }
        if other.color.is_some() {
            self.color = other.color;
        }
        if other.mode.is_some() {
            self.mode = other.mode;
        }
    }
}

/// Fully resolved configuration for the outputs matching `selector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub selector: String,
    pub image: Option<String>,
    pub color: Option<Color>,
    pub mode: BackgroundMode,
}

impl OutputConfig {
    /// Whether rendering this config requires a decoded image.
    pub fn wants_image(&self) -> bool {
        self.image.is_some() && self.mode != BackgroundMode::SolidColor
    }
}

/// How specifically a config matched an output. Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchLevel {
    Wildcard,
    Identifier,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigMatch {
    pub index: usize,
    pub level: MatchLevel,
}

/// The validated, immutable set of output configurations.
#[derive(Debug, Clone, Default)]
pub struct ConfigSet {
    configs: Vec<OutputConfig>,
}

impl ConfigSet {
    /// Build the set from entries in the order they were given.
    ///
    /// Entries sharing a selector are merged field by field, later values
    /// winning. Entries with neither an image nor a color are dropped, and a
    /// missing mode defaults to `stretch` for images and `solid_color`
    /// otherwise.
    pub fn from_entries<I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = ConfigEntry>,
    {
        let mut merged: Vec<ConfigEntry> = Vec::new();

        for entry in entries {
            match merged.iter_mut().find(|e| e.selector == entry.selector) {
                Some(existing) => existing.merge_from(entry),
                None => merged.push(entry),
            }
        }

        let configs: Vec<OutputConfig> = merged
            .into_iter()
            .filter_map(|entry| {
                if entry.image.is_none() && entry.color.is_none() {
                    log::debug!("Dropping empty configuration for '{}'", entry.selector);
                    return None;
                }

                let mode = entry.mode.unwrap_or(if entry.image.is_some() {
                    BackgroundMode::Stretch
                } else {
                    BackgroundMode::SolidColor
                });

                Some(OutputConfig {
                    selector: entry.selector,
                    image: entry.image,
                    color: entry.color,
                    mode,
                })
            })
            .collect();

        if configs.is_empty() {
            return Err(ConfigError::Empty);
        }

        Ok(Self { configs })
    }

    /// Rewrite every image path through `resolve`. Paths mapped to `None` are
    /// dropped, and configs left without an image or a color are removed.
    pub fn resolve_images<F>(&mut self, mut resolve: F) -> Result<(), ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        for config in &mut self.configs {
            if let Some(path) = config.image.take() {
                config.image = resolve(&path);
            }
        }

        self.configs.retain(|config| {
            let keep = config.image.is_some() || config.color.is_some();
            if !keep {
                log::warn!(
                    "Configuration for '{}' has no usable image or color, ignoring it",
                    config.selector
                );
            }
            keep
        });

        if self.configs.is_empty() {
            return Err(ConfigError::Empty);
        }

        Ok(())
    }

    /// Find the config for an output.
    ///
    /// An exact match on the output name wins outright, then an exact match
    /// on the persistent identifier, then the wildcard.
    pub fn resolve(&self, name: Option<&str>, identifier: Option<&str>) -> Option<ConfigMatch> {
        let mut best: Option<ConfigMatch> = None;

        for (index, config) in self.configs.iter().enumerate() {
            let level = if name == Some(config.selector.as_str()) {
                MatchLevel::Name
            } else if identifier == Some(config.selector.as_str()) {
                MatchLevel::Identifier
            } else if config.selector == WILDCARD {
                MatchLevel::Wildcard
            } else {
                continue;
            };

            if level == MatchLevel::Name {
                return Some(ConfigMatch { index, level });
            }

            if best.is_none_or(|b| level > b.level) {
                best = Some(ConfigMatch { index, level });
            }
        }

        best
    }

    /// Resolve a batch of `(name, identifier)` pairs.
    pub fn resolve_all<'a, I>(&self, outputs: I) -> Vec<Option<ConfigMatch>>
    where
        I: IntoIterator<Item = (Option<&'a str>, Option<&'a str>)>,
    {
        outputs
            .into_iter()
            .map(|(name, identifier)| self.resolve(name, identifier))
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&OutputConfig> {
        self.configs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputConfig> {
        self.configs.iter()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
