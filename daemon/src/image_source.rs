//! Image path resolution and de-duplication.
//!
//! Configured image paths may be a file, a directory (one file is picked at
//! random) or a glob pattern. After resolution every distinct path becomes one
//! [`ImageId`], so outputs sharing an image share a single decode.

use common::ConfigSet;
use glob::glob;
use rand::seq::IndexedRandom;
use std::path::{Path, PathBuf};

/// Resolve a configured image path to the file that will be decoded.
///
/// Returns `None`, after logging why, when nothing usable is found.
pub fn resolve_image_path(raw: &str) -> Option<String> {
    let expanded = shellexpand::tilde(raw);
    let path = Path::new(expanded.as_ref());

    let resolved = if path.is_dir() {
        let chosen = pick_from_directory(path);
        if chosen.is_none() {
            log::error!("No image files found in directory {}", path.display());
        }
        chosen
    } else if path.exists() {
        Some(path.to_path_buf())
    } else {
        let chosen = pick_from_glob(&expanded);
        if chosen.is_none() {
            log::error!("Image path {} does not exist", raw);
        }
        chosen
    };
    let resolved = resolved?;

    if resolved.as_os_str() != raw {
        log::info!("Resolved image {} to {}", raw, resolved.display());
    }

    Some(resolved.to_string_lossy().into_owned())
}

/// Pick a random regular file from `dir`. Symlinks are followed and
/// sub-directories are skipped.
fn pick_from_directory(dir: &Path) -> Option<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("Failed to read directory {}: {}", dir.display(), e);
            return None;
        }
    };

    let candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();

    log::debug!(
        "Found {} candidate image(s) in {}",
        candidates.len(),
        dir.display()
    );

    candidates.choose(&mut rand::rng()).cloned()
}

fn pick_from_glob(pattern: &str) -> Option<PathBuf> {
    let entries = glob(pattern).ok()?;
    let candidates: Vec<PathBuf> = entries.flatten().filter(|path| path.is_file()).collect();
    candidates.choose(&mut rand::rng()).cloned()
}

/// Index of a distinct image path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageId(usize);

/// The distinct images referenced by a [`ConfigSet`].
#[derive(Debug, Clone, Default)]
pub struct ImageSources {
    paths: Vec<PathBuf>,
    by_config: Vec<Option<ImageId>>,
}

impl ImageSources {
    /// Collect the images of every config that needs one, sharing entries
    /// between configs naming the same path.
    pub fn from_configs(configs: &ConfigSet) -> Self {
        let mut sources = Self::default();

        for config in configs.iter() {
            let id = match &config.image {
                Some(image) if config.wants_image() => Some(sources.intern(Path::new(image))),
                _ => None,
            };
            sources.by_config.push(id);
        }

        sources
    }

    fn intern(&mut self, path: &Path) -> ImageId {
        if let Some(index) = self.paths.iter().position(|p| p == path) {
            return ImageId(index);
        }
        self.paths.push(path.to_path_buf());
        ImageId(self.paths.len() - 1)
    }

    /// The image used by the config at `config_index`.
    pub fn for_config(&self, config_index: usize) -> Option<ImageId> {
        self.by_config.get(config_index).copied().flatten()
    }

    pub fn path(&self, id: ImageId) -> &Path {
        &self.paths[id.0]
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BackgroundMode, ConfigEntry};

    fn entry(selector: &str, image: &str) -> ConfigEntry {
        let mut entry = ConfigEntry::new(selector);
        entry.image = Some(image.to_string());
        entry
    }

    #[test]
    fn test_plain_file_resolves_to_itself() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let raw = file.path().to_string_lossy().into_owned();
        assert_eq!(resolve_image_path(&raw), Some(raw.clone()));
    }

    #[test]
    fn test_directory_picks_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        std::fs::write(dir.path().join("b.png"), b"b").unwrap();

        for _ in 0..8 {
            let chosen = resolve_image_path(&dir.path().to_string_lossy()).unwrap();
            let name = Path::new(&chosen).file_name().unwrap().to_string_lossy().into_owned();
            assert!(name == "a.png" || name == "b.png", "picked {name}");
        }
    }

    #[test]
    fn test_empty_directory_and_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_image_path(&dir.path().to_string_lossy()), None);
        assert_eq!(resolve_image_path("/nonexistent/backdrop/wallpaper.png"), None);
    }

    #[test]
    fn test_glob_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("skip.txt"), b"x").unwrap();

        let pattern = format!("{}/*.jpg", dir.path().display());
        let chosen = resolve_image_path(&pattern).unwrap();
        assert!(chosen.ends_with("only.jpg"));
    }

    #[test]
    fn test_shared_paths_are_interned_once() {
        let mut solid = entry("HDMI-A-1", "/wall/b.png");
        solid.mode = Some(BackgroundMode::SolidColor);
        solid.color = common::Color::parse("#000000");

        let configs = ConfigSet::from_entries([
            entry("*", "/wall/a.png"),
            entry("DP-1", "/wall/a.png"),
            entry("DP-2", "/wall/c.png"),
            solid,
        ])
        .unwrap();

        let sources = ImageSources::from_configs(&configs);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources.for_config(0), sources.for_config(1));
        assert_ne!(sources.for_config(0), sources.for_config(2));
        assert_eq!(sources.for_config(3), None);
        assert_eq!(sources.for_config(99), None);
        assert_eq!(
            sources.path(sources.for_config(2).unwrap()),
            Path::new("/wall/c.png")
        );
    }
}
