//! Command line parsing.
//!
//! Options are order sensitive: `--image`, `--color` and `--mode` given
//! before any `--output` apply to every output, and each `--output` starts a
//! new entry that the following options fill in.

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use common::{BackgroundMode, Color, ConfigEntry, WILDCARD};
use std::ffi::OsString;
use std::path::PathBuf;

const AFTER_HELP: &str = "\
Background modes: stretch, fill, fit, center, tile, solid_color

Options before the first --output apply to all outputs (\"*\").
Each --output opens a new entry; later options with the same output merge into it.

Example:
  backdrop -c '#1e1e2e' -o DP-1 -i ~/Pictures/wall.png -m fill";

#[derive(Parser, Debug)]
#[command(
    name = "backdrop",
    version,
    about = "Wallpaper client for Wayland compositors with layer-shell support",
    after_help = AFTER_HELP
)]
pub struct Cli {
    /// Set the background color (RRGGBB or RRGGBBAA, optional leading #)
    #[arg(short, long, value_name = "COLOR")]
    pub color: Vec<String>,

    /// Set the image to display (a file, a directory to pick from, or a glob)
    #[arg(short, long, value_name = "PATH")]
    pub image: Vec<String>,

    /// Set the mode to use for the image
    #[arg(short, long, value_name = "MODE")]
    pub mode: Vec<String>,

    /// Set the output to operate on, or * for all
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Vec<String>,

    /// Read additional settings from this file instead of the default location
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Do not read a configuration file
    #[arg(long, conflicts_with = "config")]
    pub no_config: bool,
}

/// Parsed command line with the original argument order preserved.
#[derive(Debug)]
pub struct Invocation {
    pub cli: Cli,
    matches: ArgMatches,
}

#[derive(Debug, Clone, Copy)]
enum Flag {
    Output,
    Image,
    Color,
    Mode,
}

impl Flag {
    const ALL: [(&'static str, Flag); 4] = [
        ("output", Flag::Output),
        ("image", Flag::Image),
        ("color", Flag::Color),
        ("mode", Flag::Mode),
    ];
}

impl Invocation {
    /// Config entries in command line order. Invalid colors and modes are
    /// reported and ignored.
    pub fn entries(&self) -> Vec<ConfigEntry> {
        let mut flags: Vec<(usize, Flag, &str)> = Vec::new();
        for (id, flag) in Flag::ALL {
            let (Some(values), Some(indices)) =
                (self.matches.get_many::<String>(id), self.matches.indices_of(id))
            else {
                continue;
            };
            for (value, index) in values.zip(indices) {
                flags.push((index, flag, value.as_str()));
            }
        }
        flags.sort_by_key(|(index, ..)| *index);

        let mut entries = Vec::new();
        let mut current = ConfigEntry::new(WILDCARD);
        let mut touched = false;

        for (_, flag, value) in flags {
            match flag {
                Flag::Output => {
                    if touched || current.selector != WILDCARD {
                        entries.push(std::mem::replace(&mut current, ConfigEntry::new(value)));
                    } else {
                        current = ConfigEntry::new(value);
                    }
                    touched = true;
                }
                Flag::Image => {
                    current.image = Some(value.to_string());
                    touched = true;
                }
                Flag::Color => match value.parse::<Color>() {
                    Ok(color) => {
                        current.color = Some(color);
                        touched = true;
                    }
                    Err(e) => log::error!("{}", e),
                },
                Flag::Mode => match value.parse::<BackgroundMode>() {
                    Ok(mode) => {
                        current.mode = Some(mode);
                        touched = true;
                    }
                    Err(e) => log::error!("{}", e),
                },
            }
        }

        if touched {
            entries.push(current);
        }
        entries
    }
}

/// Parse the process arguments.
pub fn parse() -> Result<Invocation, clap::Error> {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> Result<Invocation, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = Cli::command().try_get_matches_from(args)?;
    let cli = Cli::from_arg_matches(&matches)?;
    Ok(Invocation { cli, matches })
}

/// Usage text printed when nothing usable was configured.
pub fn usage() -> String {
    Cli::command().render_help().to_string()
}
