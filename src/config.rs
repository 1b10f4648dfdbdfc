//! Per-output configuration and backend options.
//!
//! Output overrides are keyed by output name (e.g. `HDMI1`) and choose the mode
//! and transform an output starts with. They are read from `[[output]]` tables:
//!
//! ```toml
//! [[output]]
//! name = "eDP1"
//! mode = "1920x1080"
//! transform = "90"
//!
//! [[output]]
//! name = "VGA1"
//! mode = "off"
//! ```
//!
//! Unusable values are logged and ignored, they never fail loading.

use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::drm::mode::{parse_modeline, ModeInfo};
use crate::backend::drm::DebugFlags;
use crate::utils::Transform;

/// Errors of loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read configuration")]
    Io(#[from] io::Error),
    /// The file is not valid toml
    #[error("Failed to parse configuration")]
    Parse(#[from] toml::de::Error),
}

/// Mode requested for an output
#[derive(Debug, Clone, PartialEq)]
pub enum ModeOverride {
    /// Turn the output off
    Off,
    /// Use the mode the display prefers
    Preferred,
    /// Keep whatever mode the crtc is programmed with
    Current,
    /// The first mode of the given size
    Resolution {
        #[allow(missing_docs)]
        width: i32,
        #[allow(missing_docs)]
        height: i32,
    },
    /// A custom timing, added to the output's modes
    Modeline(ModeInfo),
}

impl ModeOverride {
    /// Parse a mode value, `None` if it is not understood
    pub fn parse(value: &str) -> Option<ModeOverride> {
        match value.trim() {
            "off" => Some(ModeOverride::Off),
            "preferred" => Some(ModeOverride::Preferred),
            "current" => Some(ModeOverride::Current),
            other => {
                if let Ok((width, height)) = scan_fmt::scan_fmt!(other, "{d}x{d}", i32, i32) {
                    return Some(ModeOverride::Resolution { width, height });
                }
                match parse_modeline(other) {
                    Ok(info) => Some(ModeOverride::Modeline(info)),
                    Err(err) => {
                        debug!("Not a modeline: {}", err);
                        None
                    }
                }
            }
        }
    }
}

/// Overrides for one output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSection {
    /// Output name, e.g. `DP2`
    pub name: String,
    /// Requested mode, `None` if unset or invalid
    pub mode: Option<ModeOverride>,
    #[allow(missing_docs)]
    pub transform: Transform,
}

/// All output overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputConfig {
    sections: Vec<OutputSection>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    output: Vec<OutputTable>,
}

#[derive(Debug, Deserialize)]
struct OutputTable {
    name: Option<String>,
    mode: Option<String>,
    transform: Option<String>,
}

impl OutputConfig {
    /// Start collecting sections
    pub fn builder() -> OutputConfigBuilder {
        OutputConfigBuilder::default()
    }

    /// Read the `[[output]]` tables of a toml document
    pub fn from_toml_str(content: &str) -> Result<OutputConfig, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        let mut builder = OutputConfig::builder();
        for table in file.output {
            if let Some(name) = &table.name {
                builder.name(name);
            }
            if let Some(mode) = &table.mode {
                builder.mode(mode);
            }
            if let Some(transform) = &table.transform {
                builder.transform(transform);
            }
            builder.finish_section();
        }
        Ok(builder.build())
    }

    /// Read a toml configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<OutputConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        OutputConfig::from_toml_str(&content)
    }

    /// Overrides for the output called `name`
    ///
    /// If a name is configured more than once, the last section wins.
    pub fn get(&self, name: &str) -> Option<&OutputSection> {
        self.sections.iter().rev().find(|section| section.name == name)
    }

    /// All sections in the order they were read
    pub fn sections(&self) -> &[OutputSection] {
        &self.sections
    }
}

/// Accumulates key/value pairs of output sections
///
/// Keys may come in any order, [`finish_section`](Self::finish_section) closes the
/// section they belong to.
#[derive(Debug, Default)]
pub struct OutputConfigBuilder {
    name: Option<String>,
    mode: Option<String>,
    transform: Option<String>,
    sections: Vec<OutputSection>,
}

impl OutputConfigBuilder {
    /// Set the name of the current section
    pub fn name(&mut self, name: &str) -> &mut Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Set the mode value of the current section
    pub fn mode(&mut self, mode: &str) -> &mut Self {
        self.mode = Some(mode.to_owned());
        self
    }

    /// Set the transform value of the current section
    pub fn transform(&mut self, transform: &str) -> &mut Self {
        self.transform = Some(transform.to_owned());
        self
    }

    /// Close the current section
    ///
    /// Sections without a name, for X11 outputs (names starting with `X`), or
    /// with neither mode nor transform are dropped.
    pub fn finish_section(&mut self) -> &mut Self {
        let name = self.name.take();
        let mode = self.mode.take();
        let transform = self.transform.take();

        let Some(name) = name else {
            return self;
        };
        if name.starts_with('X') || (mode.is_none() && transform.is_none()) {
            return self;
        }

        let mode = mode.and_then(|value| {
            let parsed = ModeOverride::parse(&value);
            if parsed.is_none() {
                warn!("Invalid mode \"{}\" for output {}", value, name);
            }
            parsed
        });
        let transform = match transform.as_deref().map(str::parse::<Transform>) {
            None => Transform::Normal,
            Some(Ok(transform)) => transform,
            Some(Err(err)) => {
                warn!("Invalid transform for output {}: {}", name, err);
                Transform::Normal
            }
        };

        self.sections.push(OutputSection { name, mode, transform });
        self
    }

    /// All finished sections, an unfinished one is discarded
    pub fn build(&mut self) -> OutputConfig {
        OutputConfig {
            sections: std::mem::take(&mut self.sections),
        }
    }
}

/// Startup options of the drm backend
#[derive(Debug, Clone, PartialEq, Eq, clap::Parser)]
#[command(about = "DRM/KMS display backend options")]
pub struct BackendOptions {
    /// Only drive the connector with this id
    #[arg(long)]
    pub connector: Option<u32>,
    /// Seat whose devices are used
    #[arg(long, default_value = "seat0")]
    pub seat: String,
    /// Virtual terminal to run on, handed to the session by the caller
    #[arg(long)]
    pub tty: Option<u32>,
    /// Composite on the cpu instead of the gpu
    ///
    /// The caller builds the matching [`Renderer`](crate::backend::renderer::Renderer).
    #[arg(long)]
    pub use_pixman: bool,
    /// Keep the mode each crtc is already programmed with
    #[arg(long)]
    pub current_mode: bool,
    /// Put surfaces on hardware overlay planes
    #[arg(long)]
    pub overlay_planes: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            connector: None,
            seat: String::from("seat0"),
            tty: None,
            use_pixman: false,
            current_mode: false,
            overlay_planes: false,
        }
    }
}

impl BackendOptions {
    /// Debug flags the backend starts with
    pub fn debug_flags(&self) -> DebugFlags {
        if self.overlay_planes {
            DebugFlags::empty()
        } else {
            DebugFlags::DISABLE_OVERLAYS
        }
    }
}
