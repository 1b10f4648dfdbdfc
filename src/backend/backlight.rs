//! Panel backlight control.
//!
//! Brightness is exposed to the compositor on a fixed `0..=255` scale, whatever
//! range the underlying device uses. [`normalize`] and [`denormalize`] convert
//! between the two.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::backend::drm::device::ConnectorInfo;

/// Upper bound of the public brightness scale
pub const MAX_PUBLIC_BRIGHTNESS: u32 = 255;

/// Errors of backlight updates
#[derive(Debug, thiserror::Error)]
pub enum BacklightError {
    /// The output has no backlight
    #[error("Output has no backlight")]
    Missing,
    /// The requested value is outside of `0..=255`
    #[error("Brightness {0} is out of range")]
    OutOfRange(u32),
    /// Reading or writing the device failed
    #[error("Failed to access backlight")]
    Io(#[from] io::Error),
}

/// Convert a native brightness to the public scale
pub fn normalize(native: u32, native_max: u32) -> u32 {
    if native_max == 0 {
        return 0;
    }
    (native.min(native_max) as u64 * MAX_PUBLIC_BRIGHTNESS as u64 / native_max as u64) as u32
}

/// Convert a public brightness to the native scale, `None` if out of range
pub fn denormalize(public: u32, native_max: u32) -> Option<u32> {
    if public > MAX_PUBLIC_BRIGHTNESS {
        return None;
    }
    Some((public as u64 * native_max as u64 / MAX_PUBLIC_BRIGHTNESS as u64) as u32)
}

/// A brightness control with a device specific range
pub trait Backlight: fmt::Debug {
    /// Largest native brightness value
    fn max_brightness(&self) -> u32;
    /// Current native brightness
    fn brightness(&self) -> io::Result<u32>;
    /// Set the native brightness
    fn set_brightness(&mut self, native: u32) -> io::Result<()>;
}

/// Kind of a sysfs backlight, in ascending order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BacklightKind {
    /// Direct register access of the gpu driver
    Raw,
    /// Platform specific driver
    Platform,
    /// Firmware interface, e.g. ACPI
    Firmware,
}

impl BacklightKind {
    fn parse(kind: &str) -> Option<BacklightKind> {
        match kind.trim() {
            "raw" => Some(BacklightKind::Raw),
            "platform" => Some(BacklightKind::Platform),
            "firmware" => Some(BacklightKind::Firmware),
            _ => None,
        }
    }
}

fn read_u32(path: &Path) -> io::Result<u32> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Backlight exposed under `/sys/class/backlight`
#[derive(Debug)]
pub struct SysfsBacklight {
    path: PathBuf,
    kind: BacklightKind,
    max_brightness: u32,
}

impl SysfsBacklight {
    /// Open the backlight directory at `path`
    pub fn open(path: impl Into<PathBuf>) -> io::Result<SysfsBacklight> {
        let path = path.into();
        let max_brightness = read_u32(&path.join("max_brightness"))?;
        let kind = fs::read_to_string(path.join("type"))
            .ok()
            .and_then(|kind| BacklightKind::parse(&kind))
            .unwrap_or(BacklightKind::Raw);
        Ok(SysfsBacklight {
            path,
            kind,
            max_brightness,
        })
    }

    /// Interface kind of the backlight
    pub fn kind(&self) -> BacklightKind {
        self.kind
    }

    /// Sysfs directory of the backlight
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backlight for SysfsBacklight {
    fn max_brightness(&self) -> u32 {
        self.max_brightness
    }

    fn brightness(&self) -> io::Result<u32> {
        read_u32(&self.path.join("brightness"))
    }

    fn set_brightness(&mut self, native: u32) -> io::Result<()> {
        fs::write(self.path.join("brightness"), native.min(self.max_brightness).to_string())
    }
}

/// Finds the backlight belonging to a connector
pub trait BacklightProvider: fmt::Debug {
    /// Backlight of `connector`, if it drives a panel with one
    fn backlight_for(&self, connector: &ConnectorInfo) -> Option<Box<dyn Backlight>>;
}

/// Provider that never finds a backlight
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBacklight;

impl BacklightProvider for NoBacklight {
    fn backlight_for(&self, _connector: &ConnectorInfo) -> Option<Box<dyn Backlight>> {
        None
    }
}

/// Provider scanning a sysfs backlight class directory
///
/// Only internal panels get a backlight. If several are present the firmware
/// interface is preferred over the platform one, which is preferred over raw access.
#[derive(Debug, Clone)]
pub struct SysfsBacklightProvider {
    root: PathBuf,
}

impl Default for SysfsBacklightProvider {
    fn default() -> Self {
        SysfsBacklightProvider::new("/sys/class/backlight")
    }
}

impl SysfsBacklightProvider {
    /// Scan `root` instead of `/sys/class/backlight`
    pub fn new(root: impl Into<PathBuf>) -> SysfsBacklightProvider {
        SysfsBacklightProvider { root: root.into() }
    }

    fn candidates(&self) -> io::Result<Vec<SysfsBacklight>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            match SysfsBacklight::open(&path) {
                Ok(backlight) => found.push(backlight),
                Err(err) => debug!("Skipping backlight {}: {}", path.display(), err),
            }
        }
        Ok(found)
    }
}

impl BacklightProvider for SysfsBacklightProvider {
    fn backlight_for(&self, connector: &ConnectorInfo) -> Option<Box<dyn Backlight>> {
        if !connector.interface.is_internal() {
            return None;
        }
        let candidates = match self.candidates() {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!("Failed to enumerate backlights in {}: {}", self.root.display(), err);
                return None;
            }
        };
        let best = candidates.into_iter().max_by_key(|backlight| backlight.kind())?;
        info!(
            "Using backlight {} for {}",
            best.path().display(),
            connector.output_name()
        );
        Some(Box::new(best))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::device::{ConnectorId, ConnectorInterface, ConnectorState, Subpixel};

    fn backlight_dir(root: &Path, name: &str, kind: &str, max: u32, current: u32) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("type"), format!("{}\n", kind)).unwrap();
        fs::write(dir.join("max_brightness"), format!("{}\n", max)).unwrap();
        fs::write(dir.join("brightness"), format!("{}\n", current)).unwrap();
        dir
    }

    fn connector(interface: ConnectorInterface) -> ConnectorInfo {
        ConnectorInfo {
            id: ConnectorId(1),
            interface,
            interface_id: 1,
            state: ConnectorState::Connected,
            modes: Vec::new(),
            encoders: Vec::new(),
            current_encoder: None,
            physical_size: (0, 0),
            subpixel: Subpixel::Unknown,
        }
    }

    #[test]
    fn normalize_round_trip() {
        for max in [1, 7, 255, 937, 120_000] {
            for native in (0..=max).step_by((max as usize / 50).max(1)) {
                let public = normalize(native, max);
                assert!(public <= MAX_PUBLIC_BRIGHTNESS);
                let back = denormalize(public, max).unwrap();
                let tolerance = max / MAX_PUBLIC_BRIGHTNESS + 1;
                assert!(native.abs_diff(back) <= tolerance, "{} -> {} -> {}", native, public, back);
            }
        }
        assert_eq!(denormalize(256, 937), None);
        assert_eq!(denormalize(255, 937), Some(937));
    }

    #[test]
    fn sysfs_brightness() {
        let root = tempfile::tempdir().unwrap();
        let dir = backlight_dir(root.path(), "intel_backlight", "raw", 937, 400);
        let mut backlight = SysfsBacklight::open(&dir).unwrap();

        assert_eq!(backlight.max_brightness(), 937);
        assert_eq!(backlight.brightness().unwrap(), 400);
        backlight.set_brightness(5000).unwrap();
        assert_eq!(backlight.brightness().unwrap(), 937);
    }

    #[test]
    fn provider_prefers_firmware_for_panels() {
        let root = tempfile::tempdir().unwrap();
        backlight_dir(root.path(), "intel_backlight", "raw", 937, 400);
        backlight_dir(root.path(), "acpi_video0", "firmware", 15, 8);
        let provider = SysfsBacklightProvider::new(root.path());

        let panel = provider.backlight_for(&connector(ConnectorInterface::EmbeddedDisplayPort));
        assert_eq!(panel.map(|b| b.max_brightness()), Some(15));
        assert!(provider.backlight_for(&connector(ConnectorInterface::HDMIA)).is_none());
    }
}
