//! Display timings and the per-output mode list.

use std::fmt;

use scan_fmt::scan_fmt;

use crate::utils::{Physical, Size};

bitflags::bitflags! {
    /// Sync and scan flags of a display timing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeSyncFlags: u32 {
        /// Positive horizontal sync
        const PHSYNC = 1 << 0;
        /// Negative horizontal sync
        const NHSYNC = 1 << 1;
        /// Positive vertical sync
        const PVSYNC = 1 << 2;
        /// Negative vertical sync
        const NVSYNC = 1 << 3;
        /// Interlaced scanout
        const INTERLACE = 1 << 4;
        /// Every line is scanned twice
        const DBLSCAN = 1 << 5;
        /// Composite sync
        const CSYNC = 1 << 6;
        /// Positive composite sync
        const PCSYNC = 1 << 7;
        /// Negative composite sync
        const NCSYNC = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Origin of a display timing as reported by the kernel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeTypeFlags: u32 {
        /// Built into the driver
        const BUILTIN = 1 << 0;
        /// Preferred by the sink
        const PREFERRED = 1 << 3;
        /// Default mode
        const DEFAULT = 1 << 4;
        /// Defined by the user
        const USERDEF = 1 << 5;
        /// Created by the driver
        const DRIVER = 1 << 6;
    }
}

bitflags::bitflags! {
    /// State flags of an entry in an output's mode list
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OutputModeFlags: u32 {
        /// The mode the output is driven with
        const CURRENT = 1 << 0;
        /// The mode preferred by the display
        const PREFERRED = 1 << 1;
    }
}

/// Raw display timing, laid out like the kernel's mode description
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ModeInfo {
    /// Pixel clock in kHz
    pub clock: u32,
    #[allow(missing_docs)]
    pub hdisplay: u16,
    #[allow(missing_docs)]
    pub hsync_start: u16,
    #[allow(missing_docs)]
    pub hsync_end: u16,
    #[allow(missing_docs)]
    pub htotal: u16,
    #[allow(missing_docs)]
    pub hskew: u16,
    #[allow(missing_docs)]
    pub vdisplay: u16,
    #[allow(missing_docs)]
    pub vsync_start: u16,
    #[allow(missing_docs)]
    pub vsync_end: u16,
    #[allow(missing_docs)]
    pub vtotal: u16,
    #[allow(missing_docs)]
    pub vscan: u16,
    /// Refresh rate in Hz as reported by the kernel
    pub vrefresh: u32,
    /// Sync and scan flags
    pub flags: ModeSyncFlags,
    /// Origin of the mode
    pub mode_type: ModeTypeFlags,
    /// Name of the mode, usually `WIDTHxHEIGHT`
    pub name: String,
}

impl fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {} {} {} {} {} {} {} {} {} {:?} {:?}",
            self.name,
            self.vrefresh,
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.clock,
            self.flags,
            self.mode_type,
        )
    }
}

impl ModeInfo {
    /// Whether the kernel marked this timing as preferred by the sink
    pub fn is_preferred(&self) -> bool {
        self.mode_type.contains(ModeTypeFlags::PREFERRED)
    }
}

/// Refresh rate of a timing in mHz
///
/// Computed from the pixel clock and totals, corrected for interlacing,
/// line doubling and multi-scan.
pub fn calculate_refresh(info: &ModeInfo) -> u32 {
    if info.htotal == 0 || info.vtotal == 0 {
        return 0;
    }
    let htotal = info.htotal as u64;
    let vtotal = info.vtotal as u64;
    let mut refresh = (info.clock as u64 * 1_000_000 / htotal + vtotal / 2) / vtotal;

    if info.flags.contains(ModeSyncFlags::INTERLACE) {
        refresh *= 2;
    }
    if info.flags.contains(ModeSyncFlags::DBLSCAN) {
        refresh /= 2;
    }
    if info.vscan > 1 {
        refresh /= info.vscan as u64;
    }
    refresh as u32
}

/// A modeline could not be understood
#[derive(Debug, thiserror::Error)]
pub enum ModelineError {
    /// Not enough or malformed fields
    #[error("Malformed modeline `{0}`")]
    Malformed(String),
    /// Sync polarity was neither `+` nor `-`
    #[error("Invalid sync flags `{hsync} {vsync}`")]
    SyncFlags {
        /// Horizontal sync token
        hsync: String,
        /// Vertical sync token
        vsync: String,
    },
}

/// Parse an X11 style modeline:
/// `clock_mhz hdisp hsync_start hsync_end htotal vdisp vsync_start vsync_end vtotal ±hsync ±vsync`
pub fn parse_modeline(modeline: &str) -> Result<ModeInfo, ModelineError> {
    let (clock, hdisplay, hsync_start, hsync_end, htotal, vdisplay, vsync_start, vsync_end, vtotal, hsync, vsync) =
        scan_fmt!(
            modeline.trim(),
            "{f} {d} {d} {d} {d} {d} {d} {d} {d} {} {}",
            f32,
            u16,
            u16,
            u16,
            u16,
            u16,
            u16,
            u16,
            u16,
            String,
            String
        )
        .map_err(|_| ModelineError::Malformed(modeline.to_string()))?;

    let mut flags = ModeSyncFlags::empty();
    match hsync.as_str() {
        "+hsync" => flags |= ModeSyncFlags::PHSYNC,
        "-hsync" => flags |= ModeSyncFlags::NHSYNC,
        _ => return Err(ModelineError::SyncFlags { hsync, vsync }),
    }
    match vsync.as_str() {
        "+vsync" => flags |= ModeSyncFlags::PVSYNC,
        "-vsync" => flags |= ModeSyncFlags::NVSYNC,
        _ => return Err(ModelineError::SyncFlags { hsync, vsync }),
    }

    let mut info = ModeInfo {
        clock: (clock * 1000.0) as u32,
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        flags,
        mode_type: ModeTypeFlags::USERDEF,
        name: format!("{}x{}", hdisplay, vdisplay),
        ..Default::default()
    };
    info.vrefresh = (calculate_refresh(&info) + 500) / 1000;
    Ok(info)
}

/// One entry of an output's mode list
#[derive(Debug, Clone, PartialEq)]
pub struct Mode {
    /// Visible size
    pub size: Size<i32, Physical>,
    /// Refresh rate in mHz
    pub refresh: u32,
    /// Current/preferred state
    pub flags: OutputModeFlags,
    /// The timing programmed into the crtc
    pub info: ModeInfo,
}

impl From<ModeInfo> for Mode {
    fn from(info: ModeInfo) -> Self {
        let mut flags = OutputModeFlags::empty();
        if info.is_preferred() {
            flags |= OutputModeFlags::PREFERRED;
        }
        Mode {
            size: (info.hdisplay as i32, info.vdisplay as i32).into(),
            refresh: calculate_refresh(&info),
            flags,
            info,
        }
    }
}

/// The modes known for an output with exactly one marked current
#[derive(Debug, Clone, Default)]
pub struct ModeList {
    modes: Vec<Mode>,
    current: Option<usize>,
}

impl ModeList {
    /// Append a mode, returning its index
    pub fn push(&mut self, mode: Mode) -> usize {
        self.modes.push(mode);
        self.modes.len() - 1
    }

    /// Position of a mode with an identical timing
    pub fn position(&self, info: &ModeInfo) -> Option<usize> {
        self.modes.iter().position(|mode| &mode.info == info)
    }

    /// All modes in enumeration order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Mode> + ExactSizeIterator {
        self.modes.iter()
    }

    /// Number of modes
    pub fn len(&self) -> usize {
        self.modes.len()
    }

    /// Whether the list has no modes
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Mode at the given index
    pub fn get(&self, index: usize) -> Option<&Mode> {
        self.modes.get(index)
    }

    /// Index of the current mode
    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// The current mode
    pub fn current(&self) -> Option<&Mode> {
        self.current.and_then(|idx| self.modes.get(idx))
    }

    /// Index of the mode flagged preferred, the last one if several are
    pub fn preferred_index(&self) -> Option<usize> {
        self.modes
            .iter()
            .rposition(|mode| mode.flags.contains(OutputModeFlags::PREFERRED))
    }

    /// Mark `index` as the one current mode
    pub fn set_current(&mut self, index: usize) {
        if index >= self.modes.len() {
            return;
        }
        if let Some(old) = self.current.and_then(|idx| self.modes.get_mut(idx)) {
            old.flags.remove(OutputModeFlags::CURRENT);
        }
        self.modes[index].flags.insert(OutputModeFlags::CURRENT);
        self.current = Some(index);
    }

    /// Find the mode to use for a `width`x`height` request at `refresh` mHz
    ///
    /// A refresh of 0 accepts any rate. An exact refresh match wins,
    /// otherwise the first mode of the right size is used.
    pub fn choose(&self, width: i32, height: i32, refresh: u32) -> Option<usize> {
        let mut fallback = None;
        for (idx, mode) in self.modes.iter().enumerate() {
            if mode.size.w != width || mode.size.h != height {
                continue;
            }
            if refresh == 0 || mode.refresh == refresh {
                return Some(idx);
            }
            fallback.get_or_insert(idx);
        }
        fallback
    }
}
