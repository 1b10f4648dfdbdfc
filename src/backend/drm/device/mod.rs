//! Access to a kernel mode-setting device.
//!
//! Everything the backend does to the hardware goes through the [`KmsDevice`] trait,
//! which mirrors the legacy (non-atomic) KMS ioctls. [`DrmDeviceFd`] implements it on
//! top of an open DRM node.

use std::fmt;
use std::path::PathBuf;

use super::error::AccessError;
use super::mode::ModeInfo;
use crate::backend::format::Fourcc;
use crate::utils::{Buffer, Fixed, Physical, Rectangle};

#[cfg(feature = "backend_drm")]
mod fd;
#[cfg(feature = "backend_drm")]
pub use self::fd::DrmDeviceFd;

#[cfg(test)]
pub(crate) mod mock;

macro_rules! kms_id {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }

            impl From<u32> for $name {
                #[inline]
                fn from(raw: u32) -> Self {
                    $name(raw)
                }
            }

            impl From<$name> for u32 {
                #[inline]
                fn from(id: $name) -> u32 {
                    id.0
                }
            }
        )*
    };
}

kms_id! {
    /// Handle of a CRTC
    CrtcId;
    /// Handle of a connector
    ConnectorId;
    /// Handle of an encoder
    EncoderId;
    /// Handle of an overlay plane
    PlaneId;
    /// Handle of a registered framebuffer
    FramebufferId;
    /// Handle of a dumb buffer allocated through the device
    DumbId;
}

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// A display is attached
    Connected,
    /// Nothing is attached
    Disconnected,
    /// The driver cannot tell
    Unknown,
}

macro_rules! connector_interfaces {
    ($($variant:ident => $name:literal,)*) => {
        /// Physical type of a connector
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum ConnectorInterface {
            $($variant,)*
        }

        impl ConnectorInterface {
            /// Prefix used when naming outputs driven by this connector type
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(ConnectorInterface::$variant => $name,)*
                }
            }
        }
    };
}

connector_interfaces! {
    Unknown => "None",
    VGA => "VGA",
    DVII => "DVI",
    DVID => "DVI",
    DVIA => "DVI",
    Composite => "Composite",
    SVideo => "TV",
    LVDS => "LVDS",
    Component => "CTV",
    NinePinDIN => "DIN",
    DisplayPort => "DP",
    HDMIA => "HDMI",
    HDMIB => "HDMI",
    TV => "TV",
    EmbeddedDisplayPort => "eDP",
    Virtual => "UNKNOWN",
    DSI => "UNKNOWN",
    DPI => "UNKNOWN",
    Writeback => "UNKNOWN",
    SPI => "UNKNOWN",
    USB => "UNKNOWN",
}

impl ConnectorInterface {
    /// Whether the connector drives a built-in panel
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ConnectorInterface::LVDS | ConnectorInterface::EmbeddedDisplayPort | ConnectorInterface::DSI
        )
    }
}

/// Sub-pixel layout reported for a connected display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum Subpixel {
    #[default]
    Unknown,
    HorizontalRgb,
    HorizontalBgr,
    VerticalRgb,
    VerticalBgr,
    None,
}

/// Global resources of a device
#[derive(Debug, Clone, Default)]
pub struct ResourceInfo {
    /// All crtcs, in kernel index order
    pub crtcs: Vec<CrtcId>,
    /// All connectors
    pub connectors: Vec<ConnectorId>,
    /// All encoders
    pub encoders: Vec<EncoderId>,
    /// Smallest framebuffer size accepted, `(width, height)`
    pub min_size: (u32, u32),
    /// Largest framebuffer size accepted, `(width, height)`
    pub max_size: (u32, u32),
}

/// State of a connector
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    #[allow(missing_docs)]
    pub id: ConnectorId,
    /// Physical connector type
    pub interface: ConnectorInterface,
    /// Index among connectors of the same type, starting at 1
    pub interface_id: u32,
    #[allow(missing_docs)]
    pub state: ConnectorState,
    /// Modes advertised by the attached display
    pub modes: Vec<ModeInfo>,
    /// Encoders able to drive this connector
    pub encoders: Vec<EncoderId>,
    /// Encoder currently attached, if any
    pub current_encoder: Option<EncoderId>,
    /// Physical size in millimeters
    pub physical_size: (u32, u32),
    #[allow(missing_docs)]
    pub subpixel: Subpixel,
}

impl ConnectorInfo {
    /// Name of the output driven by this connector, e.g. `HDMI1`
    pub fn output_name(&self) -> String {
        format!("{}{}", self.interface.type_name(), self.interface_id)
    }
}

/// State of an encoder
#[derive(Debug, Clone)]
pub struct EncoderInfo {
    #[allow(missing_docs)]
    pub id: EncoderId,
    /// Crtc currently attached, if any
    pub crtc: Option<CrtcId>,
    /// Bitmask over crtc indices this encoder can be routed to
    pub possible_crtcs: u32,
}

/// State of a crtc
#[derive(Debug, Clone)]
pub struct CrtcInfo {
    #[allow(missing_docs)]
    pub id: CrtcId,
    /// Framebuffer being scanned out
    pub framebuffer: Option<FramebufferId>,
    /// Scanout offset into the framebuffer
    pub position: (u32, u32),
    /// Programmed timing, `None` when the crtc is off
    pub mode: Option<ModeInfo>,
}

/// Description of an overlay plane
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    #[allow(missing_docs)]
    pub id: PlaneId,
    /// Bitmask over crtc indices this plane can be shown on
    pub possible_crtcs: u32,
    /// Pixel formats the plane can scan out
    pub formats: Vec<Fourcc>,
}

/// Memory to wrap into a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// `(width, height)` in pixels
    pub size: (u32, u32),
    /// Pixel format of the memory
    pub format: Fourcc,
    /// Bytes per row
    pub pitch: u32,
    /// GEM handle of the memory
    pub handle: u32,
}

/// Which ioctl to register a framebuffer with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Multi-planar, format-aware registration
    Planar,
    /// Single plane registration described by depth and bits per pixel
    Legacy {
        /// Color depth
        depth: u32,
        /// Bits per pixel
        bpp: u32,
    },
}

/// A CPU-mappable buffer allocated by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    #[allow(missing_docs)]
    pub id: DumbId,
    /// GEM handle of the allocation
    pub handle: u32,
    /// Bytes per row
    pub pitch: u32,
    /// Total size in bytes
    pub size: u64,
}

/// Configuration of an overlay plane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneConfig {
    /// Framebuffer to show, `None` disables the plane
    pub fb: Option<FramebufferId>,
    /// Destination on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Source area of the framebuffer in 24.8 fixed point
    pub src: Rectangle<Fixed, Buffer>,
}

impl PlaneConfig {
    /// Configuration turning the plane off
    pub fn disabled() -> PlaneConfig {
        PlaneConfig {
            fb: None,
            dst: Rectangle::default(),
            src: Rectangle::default(),
        }
    }
}

/// Legacy kernel mode-setting operations
///
/// Completion of [`page_flip`](KmsDevice::page_flip) and
/// [`queue_vblank`](KmsDevice::queue_vblank) is reported asynchronously through the
/// device's event stream, see [`DrmEventSource`](super::DrmEventSource).
pub trait KmsDevice: fmt::Debug {
    /// Path of the device node, used in error messages
    fn dev_path(&self) -> Option<PathBuf>;

    /// Query the global resources
    fn resources(&self) -> Result<ResourceInfo, AccessError>;
    /// Query a connector, probing for attached displays
    fn connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, AccessError>;
    /// Query an encoder
    fn encoder(&self, encoder: EncoderId) -> Result<EncoderInfo, AccessError>;
    /// Query a crtc
    fn crtc(&self, crtc: CrtcId) -> Result<CrtcInfo, AccessError>;
    /// Enumerate the overlay planes
    fn planes(&self) -> Result<Vec<PlaneInfo>, AccessError>;

    /// Register memory as a framebuffer
    fn add_framebuffer(
        &self,
        desc: &FramebufferDesc,
        registration: Registration,
    ) -> Result<FramebufferId, AccessError>;
    /// Unregister a framebuffer
    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<(), AccessError>;

    /// Allocate a dumb buffer
    fn create_dumb(&self, size: (u32, u32), format: Fourcc, bpp: u32) -> Result<DumbAllocation, AccessError>;
    /// Free a dumb buffer
    fn destroy_dumb(&self, dumb: DumbId) -> Result<(), AccessError>;
    /// Map a dumb buffer and give its bytes to `f`
    fn with_dumb_mapping(&self, dumb: DumbId, f: &mut dyn FnMut(&mut [u8])) -> Result<(), AccessError>;

    /// Program a crtc; `mode: None` switches it off
    fn set_crtc(
        &self,
        crtc: CrtcId,
        fb: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> Result<(), AccessError>;
    /// Queue a flip to `fb` at the next vblank, with a completion event
    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> Result<(), AccessError>;
    /// Configure an overlay plane
    fn set_plane(&self, plane: PlaneId, crtc: CrtcId, config: &PlaneConfig) -> Result<(), AccessError>;
    /// Request an event at the next vblank of the crtc at `pipe`, tagged with `plane`
    fn queue_vblank(&self, pipe: u32, plane: PlaneId) -> Result<(), AccessError>;

    /// Show a `(width, height)` dumb buffer as cursor, `None` hides it
    fn set_cursor(&self, crtc: CrtcId, buffer: Option<(DumbId, (u32, u32))>) -> Result<(), AccessError>;
    /// Move the cursor, relative to the crtc origin
    fn move_cursor(&self, crtc: CrtcId, position: (i32, i32)) -> Result<(), AccessError>;

    /// Become drm master
    fn acquire_master(&self) -> Result<(), AccessError>;
    /// Give up drm master
    fn release_master(&self) -> Result<(), AccessError>;
}
