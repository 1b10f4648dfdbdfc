//! Display output through kernel mode-setting.
//!
//! A [`DrmBackend`] drives every display attached to one drm device through the
//! legacy KMS interface:
//!
//! - each connected connector is paired with a free crtc and becomes a [`DrmOutput`],
//!   outputs are laid out left to right and follow connector hotplug,
//! - every repaint puts a new buffer on the primary plane with a page-flip. Client
//!   buffers may be scanned out directly, shown on the hardware cursor or on an
//!   overlay plane, see [`DrmBackend::assign_planes`],
//! - completion of the page-flip and of every overlay update queued with it is read
//!   from the device and turned into one [`FrameCompletion`] per frame.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # #[cfg(all(feature = "backend_drm", feature = "backend_udev"))]
//! # fn run(renderer: smithay_kms::backend::renderer::Renderer) -> Result<(), Box<dyn std::error::Error>> {
//! use smithay_kms::backend::drm::{DrmBackend, DrmDeviceFd, DrmEventSource};
//! use smithay_kms::backend::udev::primary_gpu;
//! use smithay_kms::config::{BackendOptions, OutputConfig};
//!
//! let options = BackendOptions::default();
//! let path = primary_gpu(&options.seat)?.ok_or("no gpu")?;
//! let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
//! let device = DrmDeviceFd::new(file.into())?;
//! let events = DrmEventSource::new(device.clone());
//! let mut backend = DrmBackend::new(device, renderer, &options, OutputConfig::default())?;
//!
//! let mut event_loop = calloop::EventLoop::<()>::try_new()?;
//! event_loop.handle().insert_source(events, move |event, _, _| {
//!     if let Some(frame) = backend.handle_completion(event) {
//!         println!("{:?} presented at {}ms", frame.output, frame.msecs());
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! The backend talks to the hardware through the [`KmsDevice`] trait, so the whole
//! state machine runs against any implementation of it.

mod assign;
mod buffer;
pub mod device;
mod error;
mod event;
pub mod mode;
mod output;
mod plane;
mod resources;
mod topology;

pub use self::assign::{PlaneAssignment, PlaneSurface, SurfaceId, SurfaceTransform};
pub use self::buffer::{BufferError, BufferHandle, ProducerBuffer, Rejected};
#[cfg(feature = "backend_drm")]
pub use self::device::DrmDeviceFd;
pub use self::device::{ConnectorId, CrtcId, KmsDevice, PlaneId};
pub use self::error::{AccessError, Error};
#[cfg(feature = "backend_drm")]
pub use self::event::DrmEventSource;
pub use self::event::{CompletionEvent, FrameCompletion};
pub use self::mode::{Mode, ModeInfo, ModeList};
pub use self::output::{DebugFlags, DrmOutput, OutputId, OutputState, CURSOR_SIZE};
pub use self::plane::{OverlayPlane, PlaneSlots};
pub use self::resources::ResourceAllocator;
pub use self::topology::{DrmBackend, KEY_C, KEY_O, KEY_V};
