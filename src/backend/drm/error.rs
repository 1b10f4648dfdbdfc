use std::{io, path::PathBuf};

use super::device::{ConnectorId, CrtcId};
use super::output::OutputId;
use crate::backend::backlight::BacklightError;
use crate::backend::renderer::RendererError;

/// A failed ioctl, with the message of what was attempted
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl AccessError {
    /// Wrap an io error raised while talking to a device
    pub fn new(errmsg: &'static str, dev: Option<PathBuf>, source: io::Error) -> AccessError {
        AccessError { errmsg, dev, source }
    }
}

/// Errors thrown by the [`DrmBackend`](super::DrmBackend) and its outputs
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device rejected a request
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The session is not active, the device may not be touched
    #[error("Device is currently paused, operation rejected")]
    DeviceInactive,
    /// A page-flip is still outstanding on the output
    #[error("Output `{0:?}` still has a page-flip pending")]
    FlipPending(OutputId),
    /// No connector produced a usable output
    #[error("No usable outputs found")]
    NoOutputs,
    /// Every CRTC able to drive the connector is taken
    #[error("No free crtc for connector `{0:?}`")]
    NoSuitableCrtc(ConnectorId),
    /// The output was configured off or has no mode to use
    #[error("Connector `{0:?}` has no usable mode")]
    NoUsableMode(ConnectorId),
    /// The output is configured off
    #[error("Connector `{0:?}` is disabled by configuration")]
    OutputDisabled(ConnectorId),
    /// The output is not known to the backend
    #[error("Unknown output `{0:?}`")]
    UnknownOutput(OutputId),
    /// None of the modes of the output match the request
    #[error("No mode {width}x{height}@{refresh}mHz on output `{output:?}`")]
    ModeNotFound {
        /// Output the mode was requested for
        output: OutputId,
        /// Requested width
        width: i32,
        /// Requested height
        height: i32,
        /// Requested refresh rate, 0 for any
        refresh: u32,
    },
    /// The crtc could not be programmed
    #[error("Failed to set mode on crtc `{0:?}`")]
    ModesetFailed(CrtcId, #[source] AccessError),
    /// The renderer is not the kind the options ask for
    #[error("Renderer does not match the requested {requested} rendering")]
    RendererMismatch {
        /// `gpu` or `software`
        requested: &'static str,
    },
    /// Creating the per-output render state failed
    #[error("Renderer setup failed")]
    Renderer(#[from] RendererError),
    /// The backlight could not be changed
    #[error(transparent)]
    Backlight(#[from] BacklightError),
}
