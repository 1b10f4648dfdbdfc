//! Hardware side of the compositor
//!
//! - [`drm`] drives displays through kernel mode-setting,
//! - [`renderer`] is the contract with the renderer drawing the outputs,
//! - [`session`] forwards session (VT) switches to everything holding devices,
//! - [`input`] keeps the input devices of a seat in step with the session,
//! - [`udev`] finds drm devices and reports connector hotplug,
//! - [`backlight`] controls panel brightness.

pub mod backlight;
pub mod drm;
pub mod format;
pub mod input;
pub mod renderer;
pub mod session;
pub mod udev;
