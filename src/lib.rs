#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like VGA
#![allow(clippy::upper_case_acronyms)]

//! # smithay-kms: a DRM/KMS display backend
//!
//! This crate drives the displays of a Wayland compositor through the kernel's
//! mode-setting interface. It discovers connectors, lays outputs out, presents
//! frames with page-flips and puts client buffers on hardware planes where it can.
//!
//! ## Structure of the crate
//!
//! - [`backend`] contains the display backend itself and its boundaries to the
//!   renderer, the session, udev and input devices.
//! - [`config`] holds per-output configuration and startup options.
//! - [`utils`] provides the geometry types shared by all of them.
//!
//! ### The event loop
//!
//! Everything runs on one thread, driven by a [`calloop`] event loop. The drm device
//! and the udev monitor are event sources whose events are fed into the backend.
//!
//! ### Logging
//!
//! The crate logs through [`tracing`]. Every output has its own span, so messages
//! can be attributed to the display they concern.

pub mod backend;
pub mod config;
pub mod utils;
