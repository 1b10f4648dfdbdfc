//! Session activation notifications.
//!
//! A session (usually a virtual terminal) can be switched away from and back to.
//! While it is inactive, no device of the session may be touched: the display
//! backend gives up drm master and the input bridge releases its devices.
//!
//! Whatever tracks the session (logind, a VT signal handler, ...) translates its
//! notifications into [`Signal`]s and feeds them to a [`SessionNotifier`], which
//! forwards them to every registered [`SessionObserver`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, info, info_span};

/// Device number, `(major, minor)`
pub type DeviceNumber = (u32, u32);

/// Change of the session or of a single device of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The whole session is about to become inactive
    PauseSession,
    /// A single device is about to be paused
    PauseDevice {
        #[allow(missing_docs)]
        major: u32,
        #[allow(missing_docs)]
        minor: u32,
    },
    /// The session is active again
    ActivateSession,
    /// A single device may be used again
    ActivateDevice {
        #[allow(missing_docs)]
        major: u32,
        #[allow(missing_docs)]
        minor: u32,
    },
}

/// Something that has to react when the session pauses or becomes active again
pub trait SessionObserver {
    /// The session or a device is about to be paused
    ///
    /// If only a specific device is paused, its number is given. Observers not
    /// using that device should ignore the call.
    fn pause(&mut self, device: Option<DeviceNumber>);
    /// The session or a device became active again
    fn activate(&mut self, device: Option<DeviceNumber>);
}

/// Forwards session [`Signal`]s to registered observers
///
/// Observers are held weakly and forgotten once dropped.
#[derive(Debug)]
pub struct SessionNotifier {
    observers: Vec<Weak<RefCell<dyn SessionObserver>>>,
    active: bool,
    span: tracing::Span,
}

impl Default for SessionNotifier {
    fn default() -> Self {
        SessionNotifier::new()
    }
}

impl SessionNotifier {
    /// A notifier for an active session
    pub fn new() -> SessionNotifier {
        SessionNotifier {
            observers: Vec::new(),
            active: true,
            span: info_span!("session"),
        }
    }

    /// Start forwarding signals to `observer`
    pub fn register<O: SessionObserver + 'static>(&mut self, observer: &Rc<RefCell<O>>) {
        let observer: Rc<RefCell<dyn SessionObserver>> = observer.clone();
        self.observers.push(Rc::downgrade(&observer));
    }

    /// Whether the session is currently active
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Forward `signal` to all live observers, in registration order
    pub fn signal(&mut self, signal: Signal) {
        let _guard = self.span.enter();
        match signal {
            Signal::PauseSession => {
                info!("Session paused");
                self.active = false;
            }
            Signal::ActivateSession => {
                info!("Session activated");
                self.active = true;
            }
            Signal::PauseDevice { major, minor } | Signal::ActivateDevice { major, minor } => {
                debug!(?signal, "Device {}:{} changed state", major, minor);
            }
        }

        self.observers.retain(|observer| observer.strong_count() > 0);
        for observer in self.observers.iter().filter_map(Weak::upgrade) {
            let mut observer = observer.borrow_mut();
            match signal {
                Signal::PauseSession => observer.pause(None),
                Signal::PauseDevice { major, minor } => observer.pause(Some((major, minor))),
                Signal::ActivateSession => observer.activate(None),
                Signal::ActivateDevice { major, minor } => observer.activate(Some((major, minor))),
            }
        }
    }
}
