//! Device discovery and hotplug notifications through udev.
//!
//! [`primary_gpu`] finds the drm card a seat should drive. [`HotplugMonitor`] is a
//! [`calloop`] event source reporting changes of drm devices as [`DeviceEvent`]s,
//! which [`DrmBackend::handle_device_event`](crate::backend::drm::DrmBackend::handle_device_event)
//! turns into output updates.

use crate::backend::session::DeviceNumber;

/// What happened to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// A device appeared
    Added,
    /// Properties of a device changed, e.g. a connector was plugged
    Changed,
    /// A device vanished
    Removed,
}

/// A change of a drm device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    #[allow(missing_docs)]
    pub kind: DeviceEventKind,
    /// Kernel number of the device node
    pub sysnum: Option<usize>,
    /// Device number of the device node
    pub devnum: Option<DeviceNumber>,
    /// Whether udev flagged the change as a connector hotplug
    pub hotplug: bool,
}

/// Whether `event` reports a connector hotplug on the device with `sysnum`
pub fn is_hotplug(event: &DeviceEvent, sysnum: usize) -> bool {
    event.sysnum == Some(sysnum) && event.hotplug
}

#[cfg(feature = "backend_udev")]
pub use self::monitor::{all_gpus, device_numbers, primary_gpu, HotplugMonitor};

#[cfg(feature = "backend_udev")]
mod monitor {
    use std::ffi::OsStr;
    use std::io;
    use std::os::unix::io::{AsFd, BorrowedFd};
    use std::path::{Path, PathBuf};

    use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
    use rustix::fs::{major, minor};
    use tracing::{debug, info_span, trace};
    use udev::{DeviceType, Enumerator, EventType, MonitorBuilder, MonitorSocket};

    use super::{DeviceEvent, DeviceEventKind};
    use crate::backend::session::DeviceNumber;

    impl DeviceEvent {
        fn from_udev(event: &udev::Event) -> Option<DeviceEvent> {
            let kind = match event.event_type() {
                EventType::Add => DeviceEventKind::Added,
                EventType::Change => DeviceEventKind::Changed,
                EventType::Remove => DeviceEventKind::Removed,
                _ => return None,
            };
            Some(DeviceEvent {
                kind,
                sysnum: event.sysnum(),
                devnum: event.devnum().map(|dev| (major(dev), minor(dev))),
                hotplug: event.property_value("HOTPLUG") == Some(OsStr::new("1")),
            })
        }
    }

    /// Event source reporting changes of drm devices
    #[derive(Debug)]
    pub struct HotplugMonitor {
        monitor: MonitorSocket,
        token: Option<Token>,
        span: tracing::Span,
    }

    impl HotplugMonitor {
        /// Listen for changes in the drm subsystem
        pub fn new() -> io::Result<HotplugMonitor> {
            let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;
            Ok(HotplugMonitor {
                monitor,
                token: None,
                span: info_span!("backend_udev"),
            })
        }
    }

    impl AsFd for HotplugMonitor {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.monitor.as_fd()
        }
    }

    impl EventSource for HotplugMonitor {
        type Event = DeviceEvent;
        type Metadata = ();
        type Ret = ();
        type Error = io::Error;

        fn process_events<F>(&mut self, _: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
        where
            F: FnMut(DeviceEvent, &mut ()),
        {
            if Some(token) != self.token {
                return Ok(PostAction::Continue);
            }
            let _guard = self.span.enter();
            for event in self.monitor.iter() {
                let Some(event) = DeviceEvent::from_udev(&event) else {
                    continue;
                };
                debug!(?event, "Device changed");
                callback(event, &mut ());
            }
            Ok(PostAction::Continue)
        }

        fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
            let token = factory.token();
            self.token = Some(token);
            // Safety: the socket is owned by `self` and outlives the registration
            unsafe { poll.register(self.as_fd(), Interest::READ, Mode::Level, token) }
        }

        fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
            let token = factory.token();
            self.token = Some(token);
            poll.reregister(self.as_fd(), Interest::READ, Mode::Level, token)
        }

        fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
            self.token = None;
            poll.unregister(self.as_fd())
        }
    }

    fn on_seat(device: &udev::Device, seat: &str) -> bool {
        device.property_value("ID_SEAT").unwrap_or_else(|| OsStr::new("seat0")) == seat
    }

    /// The drm card of `seat` to drive, preferring the one the firmware booted on
    pub fn primary_gpu<S: AsRef<str>>(seat: S) -> io::Result<Option<PathBuf>> {
        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem("drm")?;
        enumerator.match_sysname("card[0-9]*")?;

        let mut result = None;
        for device in enumerator.scan_devices()? {
            if !on_seat(&device, seat.as_ref()) {
                continue;
            }
            if let Some(pci) = device.parent_with_subsystem(Path::new("pci"))? {
                if pci.attribute_value("boot_vga") == Some(OsStr::new("1")) {
                    trace!(path = ?device.syspath(), "Found boot vga device");
                    result = Some(device);
                }
            } else if result.is_none() {
                result = Some(device);
            }
        }
        Ok(result.and_then(|device| device.devnode().map(PathBuf::from)))
    }

    /// All drm cards of `seat`
    pub fn all_gpus<S: AsRef<str>>(seat: S) -> io::Result<Vec<PathBuf>> {
        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem("drm")?;
        enumerator.match_sysname("card[0-9]*")?;
        Ok(enumerator
            .scan_devices()?
            .filter(|device| on_seat(device, seat.as_ref()))
            .flat_map(|device| device.devnode().map(PathBuf::from))
            .collect())
    }

    /// Device number and kernel number of the device node at `devnode`
    ///
    /// These identify the device in session signals and hotplug events.
    pub fn device_numbers(devnode: &Path) -> io::Result<(DeviceNumber, Option<usize>)> {
        let rdev = rustix::fs::stat(devnode)?.st_rdev;
        let device = udev::Device::from_devnum(DeviceType::Character, rdev)?;
        Ok(((major(rdev), minor(rdev)), device.sysnum()))
    }
}
