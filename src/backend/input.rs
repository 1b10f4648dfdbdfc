//! Input devices of a seat, tied to the session.
//!
//! The [`SeatBridge`] keeps the devices assigned to one seat. They are dropped
//! from the seat while the session is inactive and come back when it is
//! reactivated, with the current keyboard LED state applied again.

use std::fmt;

use bitflags::bitflags;
use indexmap::IndexMap;
use tracing::{debug, info, info_span};

use crate::backend::session::{DeviceNumber, SessionObserver};

bitflags! {
    /// Keyboard LEDs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Leds: u32 {
        #[allow(missing_docs)]
        const NUM_LOCK = 1;
        #[allow(missing_docs)]
        const CAPS_LOCK = 1 << 1;
        #[allow(missing_docs)]
        const SCROLL_LOCK = 1 << 2;
    }
}

/// An input device as far as seat assignment is concerned
pub trait SeatDevice: fmt::Debug {
    /// Kernel name of the device, unique among present devices
    fn sysname(&self) -> String;
    /// Name of the seat the device is assigned to
    fn seat_name(&self) -> String;
    /// Show `leds` on the device, if it has any
    fn set_leds(&mut self, leds: Leds);
}

#[cfg(feature = "backend_libinput")]
impl From<Leds> for ::input::Led {
    fn from(value: Leds) -> Self {
        let mut leds = ::input::Led::empty();
        if value.contains(Leds::NUM_LOCK) {
            leds |= ::input::Led::NUMLOCK;
        }
        if value.contains(Leds::CAPS_LOCK) {
            leds |= ::input::Led::CAPSLOCK;
        }
        if value.contains(Leds::SCROLL_LOCK) {
            leds |= ::input::Led::SCROLLLOCK;
        }
        leds
    }
}

#[cfg(feature = "backend_libinput")]
impl SeatDevice for ::input::Device {
    fn sysname(&self) -> String {
        ::input::Device::sysname(self).to_owned()
    }

    fn seat_name(&self) -> String {
        self.seat().logical_name().to_owned()
    }

    fn set_leds(&mut self, leds: Leds) {
        self.led_update(leds.into());
    }
}

/// Devices of one seat
#[derive(Debug)]
pub struct SeatBridge<T: SeatDevice> {
    seat: String,
    devices: IndexMap<String, T>,
    // held back while the session is inactive
    parked: IndexMap<String, T>,
    leds: Leds,
    active: bool,
    span: tracing::Span,
}

impl<T: SeatDevice> SeatBridge<T> {
    /// An empty bridge for the seat called `seat`
    pub fn new(seat: impl Into<String>) -> SeatBridge<T> {
        let seat = seat.into();
        SeatBridge {
            span: info_span!("seat_bridge", seat = %seat),
            seat,
            devices: IndexMap::new(),
            parked: IndexMap::new(),
            leds: Leds::empty(),
            active: true,
        }
    }

    #[allow(missing_docs)]
    pub fn seat(&self) -> &str {
        &self.seat
    }

    /// Whether the devices are in use
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Devices currently in the seat, in the order they were added
    pub fn devices(&self) -> impl Iterator<Item = &T> {
        self.devices.values()
    }

    /// Add a device, returns `false` if it belongs to another seat
    ///
    /// The device shows the current LED state right away.
    pub fn add_device(&mut self, mut device: T) -> bool {
        let _guard = self.span.enter();
        let seat = device.seat_name();
        if seat != self.seat {
            debug!(device = %device.sysname(), "Ignoring device of {}", seat);
            return false;
        }

        let sysname = device.sysname();
        info!(device = %sysname, "Adding input device");
        if self.active {
            device.set_leds(self.leds);
            self.devices.insert(sysname, device);
        } else {
            self.parked.insert(sysname, device);
        }
        true
    }

    /// Remove the device called `sysname`
    pub fn remove_device(&mut self, sysname: &str) -> Option<T> {
        let device = self
            .devices
            .shift_remove(sysname)
            .or_else(|| self.parked.shift_remove(sysname));
        if device.is_some() {
            info!(parent: &self.span, device = %sysname, "Removing input device");
        }
        device
    }

    #[allow(missing_docs)]
    pub fn leds(&self) -> Leds {
        self.leds
    }

    /// Show `leds` on every device
    pub fn set_leds(&mut self, leds: Leds) {
        self.leds = leds;
        for device in self.devices.values_mut() {
            device.set_leds(leds);
        }
    }

    /// Take all devices out of the seat
    pub fn suspend(&mut self) {
        if !self.active {
            return;
        }
        debug!(parent: &self.span, count = self.devices.len(), "Releasing input devices");
        self.active = false;
        let devices = std::mem::take(&mut self.devices);
        self.parked.extend(devices);
    }

    /// Put the devices back into the seat
    pub fn resume(&mut self) {
        if self.active {
            return;
        }
        debug!(parent: &self.span, count = self.parked.len(), "Restoring input devices");
        self.active = true;
        for (sysname, mut device) in std::mem::take(&mut self.parked) {
            device.set_leds(self.leds);
            self.devices.insert(sysname, device);
        }
    }
}

impl<T: SeatDevice> SessionObserver for SeatBridge<T> {
    fn pause(&mut self, device: Option<DeviceNumber>) {
        if device.is_none() {
            self.suspend();
        }
    }

    fn activate(&mut self, device: Option<DeviceNumber>) {
        if device.is_none() {
            self.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::backend::session::{SessionNotifier, Signal};

    #[derive(Debug)]
    struct FakeDevice {
        name: &'static str,
        seat: &'static str,
        leds: Rc<RefCell<Vec<Leds>>>,
    }

    impl FakeDevice {
        fn new(name: &'static str, seat: &'static str) -> (FakeDevice, Rc<RefCell<Vec<Leds>>>) {
            let leds = Rc::new(RefCell::new(Vec::new()));
            (
                FakeDevice {
                    name,
                    seat,
                    leds: leds.clone(),
                },
                leds,
            )
        }
    }

    impl SeatDevice for FakeDevice {
        fn sysname(&self) -> String {
            self.name.to_owned()
        }
        fn seat_name(&self) -> String {
            self.seat.to_owned()
        }
        fn set_leds(&mut self, leds: Leds) {
            self.leds.borrow_mut().push(leds);
        }
    }

    fn names(bridge: &SeatBridge<FakeDevice>) -> Vec<&'static str> {
        bridge.devices().map(|device| device.name).collect()
    }

    #[test]
    fn devices_of_other_seats_are_ignored() {
        let mut bridge = SeatBridge::new("seat0");
        let (keyboard, _) = FakeDevice::new("event0", "seat0");
        let (mouse, _) = FakeDevice::new("event1", "seat1");
        assert!(bridge.add_device(keyboard));
        assert!(!bridge.add_device(mouse));
        assert_eq!(names(&bridge), vec!["event0"]);

        assert!(bridge.remove_device("event0").is_some());
        assert!(bridge.remove_device("event0").is_none());
    }

    #[test]
    fn leds_reach_every_device() {
        let mut bridge = SeatBridge::new("seat0");
        let (first, first_leds) = FakeDevice::new("event0", "seat0");
        bridge.add_device(first);
        bridge.set_leds(Leds::CAPS_LOCK | Leds::NUM_LOCK);

        let (second, second_leds) = FakeDevice::new("event1", "seat0");
        bridge.add_device(second);
        assert_eq!(first_leds.borrow().last(), Some(&(Leds::CAPS_LOCK | Leds::NUM_LOCK)));
        assert_eq!(*second_leds.borrow(), vec![Leds::CAPS_LOCK | Leds::NUM_LOCK]);
    }

    #[test]
    fn session_switch_parks_devices() {
        let mut notifier = SessionNotifier::new();
        let bridge = Rc::new(RefCell::new(SeatBridge::new("seat0")));
        notifier.register(&bridge);

        let (keyboard, leds) = FakeDevice::new("event0", "seat0");
        bridge.borrow_mut().add_device(keyboard);
        bridge.borrow_mut().set_leds(Leds::SCROLL_LOCK);

        notifier.signal(Signal::PauseSession);
        assert!(!bridge.borrow().is_active());
        assert!(names(&bridge.borrow()).is_empty());

        // per-device signals concern the drm device only
        notifier.signal(Signal::ActivateDevice { major: 13, minor: 64 });
        assert!(!bridge.borrow().is_active());

        let (mouse, _) = FakeDevice::new("event1", "seat0");
        bridge.borrow_mut().add_device(mouse);
        assert!(names(&bridge.borrow()).is_empty());

        notifier.signal(Signal::ActivateSession);
        assert_eq!(names(&bridge.borrow()), vec!["event0", "event1"]);
        assert_eq!(leds.borrow().last(), Some(&Leds::SCROLL_LOCK));
    }
}
