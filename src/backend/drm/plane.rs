//! Current/next buffer slots and the overlay plane registry.

use tracing::{info, warn};

use super::buffer::BufferHandle;
use super::device::{KmsDevice, PlaneId, PlaneInfo};
use super::output::OutputId;
use crate::backend::format::Fourcc;
use crate::utils::{Buffer, Fixed, Physical, Rectangle};

/// The buffer on screen and the buffer queued to replace it
///
/// `next` is only ever filled while empty; it moves to `current` once the
/// hardware confirms the switch.
#[derive(Debug, Default)]
pub struct PlaneSlots {
    current: Option<BufferHandle>,
    next: Option<BufferHandle>,
}

impl PlaneSlots {
    /// The buffer being scanned out
    pub fn current(&self) -> Option<&BufferHandle> {
        self.current.as_ref()
    }

    /// The buffer queued for the next frame
    pub fn next(&self) -> Option<&BufferHandle> {
        self.next.as_ref()
    }

    /// Whether neither slot holds a buffer
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.next.is_none()
    }

    /// Queue `handle`, giving it back if a buffer is queued already
    pub fn stage(&mut self, handle: BufferHandle) -> Result<(), BufferHandle> {
        if self.next.is_some() {
            return Err(handle);
        }
        self.next = Some(handle);
        Ok(())
    }

    /// Make the queued buffer current, returning the retired one
    pub fn promote(&mut self) -> Option<BufferHandle> {
        let next = self.next.take();
        std::mem::replace(&mut self.current, next)
    }

    pub(crate) fn current_slot(&mut self) -> &mut Option<BufferHandle> {
        &mut self.current
    }

    pub(crate) fn next_slot(&mut self) -> &mut Option<BufferHandle> {
        &mut self.next
    }
}

/// A hardware overlay plane and its scanout state
#[derive(Debug)]
pub struct OverlayPlane {
    info: PlaneInfo,
    pub(crate) slots: PlaneSlots,
    pub(crate) output: Option<OutputId>,
    pub(crate) vblank_pending: bool,
    pub(crate) dst: Rectangle<i32, Physical>,
    pub(crate) src: Rectangle<Fixed, Buffer>,
}

impl OverlayPlane {
    fn new(info: PlaneInfo) -> OverlayPlane {
        OverlayPlane {
            info,
            slots: PlaneSlots::default(),
            output: None,
            vblank_pending: false,
            dst: Rectangle::default(),
            src: Rectangle::default(),
        }
    }

    /// Kernel id of the plane
    pub fn id(&self) -> PlaneId {
        self.info.id
    }

    /// Whether the plane can be shown on the crtc at index `pipe`
    pub fn supports_pipe(&self, pipe: usize) -> bool {
        pipe < 32 && self.info.possible_crtcs & (1 << pipe) != 0
    }

    /// Whether the plane can scan out `format`
    pub fn supports_format(&self, format: Fourcc) -> bool {
        self.info.formats.contains(&format)
    }

    /// Formats the plane can scan out
    pub fn formats(&self) -> &[Fourcc] {
        &self.info.formats
    }

    /// Buffer slots of the plane
    pub fn slots(&self) -> &PlaneSlots {
        &self.slots
    }

    /// Output the plane is showing content for
    pub fn output(&self) -> Option<OutputId> {
        self.output
    }

    /// Whether a vblank event for the last submission is outstanding
    pub fn vblank_pending(&self) -> bool {
        self.vblank_pending
    }

    /// Destination rectangle of the last assignment, crtc-local
    pub fn destination(&self) -> Rectangle<i32, Physical> {
        self.dst
    }

    /// Source rectangle of the last assignment
    pub fn source(&self) -> Rectangle<Fixed, Buffer> {
        self.src
    }

    /// Whether a new buffer may be assigned
    pub fn is_free(&self) -> bool {
        self.slots.next().is_none() && !self.vblank_pending
    }

    // A plane still showing content for one output is not handed to another
    fn usable_by(&self, output: OutputId, pipe: usize) -> bool {
        self.is_free() && self.output.map_or(true, |owner| owner == output) && self.supports_pipe(pipe)
    }
}

/// All overlay planes of the device
#[derive(Debug, Default)]
pub struct OverlayPlanes {
    planes: Vec<OverlayPlane>,
}

impl OverlayPlanes {
    /// Enumerate the overlay planes of `device`
    ///
    /// A device without plane support simply has no overlays.
    pub fn discover<D: KmsDevice>(device: &D) -> OverlayPlanes {
        match device.planes() {
            Ok(planes) => {
                info!("Found {} overlay planes", planes.len());
                OverlayPlanes {
                    planes: planes.into_iter().map(OverlayPlane::new).collect(),
                }
            }
            Err(err) => {
                warn!("Failed to get plane resources: {}", err);
                OverlayPlanes::default()
            }
        }
    }

    /// All planes
    pub fn iter(&self) -> impl Iterator<Item = &OverlayPlane> {
        self.planes.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut OverlayPlane> {
        self.planes.iter_mut()
    }

    /// Plane with the given id
    pub fn get(&self, id: PlaneId) -> Option<&OverlayPlane> {
        self.planes.iter().find(|plane| plane.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: PlaneId) -> Option<&mut OverlayPlane> {
        self.planes.iter_mut().find(|plane| plane.id() == id)
    }

    /// Whether any free plane can be shown on `pipe` for `output`
    pub fn has_free(&self, output: OutputId, pipe: usize) -> bool {
        self.planes
            .iter()
            .any(|plane| plane.usable_by(output, pipe))
    }

    pub(crate) fn find_free(
        &mut self,
        output: OutputId,
        pipe: usize,
        format: Fourcc,
    ) -> Option<&mut OverlayPlane> {
        self.planes
            .iter_mut()
            .find(|plane| plane.usable_by(output, pipe) && plane.supports_format(format))
    }
}
