//! Distribution of surfaces over the hardware planes of an output.
//!
//! Surfaces are examined front to back. Each one goes to the first plane that
//! accepts it, in the order cursor, direct scanout, overlay, with the renderer's
//! primary plane as the fallback. A surface overlapping anything already left to
//! the renderer stays with the renderer as well, otherwise it would end up
//! stacked above content that is supposed to cover it.

use std::cmp;
use std::rc::Rc;

use tracing::{instrument, trace};

use super::buffer::ProducerBuffer;
use super::device::{KmsDevice, PlaneId};
use super::output::{CursorClaim, DebugFlags, DrmOutput, KmsContext, CURSOR_SIZE};
use crate::backend::format::Fourcc;
use crate::backend::renderer::{ClientBuffer, Renderer};
use crate::utils::{
    Buffer, Coordinate, Fixed, Logical, Physical, Point, Rectangle, Region, Size, Transform,
};

/// Identifier the compositor gives its surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Mapping of surface-local to global coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SurfaceTransform {
    /// Plain translation to the surface's position
    #[default]
    Identity,
    /// A column-major 4x4 matrix, translation included
    Matrix([f32; 16]),
}

impl SurfaceTransform {
    /// Whether a plane can reproduce the transform by scaling and positioning alone
    pub fn is_plane_compatible(&self) -> bool {
        let SurfaceTransform::Matrix(m) = self else {
            return true;
        };
        m.iter().enumerate().all(|(i, value)| match i {
            10 | 15 => *value == 1.0,
            0 | 5 => *value != 0.0,
            12 | 13 => true,
            _ => *value == 0.0,
        })
    }

    fn is_identity(&self) -> bool {
        matches!(self, SurfaceTransform::Identity)
    }

    // only meaningful for plane compatible transforms
    fn from_global(&self, origin: Point<i32, Logical>, global: Point<i32, Logical>) -> Point<Fixed, Buffer> {
        match self {
            SurfaceTransform::Identity => (
                Fixed::from_int(global.x - origin.x),
                Fixed::from_int(global.y - origin.y),
            )
                .into(),
            SurfaceTransform::Matrix(m) => (
                Fixed::from_f64((global.x as f64 - m[12] as f64) / m[0] as f64),
                Fixed::from_f64((global.y as f64 - m[13] as f64) / m[5] as f64),
            )
                .into(),
        }
    }
}

/// What the plane assignment needs to know about a surface
#[derive(Debug, Clone)]
pub struct PlaneSurface {
    /// The surface
    pub id: SurfaceId,
    /// Position and untransformed size in the global space
    pub geometry: Rectangle<i32, Logical>,
    /// Area covered after the surface transform, in the global space
    pub bounding_box: Rectangle<i32, Logical>,
    /// Opaque part of the surface, in the global space
    pub opaque: Region<Logical>,
    /// Opacity, 1.0 is fully opaque
    pub alpha: f32,
    /// Attached buffer
    pub buffer: Option<Rc<dyn ClientBuffer>>,
    /// Transform the client rendered the buffer with
    pub buffer_transform: Transform,
    #[allow(missing_docs)]
    pub transform: SurfaceTransform,
    /// One bit per [`OutputId`](super::OutputId) the surface is visible on
    pub output_mask: u32,
    /// Whether the buffer contents changed since the last repaint
    pub damaged: bool,
}

impl PlaneSurface {
    /// An opaque surface at `geometry` without a buffer
    pub fn new(id: SurfaceId, geometry: Rectangle<i32, Logical>) -> PlaneSurface {
        PlaneSurface {
            id,
            geometry,
            bounding_box: geometry,
            opaque: Region::new(),
            alpha: 1.0,
            buffer: None,
            buffer_transform: Transform::Normal,
            transform: SurfaceTransform::Identity,
            output_mask: 0,
            damaged: false,
        }
    }

    fn is_shm(&self) -> bool {
        self.buffer.as_ref().map_or(false, |buffer| buffer.shm().is_some())
    }
}

/// Plane chosen for a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneAssignment {
    /// Composited by the renderer
    Primary,
    /// Shown on the hardware cursor
    Cursor,
    /// The surface's buffer replaces the primary framebuffer
    Scanout,
    /// Shown on the given overlay plane
    Overlay(PlaneId),
}

impl DrmOutput {
    /// Choose a plane for each of `surfaces`, ordered front to back
    ///
    /// Buffers of surfaces put on scanout or overlay planes are registered right
    /// away and presented by the next [`repaint`](super::DrmBackend::repaint).
    /// While a flip is pending or the session is inactive everything is left
    /// to the renderer.
    #[profiling::function]
    #[instrument(level = "trace", parent = &self.span, skip_all)]
    pub(crate) fn assign_planes<D: KmsDevice>(
        &mut self,
        ctx: &mut KmsContext<D>,
        surfaces: &[PlaneSurface],
    ) -> Vec<(SurfaceId, PlaneAssignment)> {
        self.cursor.claim = None;
        let idle = ctx.active && !self.flip_pending() && !self.vblank_pending() && !self.destroy_pending();

        let mut overlap = Region::<Logical>::new();
        surfaces
            .iter()
            .map(|surface| {
                let assignment = if !idle || overlap.intersects_rect(surface.bounding_box) {
                    PlaneAssignment::Primary
                } else if self.try_cursor(ctx, surface) {
                    PlaneAssignment::Cursor
                } else if self.try_scanout(ctx, surface) {
                    PlaneAssignment::Scanout
                } else if let Some(plane) = self.try_overlay(ctx, surface) {
                    PlaneAssignment::Overlay(plane)
                } else {
                    PlaneAssignment::Primary
                };
                if assignment == PlaneAssignment::Primary {
                    overlap.union_rect(surface.bounding_box);
                }
                trace!(surface = ?surface.id, ?assignment);
                (surface.id, assignment)
            })
            .collect()
    }

    fn try_cursor<D: KmsDevice>(&mut self, ctx: &KmsContext<D>, surface: &PlaneSurface) -> bool {
        if !ctx.renderer.is_gpu()
            || ctx.cursors_broken
            || ctx.debug.contains(DebugFlags::DISABLE_CURSOR_PLANE)
            || !self.cursor.available()
            || self.transform != Transform::Normal
            || self.cursor.claim.is_some()
            || surface.output_mask != self.id.mask()
        {
            return false;
        }
        let Some(buffer) = surface.buffer.as_ref().filter(|buffer| buffer.shm().is_some()) else {
            return false;
        };
        let size = surface.geometry.size;
        if size.w > CURSOR_SIZE as i32 || size.h > CURSOR_SIZE as i32 {
            return false;
        }

        self.cursor.claim = Some(CursorClaim {
            surface: surface.id,
            buffer: buffer.clone(),
            position: surface.geometry.loc,
            damaged: surface.damaged,
        });
        true
    }

    fn try_scanout<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>, surface: &PlaneSurface) -> bool {
        let Renderer::Gpu(gpu) = &mut ctx.renderer else {
            return false;
        };
        let Some(buffer) = &surface.buffer else {
            return false;
        };
        let mode = self.mode_size();
        let size = buffer.size();
        if self.primary.next().is_some()
            || surface.geometry.loc != self.position
            || (size.w, size.h) != (mode.w, mode.h)
            || surface.buffer_transform != self.transform
            || !surface.transform.is_identity()
        {
            return false;
        }

        let Some(bo) = gpu.import_client_buffer(&**buffer) else {
            trace!("Buffer can not be used for scanout");
            return false;
        };
        let format = match bo.format() {
            Fourcc::Xrgb8888 => Fourcc::Xrgb8888,
            // per-pixel alpha is only acceptable if nothing below shows through
            Fourcc::Argb8888 if surface.opaque.contains_rect(self.geometry()) => Fourcc::Xrgb8888,
            format => {
                trace!(?format, "Buffer format is not opaque over the whole output");
                return false;
            }
        };

        match ctx
            .buffers
            .acquire_from_producer(ProducerBuffer::Imported(bo), Some(format))
        {
            Ok(mut handle) => {
                handle.attach_client_reference(buffer.clone());
                match self.primary.stage(handle) {
                    Ok(()) => true,
                    Err(handle) => {
                        let _ = ctx.buffers.release(handle);
                        false
                    }
                }
            }
            Err(rejected) => {
                trace!("Scanout buffer rejected: {}", rejected.error);
                false
            }
        }
    }

    fn try_overlay<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>, surface: &PlaneSurface) -> Option<PlaneId> {
        if ctx.debug.contains(DebugFlags::DISABLE_OVERLAYS)
            || ctx.buffers.single_plane_only()
            || surface.buffer_transform != self.transform
            || surface.output_mask != self.id.mask()
            || surface.alpha != 1.0
            || surface.is_shm()
            || !surface.transform.is_plane_compatible()
        {
            return None;
        }
        let buffer = surface.buffer.as_ref()?;
        let Renderer::Gpu(gpu) = &mut ctx.renderer else {
            return None;
        };
        if !ctx.overlays.has_free(self.id, self.pipe) {
            return None;
        }
        let (dst, src) = self.overlay_geometry(surface)?;

        let bo = gpu.import_client_buffer(&**buffer)?;
        let format = match bo.format() {
            Fourcc::Argb8888 if surface.opaque.contains_rect(surface.bounding_box) => Fourcc::Xrgb8888,
            format => format,
        };
        let Some(plane) = ctx.overlays.find_free(self.id, self.pipe, format) else {
            trace!(?format, "No free overlay plane supports the format");
            return None;
        };

        let mut handle = match ctx
            .buffers
            .acquire_from_producer(ProducerBuffer::Imported(bo), Some(format))
        {
            Ok(handle) => handle,
            Err(rejected) => {
                trace!("Overlay buffer rejected: {}", rejected.error);
                return None;
            }
        };
        handle.attach_client_reference(buffer.clone());
        if let Err(handle) = plane.slots.stage(handle) {
            let _ = ctx.buffers.release(handle);
            return None;
        }
        plane.output = Some(self.id);
        plane.dst = dst;
        plane.src = src;
        Some(plane.id())
    }

    /// Destination on the crtc and source in the buffer of a surface shown on an overlay
    ///
    /// The source is stored in 24.8 fixed point.
    pub(crate) fn overlay_geometry(
        &self,
        surface: &PlaneSurface,
    ) -> Option<(Rectangle<i32, Physical>, Rectangle<Fixed, Buffer>)> {
        let output = self.geometry();
        let visible = surface.bounding_box.intersection(output)?;

        let area: Size<i32, Physical> = (output.size.w, output.size.h).into();
        let dst = self
            .transform
            .transform_rect_in(visible.to_output_local(output.loc), &area);

        let size = surface.geometry.size;
        let top_left = surface.transform.from_global(surface.geometry.loc, visible.loc);
        let bottom_right = surface
            .transform
            .from_global(surface.geometry.loc, visible.bottom_right());
        let (width, height) = (Fixed::from_int(size.w), Fixed::from_int(size.h));
        let x1 = cmp::max(top_left.x, Fixed::ZERO);
        let y1 = cmp::max(top_left.y, Fixed::ZERO);
        let x2 = cmp::min(bottom_right.x, width);
        let y2 = cmp::min(bottom_right.y, height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let src = Rectangle::from_extremities((x1, y1), (x2, y2));
        let src = surface
            .buffer_transform
            .transform_rect_in(src, &Size::from((width, height)));
        Some((dst, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::device::mock::Call;
    use crate::backend::drm::output::tests::{fixture, gpu, Fixture};
    use crate::backend::renderer::test::TestClientBuffer;

    fn fullscreen(id: u64, format: Fourcc) -> PlaneSurface {
        let mut surface = PlaneSurface::new(SurfaceId(id), Rectangle::from_loc_and_size((0, 0), (1920, 1080)));
        surface.buffer = Some(TestClientBuffer::gpu(1920, 1080, format));
        surface.output_mask = 1;
        surface
    }

    fn video(id: u64, loc: (i32, i32), size: (i32, i32)) -> PlaneSurface {
        let mut surface = PlaneSurface::new(SurfaceId(id), Rectangle::from_loc_and_size(loc, size));
        surface.buffer = Some(TestClientBuffer::gpu(size.0, size.1, Fourcc::Xrgb8888));
        surface.output_mask = 1;
        surface
    }

    fn cursor(id: u64, loc: (i32, i32)) -> PlaneSurface {
        let mut surface = PlaneSurface::new(SurfaceId(id), Rectangle::from_loc_and_size(loc, (24, 24)));
        surface.buffer = Some(TestClientBuffer::shm(24, 24, 0x80));
        surface.output_mask = 1;
        surface.damaged = true;
        surface
    }

    fn with_overlays() -> Fixture {
        let (renderer, _) = gpu();
        let mut fixture = fixture(renderer);
        fixture.ctx.debug.remove(DebugFlags::DISABLE_OVERLAYS);
        fixture
    }

    fn assigned(fixture: &mut Fixture, surfaces: &[PlaneSurface]) -> Vec<PlaneAssignment> {
        fixture
            .output
            .assign_planes(&mut fixture.ctx, surfaces)
            .into_iter()
            .map(|(_, assignment)| assignment)
            .collect()
    }

    #[test]
    fn opaque_fullscreen_is_scanned_out() {
        let mut f = with_overlays();
        assert_eq!(
            assigned(&mut f, &[fullscreen(1, Fourcc::Xrgb8888)]),
            vec![PlaneAssignment::Scanout]
        );
        let next = f.output.primary_plane().next().unwrap();
        assert_eq!(next.format(), Fourcc::Xrgb8888);
        assert!(next.client_buffer().is_some());

        // presenting it does not involve the renderer
        let damage = Region::from(f.output.geometry());
        f.output.repaint(&mut f.ctx, &damage).unwrap();
        assert_eq!(f.device.count(|c| matches!(c, Call::PageFlip { .. })), 1);
    }

    #[test]
    fn argb_scanout_needs_full_opaque_region() {
        let mut f = with_overlays();
        let mut surface = fullscreen(1, Fourcc::Argb8888);
        surface.opaque = Region::from(Rectangle::from_loc_and_size((0, 0), (1920, 1080)));
        assert_eq!(assigned(&mut f, &[surface]), vec![PlaneAssignment::Scanout]);
        assert_eq!(f.output.primary_plane().next().unwrap().format(), Fourcc::Xrgb8888);

        let mut f = with_overlays();
        let mut surface = fullscreen(1, Fourcc::Argb8888);
        // one row short
        surface.opaque = Region::from(Rectangle::from_loc_and_size((0, 0), (1920, 1069)));
        let result = assigned(&mut f, &[surface]);
        assert_ne!(result, vec![PlaneAssignment::Scanout]);
        assert!(f.output.primary_plane().next().is_none());
    }

    #[test]
    fn partial_overlap_with_primary_stays_primary() {
        let mut f = with_overlays();
        let mut window = PlaneSurface::new(SurfaceId(1), Rectangle::from_loc_and_size((100, 100), (400, 300)));
        window.buffer = Some(TestClientBuffer::shm(400, 300, 0));
        window.output_mask = 1;

        let surfaces = [window, video(2, (450, 350), (640, 360)), video(3, (1200, 600), (320, 240))];
        let result = assigned(&mut f, &surfaces);
        assert_eq!(result[0], PlaneAssignment::Primary);
        assert_eq!(result[1], PlaneAssignment::Primary);
        assert!(matches!(result[2], PlaneAssignment::Overlay(_)));

        // the same input gives the same answer
        let mut g = with_overlays();
        assert_eq!(assigned(&mut g, &surfaces), result);
    }

    #[test]
    fn cursor_claimed_once_per_output() {
        let mut f = with_overlays();
        let result = assigned(&mut f, &[cursor(1, (10, 10)), cursor(2, (500, 500))]);
        assert_eq!(result, vec![PlaneAssignment::Cursor, PlaneAssignment::Primary]);

        f.ctx.cursors_broken = true;
        assert_eq!(assigned(&mut f, &[cursor(1, (10, 10))]), vec![PlaneAssignment::Primary]);
    }

    #[test]
    fn overlays_start_disabled() {
        let (renderer, _) = gpu();
        let mut f = fixture(renderer);
        f.ctx.debug = DebugFlags::DISABLE_OVERLAYS;
        assert_eq!(assigned(&mut f, &[video(1, (10, 10), (320, 240))]), vec![PlaneAssignment::Primary]);
    }

    #[test]
    fn overlay_rules() {
        let mut f = with_overlays();
        let mut translucent = video(1, (10, 10), (320, 240));
        translucent.alpha = 0.5;
        let mut elsewhere = video(2, (10, 300), (320, 240));
        elsewhere.output_mask = 0b11;
        let mut rotated = video(3, (10, 600), (320, 240));
        rotated.transform = SurfaceTransform::Matrix([
            0.0, 1.0, 0.0, 0.0, //
            -1.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            10.0, 600.0, 0.0, 1.0,
        ]);
        let result = assigned(&mut f, &[translucent, elsewhere, rotated]);
        assert_eq!(result, vec![PlaneAssignment::Primary; 3]);
    }

    #[test]
    fn flipped_transform_is_plane_compatible() {
        let flip = SurfaceTransform::Matrix([
            -1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            330.0, 10.0, 0.0, 1.0,
        ]);
        assert!(flip.is_plane_compatible());
        assert!(SurfaceTransform::Identity.is_plane_compatible());
    }

    #[test]
    fn overlay_geometry_is_clipped_to_output() {
        let (renderer, _) = gpu();
        let f = fixture(renderer);
        // hangs 20px off the left and 40px off the bottom edge
        let surface = video(1, (-20, 1000), (320, 120));

        let (dst, src) = f.output.overlay_geometry(&surface).unwrap();
        assert_eq!(dst, Rectangle::from_loc_and_size((0, 1000), (300, 80)));
        assert_eq!(src.loc, Point::from((Fixed::from_int(20), Fixed::from_int(0))));
        assert_eq!(src.size, Size::from((Fixed::from_int(300), Fixed::from_int(80))));
        assert_eq!(src.size.w.to_16_16(), 300 << 16);
    }

    #[test]
    fn assigned_overlay_is_committed() {
        let mut f = with_overlays();
        let result = assigned(&mut f, &[video(1, (100, 100), (640, 360))]);
        let PlaneAssignment::Overlay(plane) = result[0] else {
            panic!("expected an overlay, got {:?}", result[0]);
        };

        let damage = Region::from(f.output.geometry());
        f.output.repaint(&mut f.ctx, &damage).unwrap();
        assert_eq!(
            f.device.count(|c| matches!(c, Call::SetPlane { plane: p, config, .. } if *p == plane && config.fb.is_some())),
            1
        );
        assert!(f.device.calls().contains(&Call::QueueVblank { pipe: 0, plane }));
        assert!(f.output.vblank_pending());
    }

    #[test]
    fn nothing_assigned_while_flip_pending() {
        let mut f = with_overlays();
        let damage = Region::from(f.output.geometry());
        f.output.repaint(&mut f.ctx, &damage).unwrap();
        assert_eq!(
            assigned(&mut f, &[fullscreen(1, Fourcc::Xrgb8888), cursor(2, (0, 0))]),
            vec![PlaneAssignment::Primary; 2]
        );
    }

    #[test]
    fn nothing_assigned_until_overlay_vblank() {
        let mut f = with_overlays();
        assigned(&mut f, &[video(1, (100, 100), (640, 360))]);
        let damage = Region::from(f.output.geometry());
        f.output.repaint(&mut f.ctx, &damage).unwrap();
        let _ = f.output.on_page_flip(&mut f.ctx, std::time::Duration::ZERO);
        assert!(f.output.vblank_pending());
        assert_eq!(
            assigned(&mut f, &[video(1, (100, 100), (640, 360))]),
            vec![PlaneAssignment::Primary]
        );
    }
}
