//! Scanout state of a single output.
//!
//! A [`DrmOutput`] drives one crtc/connector pair. Every repaint renders (or takes a
//! directly scanned out client buffer) into the primary plane's `next` slot, queues a
//! page-flip and pushes the cursor and overlay planes assigned to the output. The
//! frame is finished once the page-flip and every overlay vblank queued with it have
//! completed, whichever arrives last.

use std::rc::Rc;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, error, info, info_span, instrument, trace, warn};

use super::assign::SurfaceId;
use super::buffer::{BufferAllocator, BufferHandle, ProducerBuffer, Released, ScanoutLimits};
use super::device::{
    ConnectorId, ConnectorInfo, CrtcId, CrtcInfo, KmsDevice, PlaneConfig, PlaneId, Subpixel,
};
use super::error::Error;
use super::event::FrameCompletion;
use super::mode::{Mode, ModeList};
use super::plane::{OverlayPlanes, PlaneSlots};
use crate::backend::backlight::{self, Backlight, BacklightError};
use crate::backend::format::Fourcc;
use crate::backend::renderer::{ClientBuffer, Renderer, RendererError, ShmBuffer, SoftwareTarget};
use crate::utils::{Buffer, Logical, Physical, Point, Rectangle, Region, Size, Transform};

/// Width and height of the hardware cursor images
pub const CURSOR_SIZE: u32 = 64;

/// Identifier of an output, stable for its lifetime
///
/// Ids are reused after an output is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub u32);

impl OutputId {
    /// Bit of this output in a surface's output mask
    pub fn mask(self) -> u32 {
        1u32.checked_shl(self.0).unwrap_or(0)
    }
}

/// Progress of an output through its first frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// The crtc has not been programmed with the current mode
    Uninitialized,
    /// The mode is set, the first page-flip is in flight
    ModeSet,
    /// Regular page-flipping
    Steady,
}

bitflags! {
    /// Runtime switches of the hardware plane paths
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        /// Never put surfaces on the hardware cursor
        const DISABLE_CURSOR_PLANE = 1;
        /// Never put surfaces on overlay planes
        const DISABLE_OVERLAYS = 1 << 1;
        /// Keep overlay planes assigned but show nothing on them
        const HIDE_OVERLAYS = 1 << 2;
    }
}

/// Device-wide state shared by all outputs
#[derive(Debug)]
pub(crate) struct KmsContext<D: KmsDevice> {
    pub buffers: BufferAllocator<D>,
    pub renderer: Renderer,
    pub overlays: OverlayPlanes,
    pub debug: DebugFlags,
    pub cursors_broken: bool,
    pub active: bool,
}

impl<D: KmsDevice> KmsContext<D> {
    pub fn new(device: D, renderer: Renderer, debug: DebugFlags) -> Result<KmsContext<D>, Error> {
        let resources = device.resources()?;
        let overlays = OverlayPlanes::discover(&device);
        Ok(KmsContext {
            buffers: BufferAllocator::new(device, ScanoutLimits::from(&resources)),
            renderer,
            overlays,
            debug,
            cursors_broken: false,
            active: true,
        })
    }

    pub fn device(&self) -> &D {
        self.buffers.device()
    }

    pub fn set_cursors_broken(&mut self) {
        if !self.cursors_broken {
            warn!("Hardware cursor failed, falling back to composited cursors");
        }
        self.cursors_broken = true;
    }
}

/// Give a handle taken out of a plane slot back to the allocator
///
/// Render buffers go back to the renderer's surface of `output`.
pub(crate) fn retire<D: KmsDevice>(
    buffers: &BufferAllocator<D>,
    renderer: &mut Renderer,
    output: OutputId,
    handle: Option<BufferHandle>,
) {
    let Some(handle) = handle else {
        return;
    };
    if let Released::ReturnToSurface(bo) = buffers.release(handle) {
        match renderer {
            Renderer::Gpu(gpu) => gpu.release_buffer(output, bo),
            Renderer::Software(_) => warn!("Dropping render buffer without a gpu renderer"),
        }
    }
}

#[derive(Debug)]
enum RenderState {
    Detached,
    Gpu,
    Software {
        images: [BufferHandle; 2],
        current_image: usize,
        previous_damage: Region<Logical>,
    },
}

/// Surface shown on the hardware cursor this cycle
#[derive(Debug)]
pub(crate) struct CursorClaim {
    pub surface: SurfaceId,
    pub buffer: Rc<dyn ClientBuffer>,
    pub position: Point<i32, Logical>,
    pub damaged: bool,
}

#[derive(Debug, Default)]
pub(crate) struct CursorPlane {
    images: Option<[BufferHandle; 2]>,
    current: usize,
    pub claim: Option<CursorClaim>,
    shown: Option<SurfaceId>,
    position: Option<Point<i32, Physical>>,
}

impl CursorPlane {
    pub fn available(&self) -> bool {
        self.images.is_some()
    }
}

/// Everything needed to bring up an output on a claimed crtc
#[derive(Debug)]
pub(crate) struct OutputParams {
    pub id: OutputId,
    pub connector: ConnectorInfo,
    pub crtc: CrtcId,
    pub pipe: usize,
    pub original_crtc: Option<CrtcInfo>,
    pub position: Point<i32, Logical>,
    pub transform: Transform,
    pub modes: ModeList,
    pub backlight: Option<Box<dyn Backlight>>,
}

/// A display driven by one crtc
#[derive(Debug)]
pub struct DrmOutput {
    pub(super) id: OutputId,
    name: String,
    pub(super) connector: ConnectorId,
    pub(super) crtc: CrtcId,
    pub(super) pipe: usize,
    original_crtc: Option<CrtcInfo>,
    pub(super) position: Point<i32, Logical>,
    pub(super) transform: Transform,
    modes: ModeList,
    physical_size: (u32, u32),
    subpixel: Subpixel,
    state: OutputState,
    flip_pending: bool,
    pending_vblanks: u32,
    destroy_pending: bool,
    pub(super) primary: PlaneSlots,
    render: RenderState,
    pub(super) cursor: CursorPlane,
    backlight: Option<Box<dyn Backlight>>,
    backlight_current: Option<u32>,
    pub(super) span: tracing::Span,
}

impl DrmOutput {
    pub(crate) fn new<D: KmsDevice>(
        params: OutputParams,
        ctx: &mut KmsContext<D>,
    ) -> Result<DrmOutput, Error> {
        let name = params.connector.output_name();
        let span = info_span!("drm_output", name = %name, crtc = ?params.crtc);
        let backlight_current = params.backlight.as_ref().and_then(|backlight| {
            backlight
                .brightness()
                .map(|native| backlight::normalize(native, backlight.max_brightness()))
                .map_err(|err| warn!("Failed to read backlight: {}", err))
                .ok()
        });

        let mut output = DrmOutput {
            id: params.id,
            name,
            connector: params.connector.id,
            crtc: params.crtc,
            pipe: params.pipe,
            original_crtc: params.original_crtc,
            position: params.position,
            transform: params.transform,
            modes: params.modes,
            physical_size: params.connector.physical_size,
            subpixel: params.connector.subpixel,
            state: OutputState::Uninitialized,
            flip_pending: false,
            pending_vblanks: 0,
            destroy_pending: false,
            primary: PlaneSlots::default(),
            render: RenderState::Detached,
            cursor: CursorPlane::default(),
            backlight: params.backlight,
            backlight_current,
            span,
        };
        output.init_renderer(ctx)?;

        if let Some(mode) = output.current_mode() {
            info!(
                parent: &output.span,
                "Output {} at {:?}, {}x{}@{}mHz",
                output.name,
                output.position,
                mode.size.w,
                mode.size.h,
                mode.refresh
            );
        }
        Ok(output)
    }

    /// Id of the output
    pub fn id(&self) -> OutputId {
        self.id
    }

    /// Name derived from the connector type, e.g. `HDMI1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connector the display is attached to
    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    /// Crtc driving the output
    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    /// Index of the crtc in the device's crtc list
    pub fn pipe(&self) -> usize {
        self.pipe
    }

    /// Top-left corner in the global compositor space
    pub fn position(&self) -> Point<i32, Logical> {
        self.position
    }

    /// Rotation and flip applied to the output's content
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// All modes of the output
    pub fn modes(&self) -> &ModeList {
        &self.modes
    }

    /// The mode the crtc is programmed with
    pub fn current_mode(&self) -> Option<&Mode> {
        self.modes.current()
    }

    /// Physical dimensions in millimeters
    pub fn physical_size(&self) -> (u32, u32) {
        self.physical_size
    }

    #[allow(missing_docs)]
    pub fn subpixel(&self) -> Subpixel {
        self.subpixel
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> OutputState {
        self.state
    }

    /// Whether a page-flip is outstanding
    pub fn flip_pending(&self) -> bool {
        self.flip_pending
    }

    /// Whether any overlay vblank is outstanding
    pub fn vblank_pending(&self) -> bool {
        self.pending_vblanks > 0
    }

    /// Whether the output waits for its last page-flip before it is destroyed
    pub fn destroy_pending(&self) -> bool {
        self.destroy_pending
    }

    /// Brightness on the `0..=255` scale, if the output has a backlight
    pub fn backlight(&self) -> Option<u32> {
        self.backlight_current
    }

    /// Buffers of the primary plane
    pub fn primary_plane(&self) -> &PlaneSlots {
        &self.primary
    }

    /// Size of the current mode in pixels
    pub fn mode_size(&self) -> Size<i32, Physical> {
        self.current_mode().map(|mode| mode.size).unwrap_or_default()
    }

    /// Area covered in the global compositor space
    pub fn geometry(&self) -> Rectangle<i32, Logical> {
        let size = self.mode_size();
        let size: Size<i32, Logical> = self.transform.transform_size((size.w, size.h).into());
        Rectangle::new(self.position, size)
    }

    pub(super) fn set_position(&mut self, position: Point<i32, Logical>) {
        if let RenderState::Software { previous_damage, .. } = &mut self.render {
            previous_damage.translate(position - self.position);
        }
        self.position = position;
    }

    pub(super) fn mark_destroy_pending(&mut self) {
        debug!(parent: &self.span, "Destroying output once its page-flip completes");
        self.destroy_pending = true;
    }

    /// Present the next frame
    ///
    /// Renders `damage` unless a buffer was already put on the primary plane by
    /// direct scanout, then queues the page-flip. The first frame programs the crtc.
    #[profiling::function]
    #[instrument(level = "trace", parent = &self.span, skip_all)]
    pub(crate) fn repaint<D: KmsDevice>(
        &mut self,
        ctx: &mut KmsContext<D>,
        damage: &Region<Logical>,
    ) -> Result<(), Error> {
        if !ctx.active {
            return Err(Error::DeviceInactive);
        }
        if self.flip_pending || self.pending_vblanks > 0 || self.destroy_pending {
            return Err(Error::FlipPending(self.id));
        }

        if self.primary.next().is_none() {
            self.render(ctx, damage);
        }
        let (fb, needs_modeset) = match self.primary.next() {
            Some(next) => (
                next.framebuffer(),
                self.state == OutputState::Uninitialized
                    || self
                        .primary
                        .current()
                        .map_or(true, |current| current.stride() != next.stride()),
            ),
            None => {
                trace!("Nothing to present");
                self.abort_repaint(ctx);
                return Ok(());
            }
        };

        if needs_modeset {
            let mode = self.current_mode().map(|mode| mode.info.clone());
            if let Err(err) = ctx
                .device()
                .set_crtc(self.crtc, Some(fb), (0, 0), &[self.connector], mode.as_ref())
            {
                error!("Failed to set mode: {}", err);
                self.abort_repaint(ctx);
                return Err(Error::ModesetFailed(self.crtc, err));
            }
            self.state = OutputState::ModeSet;
        }

        if let Err(err) = ctx.device().page_flip(self.crtc, fb) {
            error!("Queueing page-flip failed: {}", err);
            self.abort_repaint(ctx);
            return Err(err.into());
        }
        self.flip_pending = true;

        self.update_cursor(ctx);
        self.commit_overlays(ctx);
        Ok(())
    }

    // Nothing was queued, so nothing assigned this cycle may stay staged
    fn abort_repaint<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>) {
        self.cursor.claim = None;
        let KmsContext {
            buffers,
            renderer,
            overlays,
            ..
        } = ctx;
        retire(buffers, renderer, self.id, self.primary.next_slot().take());
        for plane in overlays.iter_mut() {
            if plane.output != Some(self.id) || plane.vblank_pending {
                continue;
            }
            retire(buffers, renderer, self.id, plane.slots.next_slot().take());
            if plane.slots.is_idle() {
                plane.output = None;
            }
        }
    }

    fn render<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>, damage: &Region<Logical>) {
        let id = self.id;
        let KmsContext { buffers, renderer, .. } = ctx;
        let handle = match (&mut self.render, &mut *renderer) {
            (RenderState::Gpu, Renderer::Gpu(gpu)) => {
                gpu.repaint_output(id, damage);
                let Some(bo) = gpu.lock_front_buffer(id) else {
                    warn!("Failed to lock front buffer");
                    return;
                };
                match buffers.acquire_from_producer(ProducerBuffer::Render(bo), Some(Fourcc::Xrgb8888)) {
                    Ok(handle) => handle,
                    Err(rejected) => {
                        warn!("Failed to get framebuffer for render buffer: {}", rejected.error);
                        if let ProducerBuffer::Render(bo) = rejected.buffer {
                            gpu.release_buffer(id, bo);
                        }
                        return;
                    }
                }
            }
            (
                RenderState::Software {
                    images,
                    current_image,
                    previous_damage,
                },
                Renderer::Software(software),
            ) => {
                // the image drawn now was last shown two frames ago
                *current_image ^= 1;
                let image = &images[*current_image];
                let mut total = damage.clone();
                total.union(previous_damage);
                *previous_damage = damage.clone();

                let (w, h) = image.size();
                let target = SoftwareTarget {
                    index: *current_image,
                    size: (w as i32, h as i32).into(),
                    stride: image.stride(),
                    format: image.format(),
                };
                software.set_target_buffer(id, &target);
                let Some(dumb) = image.dumb() else {
                    return;
                };
                let result = buffers.device().with_dumb_mapping(dumb, &mut |pixels| {
                    software.repaint_output(id, &total, pixels)
                });
                if let Err(err) = result {
                    error!("Failed to map output image: {}", err);
                    return;
                }
                match image.image_view(*current_image) {
                    Some(view) => view,
                    None => return,
                }
            }
            (RenderState::Detached, _) => {
                trace!("Output has no render state");
                return;
            }
            _ => {
                error!("Render state does not match the renderer");
                return;
            }
        };

        if let Err(handle) = self.primary.stage(handle) {
            retire(buffers, renderer, id, Some(handle));
        }
    }

    fn update_cursor<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>) {
        let Some(claim) = self.cursor.claim.take() else {
            if let Err(err) = ctx.device().set_cursor(self.crtc, None) {
                debug!("Failed to hide cursor: {}", err);
            }
            self.cursor.shown = None;
            return;
        };
        let Some(images) = &self.cursor.images else {
            return;
        };

        if claim.damaged || self.cursor.shown != Some(claim.surface) {
            self.cursor.current ^= 1;
            let image = &images[self.cursor.current];
            let stride = image.stride() as usize;
            let uploaded = match (image.dumb(), claim.buffer.shm()) {
                (Some(dumb), Some(shm)) => {
                    let size = claim.buffer.size();
                    ctx.device()
                        .with_dumb_mapping(dumb, &mut |pixels| upload_cursor(pixels, stride, shm, size))
                        .and_then(|()| {
                            ctx.device()
                                .set_cursor(self.crtc, Some((dumb, (CURSOR_SIZE, CURSOR_SIZE))))
                        })
                        .map_err(|err| error!("Failed to set cursor: {}", err))
                        .is_ok()
                }
                _ => false,
            };
            if !uploaded {
                ctx.set_cursors_broken();
            }
            self.cursor.shown = Some(claim.surface);
        }

        let position = claim.position.to_output_local(self.position);
        if self.cursor.position != Some(position) {
            if let Err(err) = ctx.device().move_cursor(self.crtc, (position.x, position.y)) {
                error!("Failed to move cursor: {}", err);
                ctx.set_cursors_broken();
            }
            self.cursor.position = Some(position);
        }
    }

    fn commit_overlays<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>) {
        let hidden = ctx.debug.contains(DebugFlags::HIDE_OVERLAYS);
        let KmsContext {
            buffers,
            renderer,
            overlays,
            ..
        } = ctx;

        for plane in overlays.iter_mut() {
            if plane.output != Some(self.id)
                || !plane.supports_pipe(self.pipe)
                || plane.vblank_pending
                || plane.slots.is_idle()
            {
                continue;
            }

            // a plane without a next buffer is switched off and its current one retired
            let fb = if hidden {
                None
            } else {
                plane.slots.next().map(BufferHandle::framebuffer)
            };
            let config = PlaneConfig {
                fb,
                dst: plane.dst,
                src: plane.src,
            };
            if let Err(err) = buffers.device().set_plane(plane.id(), self.crtc, &config) {
                warn!(plane = ?plane.id(), "Failed to update overlay plane: {}", err);
                retire(buffers, renderer, self.id, plane.slots.next_slot().take());
                if plane.slots.is_idle() {
                    plane.output = None;
                }
                continue;
            }

            match buffers.device().queue_vblank(self.pipe as u32, plane.id()) {
                Ok(()) => {
                    plane.vblank_pending = true;
                    self.pending_vblanks += 1;
                }
                Err(err) => {
                    warn!(plane = ?plane.id(), "Vblank event request failed: {}", err);
                    retire(buffers, renderer, self.id, plane.slots.promote());
                    if plane.slots.is_idle() {
                        plane.output = None;
                    }
                }
            }
        }
    }

    /// The page-flip queued by the last repaint completed
    #[instrument(level = "trace", parent = &self.span, skip(self, ctx))]
    pub(crate) fn on_page_flip<D: KmsDevice>(
        &mut self,
        ctx: &mut KmsContext<D>,
        time: Duration,
    ) -> Option<FrameCompletion> {
        if !self.flip_pending {
            debug!("Ignoring page-flip without a pending flip");
            return None;
        }
        self.flip_pending = false;
        let retired = self.primary.promote();
        retire(&ctx.buffers, &mut ctx.renderer, self.id, retired);
        if self.state == OutputState::ModeSet {
            self.state = OutputState::Steady;
        }

        if self.destroy_pending || self.pending_vblanks > 0 {
            return None;
        }
        Some(FrameCompletion { output: self.id, time })
    }

    /// The vblank queued for `plane` passed
    #[instrument(level = "trace", parent = &self.span, skip(self, ctx))]
    pub(crate) fn on_vblank<D: KmsDevice>(
        &mut self,
        ctx: &mut KmsContext<D>,
        plane: PlaneId,
        time: Duration,
    ) -> Option<FrameCompletion> {
        let KmsContext {
            buffers,
            renderer,
            overlays,
            ..
        } = ctx;
        let plane = overlays.get_mut(plane)?;
        if plane.output != Some(self.id) || !plane.vblank_pending {
            debug!("Ignoring vblank without a pending plane update");
            return None;
        }
        plane.vblank_pending = false;
        self.pending_vblanks = self.pending_vblanks.saturating_sub(1);
        retire(buffers, renderer, self.id, plane.slots.promote());
        if plane.slots.is_idle() {
            plane.output = None;
        }

        if self.flip_pending || self.destroy_pending || self.pending_vblanks > 0 {
            return None;
        }
        Some(FrameCompletion { output: self.id, time })
    }

    /// Switch to the mode closest to `width`x`height`@`refresh`, 0 accepting any refresh
    #[instrument(level = "debug", parent = &self.span, skip(self, ctx))]
    pub(crate) fn switch_mode<D: KmsDevice>(
        &mut self,
        ctx: &mut KmsContext<D>,
        width: i32,
        height: i32,
        refresh: u32,
    ) -> Result<(), Error> {
        if self.flip_pending {
            return Err(Error::FlipPending(self.id));
        }
        let Some(index) = self.modes.choose(width, height, refresh) else {
            warn!("Invalid resolution {}x{}", width, height);
            return Err(Error::ModeNotFound {
                output: self.id,
                width,
                height,
                refresh,
            });
        };
        if self.modes.current_index() == Some(index) {
            return Ok(());
        }
        self.modes.set_current(index);

        retire(&ctx.buffers, &mut ctx.renderer, self.id, self.primary.current_slot().take());
        retire(&ctx.buffers, &mut ctx.renderer, self.id, self.primary.next_slot().take());
        self.state = OutputState::Uninitialized;

        self.fini_renderer(ctx);
        self.init_renderer(ctx).map_err(|err| {
            error!("Failed to set up rendering for the new mode: {}", err);
            err
        })
    }

    pub(super) fn init_renderer<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>) -> Result<(), Error> {
        let size = self.mode_size();
        let dimensions = (size.w.max(0) as u32, size.h.max(0) as u32);

        match &mut ctx.renderer {
            Renderer::Gpu(gpu) => {
                gpu.create_output_surface(self.id, size, Fourcc::Xrgb8888)?;
                self.render = RenderState::Gpu;

                if self.cursor.images.is_none() {
                    let cursor_size = (CURSOR_SIZE, CURSOR_SIZE);
                    let first = ctx.buffers.acquire_dumb(cursor_size, Fourcc::Argb8888);
                    let second = ctx.buffers.acquire_dumb(cursor_size, Fourcc::Argb8888);
                    match (first, second) {
                        (Ok(first), Ok(second)) => self.cursor.images = Some([first, second]),
                        (first, second) => {
                            for image in [first, second].into_iter().flatten() {
                                let _ = ctx.buffers.release(image);
                            }
                            if !ctx.cursors_broken {
                                warn!("Cursor buffers unavailable, using composited cursors");
                            }
                            ctx.cursors_broken = true;
                        }
                    }
                }
            }
            Renderer::Software(software) => {
                let first = ctx
                    .buffers
                    .acquire_dumb(dimensions, Fourcc::Xrgb8888)
                    .map_err(RendererError::ImageAllocation)?;
                let second = match ctx.buffers.acquire_dumb(dimensions, Fourcc::Xrgb8888) {
                    Ok(second) => second,
                    Err(err) => {
                        let _ = ctx.buffers.release(first);
                        return Err(RendererError::ImageAllocation(err).into());
                    }
                };
                if let Err(err) = software.create_output(self.id, size) {
                    let _ = ctx.buffers.release(first);
                    let _ = ctx.buffers.release(second);
                    return Err(err.into());
                }
                self.render = RenderState::Software {
                    images: [first, second],
                    current_image: 0,
                    previous_damage: Region::from(self.geometry()),
                };
            }
        }
        Ok(())
    }

    pub(super) fn fini_renderer<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>) {
        match std::mem::replace(&mut self.render, RenderState::Detached) {
            RenderState::Gpu => {
                if let Renderer::Gpu(gpu) = &mut ctx.renderer {
                    gpu.destroy_output_surface(self.id);
                }
            }
            RenderState::Software { images, .. } => {
                if let Renderer::Software(software) = &mut ctx.renderer {
                    software.destroy_output(self.id);
                }
                for image in images {
                    let _ = ctx.buffers.release(image);
                }
            }
            RenderState::Detached => {}
        }
    }

    /// Set the brightness on the `0..=255` scale
    ///
    /// Values above 255 are rejected and leave the backlight untouched.
    pub fn set_backlight(&mut self, value: u32) -> Result<(), BacklightError> {
        let backlight = self.backlight.as_mut().ok_or(BacklightError::Missing)?;
        let native = backlight::denormalize(value, backlight.max_brightness())
            .ok_or(BacklightError::OutOfRange(value))?;
        backlight.set_brightness(native)?;
        self.backlight_current = Some(value);
        Ok(())
    }

    // Disable every overlay showing content for this output and drop its buffers
    fn release_overlays<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>) {
        let KmsContext {
            buffers,
            renderer,
            overlays,
            ..
        } = ctx;
        for plane in overlays.iter_mut() {
            if plane.output != Some(self.id) {
                continue;
            }
            if let Err(err) = buffers
                .device()
                .set_plane(plane.id(), self.crtc, &PlaneConfig::disabled())
            {
                debug!(plane = ?plane.id(), "Failed to disable overlay plane: {}", err);
            }
            retire(buffers, renderer, self.id, plane.slots.next_slot().take());
            retire(buffers, renderer, self.id, plane.slots.current_slot().take());
            plane.vblank_pending = false;
            plane.output = None;
        }
        self.pending_vblanks = 0;
    }

    pub(super) fn suspend<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>) {
        let _guard = self.span.clone().entered();
        if let Err(err) = ctx.device().set_cursor(self.crtc, None) {
            debug!("Failed to hide cursor: {}", err);
        }
        self.cursor.claim = None;
        self.cursor.shown = None;
        self.cursor.position = None;
        self.release_overlays(ctx);
    }

    /// Program the crtc again after the session was reactivated
    ///
    /// A page-flip that was in flight when the session paused never reports back,
    /// its buffer is taken as current.
    pub(super) fn resume<D: KmsDevice>(&mut self, ctx: &mut KmsContext<D>) {
        let _guard = self.span.clone().entered();
        if self.flip_pending {
            self.flip_pending = false;
            let retired = self.primary.promote();
            retire(&ctx.buffers, &mut ctx.renderer, self.id, retired);
        }

        let Some(fb) = self.primary.current().map(BufferHandle::framebuffer) else {
            // the next repaint sets the mode
            self.state = OutputState::Uninitialized;
            return;
        };
        let mode = self.current_mode().map(|mode| mode.info.clone());
        match ctx
            .device()
            .set_crtc(self.crtc, Some(fb), (0, 0), &[self.connector], mode.as_ref())
        {
            Ok(()) => self.state = OutputState::Steady,
            Err(err) => {
                let size = self.mode_size();
                error!(
                    "Failed to set mode {}x{} for output at {:?}: {}",
                    size.w, size.h, self.position, err
                );
                self.state = OutputState::Uninitialized;
            }
        }
    }

    /// Turn the output off and restore the crtc the way it was found
    pub(super) fn destroy<D: KmsDevice>(mut self, ctx: &mut KmsContext<D>) {
        let _guard = self.span.clone().entered();
        info!("Destroying output");

        if let Err(err) = ctx.device().set_cursor(self.crtc, None) {
            debug!("Failed to hide cursor: {}", err);
        }
        if let Some(original) = &self.original_crtc {
            if let Err(err) = ctx.device().set_crtc(
                original.id,
                original.framebuffer,
                original.position,
                &[self.connector],
                original.mode.as_ref(),
            ) {
                warn!("Failed to restore crtc: {}", err);
            }
        }

        self.release_overlays(ctx);
        retire(&ctx.buffers, &mut ctx.renderer, self.id, self.primary.next_slot().take());
        retire(&ctx.buffers, &mut ctx.renderer, self.id, self.primary.current_slot().take());
        self.fini_renderer(ctx);
        if let Some(images) = self.cursor.images.take() {
            for image in images {
                let _ = ctx.buffers.release(image);
            }
        }
    }
}

// Copy a shm cursor into a zero padded cursor image
fn upload_cursor(pixels: &mut [u8], stride: usize, shm: ShmBuffer<'_>, size: Size<i32, Buffer>) {
    pixels.fill(0);
    let row = (size.w.max(0) as usize * 4).min(stride);
    let rows = (size.h.max(0) as u32).min(CURSOR_SIZE) as usize;
    for y in 0..rows {
        let src = shm.data.get(y * shm.stride..y * shm.stride + row);
        let dst = pixels.get_mut(y * stride..y * stride + row);
        if let (Some(src), Some(dst)) = (src, dst) {
            dst.copy_from_slice(src);
        }
    }
}
