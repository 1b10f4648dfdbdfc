//! Outputs of one drm device and their layout.
//!
//! [`DrmBackend`] pairs connected connectors with free crtcs, creates a
//! [`DrmOutput`] for each pair and tiles the outputs left to right in the order
//! the device lists its connectors. Hotplug events append newly connected
//! outputs on the right and close the gap left by disconnected ones.

use std::time::Duration;

use tracing::{debug, error, info, info_span, instrument, trace, warn};

use super::assign::{PlaneAssignment, PlaneSurface, SurfaceId};
use super::device::{ConnectorInfo, ConnectorState, CrtcId, KmsDevice, PlaneConfig, ResourceInfo};
use super::error::Error;
use super::event::{CompletionEvent, FrameCompletion};
use super::mode::{Mode, ModeList, OutputModeFlags};
use super::output::{DebugFlags, DrmOutput, KmsContext, OutputId, OutputParams};
use super::plane::OverlayPlane;
use super::resources::ResourceAllocator;
use crate::backend::backlight::{BacklightProvider, SysfsBacklightProvider};
use crate::backend::renderer::Renderer;
use crate::backend::session::{DeviceNumber, SessionObserver};
use crate::backend::udev::{is_hotplug, DeviceEvent};
use crate::config::{BackendOptions, ModeOverride, OutputConfig};
use crate::utils::{Logical, Point, Region};

/// Evdev code of the key toggling the hardware cursor
pub const KEY_C: u32 = 46;
/// Evdev code of the key toggling overlay planes
pub const KEY_V: u32 = 47;
/// Evdev code of the key hiding overlay contents
pub const KEY_O: u32 = 24;

/// Display backend driving all outputs of one drm device
#[derive(Debug)]
pub struct DrmBackend<D: KmsDevice> {
    ctx: KmsContext<D>,
    outputs: Vec<DrmOutput>,
    // disconnected, waiting for their last page-flip
    retiring: Vec<DrmOutput>,
    crtcs: ResourceAllocator,
    connectors: ResourceAllocator,
    output_ids: ResourceAllocator,
    config: OutputConfig,
    connector_filter: Option<u32>,
    use_current_mode: bool,
    backlights: Box<dyn BacklightProvider>,
    sysnum: Option<usize>,
    device_number: Option<DeviceNumber>,
    span: tracing::Span,
}

impl<D: KmsDevice> DrmBackend<D> {
    /// Bring up every connected output of `device`
    ///
    /// `renderer` has to be a [`Renderer::Software`] exactly when `use_pixman` is set
    /// in `options`. Fails with [`Error::NoOutputs`] if not a single output could be created.
    pub fn new(
        device: D,
        renderer: Renderer,
        options: &BackendOptions,
        config: OutputConfig,
    ) -> Result<DrmBackend<D>, Error> {
        DrmBackend::with_backlight_provider(
            device,
            renderer,
            options,
            config,
            Box::new(SysfsBacklightProvider::default()),
        )
    }

    /// Like [`new`](DrmBackend::new), looking up backlights through `backlights`
    pub fn with_backlight_provider(
        device: D,
        renderer: Renderer,
        options: &BackendOptions,
        config: OutputConfig,
        backlights: Box<dyn BacklightProvider>,
    ) -> Result<DrmBackend<D>, Error> {
        let span = info_span!("backend_drm", device = ?device.dev_path());
        let _guard = span.enter();
        info!(
            "Initializing drm backend with {} rendering",
            if renderer.is_gpu() { "gpu" } else { "software" }
        );

        if options.use_pixman == renderer.is_gpu() {
            let requested = if options.use_pixman { "software" } else { "gpu" };
            error!("Renderer does not match the requested {} rendering", requested);
            return Err(Error::RendererMismatch { requested });
        }

        let ctx = KmsContext::new(device, renderer, options.debug_flags())?;
        let mut backend = DrmBackend {
            ctx,
            outputs: Vec::new(),
            retiring: Vec::new(),
            crtcs: ResourceAllocator::new(),
            connectors: ResourceAllocator::new(),
            output_ids: ResourceAllocator::new(),
            config,
            connector_filter: options.connector,
            use_current_mode: options.current_mode,
            backlights,
            sysnum: None,
            device_number: None,
            span: span.clone(),
        };
        backend.create_outputs()?;
        Ok(backend)
    }

    /// Udev sysnum of the device, hotplug events are matched against it
    pub fn set_sysnum(&mut self, sysnum: usize) {
        self.sysnum = Some(sysnum);
    }

    /// Device number, per-device session signals are matched against it
    pub fn set_device_number(&mut self, device: DeviceNumber) {
        self.device_number = Some(device);
    }

    /// The device
    pub fn device(&self) -> &D {
        self.ctx.device()
    }

    /// All outputs, left to right
    pub fn outputs(&self) -> impl Iterator<Item = &DrmOutput> {
        self.outputs.iter()
    }

    /// Output with the given id
    pub fn output(&self, id: OutputId) -> Option<&DrmOutput> {
        self.outputs.iter().find(|output| output.id() == id)
    }

    /// Overlay planes of the device
    pub fn overlay_planes(&self) -> impl Iterator<Item = &OverlayPlane> {
        self.ctx.overlays.iter()
    }

    fn output_mut(&mut self, id: OutputId) -> Result<&mut DrmOutput, Error> {
        self.outputs
            .iter_mut()
            .find(|output| output.id() == id)
            .ok_or(Error::UnknownOutput(id))
    }

    /// Whether the session is active and the device may be used
    pub fn is_active(&self) -> bool {
        self.ctx.active
    }

    /// Current debug flags
    pub fn debug_flags(&self) -> DebugFlags {
        self.ctx.debug
    }

    /// Toggle one of the debug flags
    pub fn toggle_debug_flag(&mut self, flag: DebugFlags) {
        self.ctx.debug.toggle(flag);
        info!(parent: &self.span, debug = ?self.ctx.debug, "Debug flags changed");
    }

    /// Whether the hardware cursor is given up on
    pub fn cursors_broken(&self) -> bool {
        self.ctx.cursors_broken
    }

    /// Give up on the hardware cursor, or try it again
    pub fn toggle_cursors_broken(&mut self) {
        self.ctx.cursors_broken = !self.ctx.cursors_broken;
        info!(parent: &self.span, "Hardware cursors {}", if self.ctx.cursors_broken { "off" } else { "on" });
    }

    /// Handle the debug key binding for the evdev `key`, returns whether it was one
    ///
    /// `C` toggles the hardware cursor, `V` overlay planes and `O` hides what
    /// overlays show.
    pub fn debug_binding(&mut self, key: u32) -> bool {
        match key {
            KEY_C => self.toggle_cursors_broken(),
            KEY_V => self.toggle_debug_flag(DebugFlags::DISABLE_OVERLAYS),
            KEY_O => self.toggle_debug_flag(DebugFlags::HIDE_OVERLAYS),
            _ => return false,
        }
        true
    }

    /// Choose planes for the surfaces of `output`, ordered front to back
    pub fn assign_planes(
        &mut self,
        output: OutputId,
        surfaces: &[PlaneSurface],
    ) -> Result<Vec<(SurfaceId, PlaneAssignment)>, Error> {
        let index = self.output_index(output)?;
        Ok(self.outputs[index].assign_planes(&mut self.ctx, surfaces))
    }

    /// Present a new frame on `output`, rendering `damage` unless a surface is scanned out
    ///
    /// Completion is reported through [`handle_completion`](DrmBackend::handle_completion).
    pub fn repaint(&mut self, output: OutputId, damage: &Region<Logical>) -> Result<(), Error> {
        let index = self.output_index(output)?;
        self.outputs[index].repaint(&mut self.ctx, damage)
    }

    /// Switch `output` to a `width`x`height` mode, a `refresh` of 0 accepts any rate
    pub fn switch_mode(&mut self, output: OutputId, width: i32, height: i32, refresh: u32) -> Result<(), Error> {
        let index = self.output_index(output)?;
        self.outputs[index].switch_mode(&mut self.ctx, width, height, refresh)
    }

    /// Set the backlight of `output` on the `0..=255` scale
    pub fn set_backlight(&mut self, output: OutputId, value: u32) -> Result<(), Error> {
        self.output_mut(output)?.set_backlight(value)?;
        Ok(())
    }

    fn output_index(&self, id: OutputId) -> Result<usize, Error> {
        self.outputs
            .iter()
            .position(|output| output.id() == id)
            .ok_or(Error::UnknownOutput(id))
    }

    /// Process a completion event read from the device
    ///
    /// Returns the finished frame, if the event completed one.
    #[profiling::function]
    pub fn handle_completion(&mut self, event: CompletionEvent) -> Option<FrameCompletion> {
        match event {
            CompletionEvent::PageFlip { crtc, time, .. } => self.page_flip_done(crtc, time),
            CompletionEvent::Vblank { plane, time, .. } => {
                let Some(owner) = self.ctx.overlays.get(plane).and_then(|plane| plane.output()) else {
                    trace!(parent: &self.span, ?plane, "Vblank for an idle plane");
                    return None;
                };
                let output = self
                    .outputs
                    .iter_mut()
                    .chain(self.retiring.iter_mut())
                    .find(|output| output.id() == owner)?;
                output.on_vblank(&mut self.ctx, plane, time)
            }
        }
    }

    fn page_flip_done(&mut self, crtc: CrtcId, time: Duration) -> Option<FrameCompletion> {
        if let Some(output) = self.outputs.iter_mut().find(|output| output.crtc() == crtc) {
            return output.on_page_flip(&mut self.ctx, time);
        }
        let index = self.retiring.iter().position(|output| output.crtc() == crtc)?;
        let mut output = self.retiring.swap_remove(index);
        let _ = output.on_page_flip(&mut self.ctx, time);
        self.destroy_output(output);
        None
    }

    /// React to a udev event, rescanning the connectors on hotplug
    ///
    /// Fails with [`Error::NoOutputs`] once the last output is gone.
    pub fn handle_device_event(&mut self, event: &DeviceEvent) -> Result<(), Error> {
        match self.sysnum {
            Some(sysnum) if is_hotplug(event, sysnum) => self.update_outputs(),
            _ => Ok(()),
        }
    }

    #[instrument(level = "debug", parent = &self.span, skip(self))]
    fn create_outputs(&mut self) -> Result<(), Error> {
        let resources = self.ctx.device().resources()?;

        let mut x = 0;
        for id in &resources.connectors {
            let connector = match self.ctx.device().connector(*id) {
                Ok(connector) => connector,
                Err(err) => {
                    warn!("Failed to get connector {:?}: {}", id, err);
                    continue;
                }
            };
            if connector.state != ConnectorState::Connected
                || self.connector_filter.map_or(false, |filter| filter != id.0)
            {
                continue;
            }
            match self.create_output_for_connector(&resources, connector, (x, 0).into()) {
                Ok(width) => x += width,
                Err(err) => debug!("Skipping connector {:?}: {}", id, err),
            }
        }

        if self.outputs.is_empty() {
            error!("No currently active connector found");
            return Err(Error::NoOutputs);
        }
        Ok(())
    }

    /// Rescan the connectors after a hotplug event
    ///
    /// Fails with [`Error::NoOutputs`] once no output is left.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn update_outputs(&mut self) -> Result<(), Error> {
        let resources = self.ctx.device().resources()?;

        let mut connected = ResourceAllocator::new();
        for id in &resources.connectors {
            let connector = match self.ctx.device().connector(*id) {
                Ok(connector) => connector,
                Err(err) => {
                    warn!("Failed to get connector {:?}: {}", id, err);
                    continue;
                }
            };
            if connector.state != ConnectorState::Connected {
                continue;
            }
            connected.try_claim(id.0);
            if self.connectors.is_claimed(id.0) {
                continue;
            }

            let x = self
                .outputs
                .last()
                .map_or(0, |last| last.position().x + last.geometry().size.w);
            match self.create_output_for_connector(&resources, connector, (x, 0).into()) {
                Ok(_) => info!("Connector {:?} connected", id),
                Err(err) => debug!("Connector {:?} connected but unusable: {}", id, err),
            }
        }

        let mut index = 0;
        while index < self.outputs.len() {
            let connector = self.outputs[index].connector();
            if connected.is_claimed(connector.0) {
                index += 1;
                continue;
            }
            info!("Connector {:?} disconnected", connector);
            self.detach_output(index);
        }

        if self.connectors.is_empty() {
            error!("No outputs left");
            return Err(Error::NoOutputs);
        }
        Ok(())
    }

    // first free crtc any encoder of the connector can be routed to, with its index
    fn find_crtc(&self, resources: &ResourceInfo, connector: &ConnectorInfo) -> Option<(usize, CrtcId)> {
        for id in &connector.encoders {
            let encoder = match self.ctx.device().encoder(*id) {
                Ok(encoder) => encoder,
                Err(err) => {
                    debug!("Failed to get encoder {:?}: {}", id, err);
                    continue;
                }
            };
            let found = resources.crtcs.iter().enumerate().find(|(pipe, _)| {
                *pipe < 32 && encoder.possible_crtcs & (1 << pipe) != 0 && !self.crtcs.is_claimed(*pipe as u32)
            });
            if let Some((pipe, crtc)) = found {
                return Some((pipe, *crtc));
            }
        }
        None
    }

    // Returns the width the new output occupies in the layout
    fn create_output_for_connector(
        &mut self,
        resources: &ResourceInfo,
        connector: ConnectorInfo,
        position: Point<i32, Logical>,
    ) -> Result<i32, Error> {
        let Some((pipe, crtc)) = self.find_crtc(resources, &connector) else {
            debug!("No usable crtc/encoder pair for connector {:?}", connector.id);
            return Err(Error::NoSuitableCrtc(connector.id));
        };
        self.crtcs.try_claim(pipe as u32);
        self.connectors.try_claim(connector.id.0);

        let created = self.build_output(connector.clone(), crtc, pipe, position);
        match created {
            Ok(output) => {
                let width = output.geometry().size.w;
                self.outputs.push(output);
                Ok(width)
            }
            Err(err) => {
                self.crtcs.release(pipe as u32);
                self.connectors.release(connector.id.0);
                Err(err)
            }
        }
    }

    fn build_output(
        &mut self,
        connector: ConnectorInfo,
        crtc: CrtcId,
        pipe: usize,
        position: Point<i32, Logical>,
    ) -> Result<DrmOutput, Error> {
        let device = self.ctx.device();
        let name = connector.output_name();
        let original_crtc = device.crtc(crtc).ok();

        // mode of whatever crtc drives the connector right now
        let crtc_mode = match connector.current_encoder.map(|id| device.encoder(id)) {
            Some(Ok(encoder)) => match encoder.crtc.map(|id| device.crtc(id)) {
                Some(Ok(info)) => info.mode,
                Some(Err(err)) => return Err(err.into()),
                None => None,
            },
            _ => None,
        };

        let mut modes = ModeList::default();
        for info in &connector.modes {
            modes.push(Mode::from(info.clone()));
        }

        let section = self.config.get(&name);
        if let Some(mode) = section.and_then(|section| section.mode.as_ref()) {
            debug!("{} mode {:?} in config", name, mode);
        }
        let mode_override = section.and_then(|section| section.mode.clone());
        let transform = section.map(|section| section.transform).unwrap_or_default();

        if mode_override == Some(ModeOverride::Off) {
            info!("Disabling output {}", name);
            if let Err(err) = device.set_crtc(crtc, None, (0, 0), &[], None) {
                warn!("Failed to disable crtc {:?}: {}", crtc, err);
            }
            return Err(Error::OutputDisabled(connector.id));
        }

        let mut configured = match &mode_override {
            Some(ModeOverride::Resolution { width, height }) => modes
                .iter()
                .rposition(|mode| mode.size.w == *width && mode.size.h == *height),
            _ => None,
        };
        let mut current = crtc_mode.as_ref().and_then(|info| modes.position(info));
        let preferred = modes.preferred_index();

        if let Some(ModeOverride::Modeline(info)) = &mode_override {
            let index = modes.push(Mode::from(info.clone()));
            configured = Some(index);
            current = Some(index);
        }
        if current.is_none() {
            if let Some(info) = crtc_mode {
                current = Some(modes.push(Mode::from(info)));
            }
        }
        if mode_override == Some(ModeOverride::Current) {
            configured = current;
        }

        let chosen = if self.use_current_mode && current.is_some() {
            current
        } else {
            configured.or(preferred).or(current)
        };
        let Some(chosen) = chosen else {
            warn!("No available modes for {}", name);
            return Err(Error::NoUsableMode(connector.id));
        };
        modes.set_current(chosen);

        let id = OutputId(self.output_ids.first_free());
        let backlight = self.backlights.backlight_for(&connector);
        let connector_id = connector.id;
        let output = DrmOutput::new(
            OutputParams {
                id,
                connector,
                crtc,
                pipe,
                original_crtc,
                position,
                transform,
                modes,
                backlight,
            },
            &mut self.ctx,
        )
        .map_err(|err| {
            error!("Failed to set up rendering for {}: {}", name, err);
            err
        })?;
        self.output_ids.try_claim(id.0);

        info!("Output {}, (connector {:?}, crtc {:?})", name, connector_id, crtc);
        for mode in output.modes().iter() {
            info!(
                "  mode {}x{}@{:.1}{}{}",
                mode.size.w,
                mode.size.h,
                mode.refresh as f64 / 1000.0,
                if mode.flags.contains(OutputModeFlags::PREFERRED) {
                    ", preferred"
                } else {
                    ""
                },
                if mode.flags.contains(OutputModeFlags::CURRENT) {
                    ", current"
                } else {
                    ""
                },
            );
        }
        Ok(output)
    }

    fn destroy_output(&mut self, output: DrmOutput) {
        self.crtcs.release(output.pipe() as u32);
        self.connectors.release(output.connector().0);
        self.output_ids.release(output.id().0);
        output.destroy(&mut self.ctx);
    }

    /// Take `output` away, it is turned off and its crtc restored
    ///
    /// The outputs right of it close the gap. With a page-flip outstanding the output disappears right away but is only
    /// torn down once the flip completed.
    pub fn remove_output(&mut self, id: OutputId) -> Result<(), Error> {
        let index = self.output_index(id)?;
        self.detach_output(index);
        Ok(())
    }

    // Outputs right of the removed one move left by its width
    fn detach_output(&mut self, index: usize) {
        let mut output = self.outputs.remove(index);
        let width = output.geometry().size.w;
        for later in &mut self.outputs[index..] {
            let position = later.position();
            later.set_position((position.x - width, position.y).into());
        }

        self.connectors.release(output.connector().0);
        if output.flip_pending() {
            output.mark_destroy_pending();
            self.retiring.push(output);
        } else {
            self.destroy_output(output);
        }
    }

    /// The session became inactive: hide cursors and overlays and drop drm master
    ///
    /// Until [`resume`](DrmBackend::resume) repaints fail with [`Error::DeviceInactive`].
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn suspend(&mut self) {
        if !self.ctx.active {
            return;
        }
        info!("Leaving session");
        self.ctx.active = false;
        for output in &mut self.outputs {
            output.suspend(&mut self.ctx);
        }
        self.disable_idle_overlays();
        if let Err(err) = self.ctx.device().release_master() {
            warn!("Failed to drop drm master: {}", err);
        }
    }

    /// The session is active again: reacquire drm master and program every crtc again
    ///
    /// The whole layout should be repainted afterwards.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn resume(&mut self) -> Result<(), Error> {
        if self.ctx.active {
            return Ok(());
        }
        info!("Entering session");
        if let Err(err) = self.ctx.device().acquire_master() {
            error!("Failed to set drm master: {}", err);
            return Err(err.into());
        }
        self.ctx.active = true;
        for output in &mut self.outputs {
            output.resume(&mut self.ctx);
        }
        Ok(())
    }

    // Planes not showing anything for an output may still hold an old configuration
    fn disable_idle_overlays(&mut self) {
        let Some(crtc) = self.outputs.first().map(DrmOutput::crtc) else {
            return;
        };
        let KmsContext { buffers, overlays, .. } = &mut self.ctx;
        for plane in overlays.iter_mut().filter(|plane| plane.output().is_none()) {
            if let Err(err) = buffers.device().set_plane(plane.id(), crtc, &PlaneConfig::disabled()) {
                debug!(plane = ?plane.id(), "Failed to disable overlay plane: {}", err);
            }
        }
    }

    /// Turn everything off and give the device back
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn shutdown(mut self) {
        info!("Shutting down drm backend");
        self.disable_idle_overlays();
        let outputs = std::mem::take(&mut self.outputs);
        let retiring = std::mem::take(&mut self.retiring);
        for output in outputs.into_iter().chain(retiring) {
            self.destroy_output(output);
        }
        if self.ctx.active {
            if let Err(err) = self.ctx.device().release_master() {
                warn!("Failed to drop drm master: {}", err);
            }
        }
    }
}

impl<D: KmsDevice> SessionObserver for DrmBackend<D> {
    fn pause(&mut self, device: Option<DeviceNumber>) {
        if device.is_some() && device != self.device_number {
            return;
        }
        self.suspend();
    }

    fn activate(&mut self, device: Option<DeviceNumber>) {
        if device.is_some() && device != self.device_number {
            return;
        }
        if let Err(err) = self.resume() {
            error!(parent: &self.span, "Failed to reactivate drm device: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backlight::NoBacklight;
    use crate::backend::drm::device::mock::{Call, MockDevice};
    use crate::backend::drm::device::{ConnectorId, ConnectorInterface};
    use crate::backend::drm::mode::tests::timing;
    use crate::backend::drm::mode::{ModeInfo, ModeTypeFlags};
    use crate::backend::drm::output::tests::{gpu, software};
    use crate::backend::format::Fourcc;
    use crate::backend::udev::DeviceEventKind;
    use crate::utils::Size;

    fn preferred(width: u16, height: u16, refresh_hz: u32) -> ModeInfo {
        let mut info = timing(width, height, refresh_hz);
        info.mode_type |= ModeTypeFlags::PREFERRED;
        info
    }

    fn setup(crtcs: usize, connectors: usize) -> (MockDevice, Vec<ConnectorId>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let device = MockDevice::new();
        for _ in 0..crtcs {
            device.add_crtc();
        }
        let connectors = (0..connectors)
            .map(|_| device.add_connector(ConnectorInterface::HDMIA, vec![preferred(1920, 1080, 60)]))
            .collect();
        (device, connectors)
    }

    fn start(device: &MockDevice, options: &BackendOptions, config: OutputConfig) -> Result<DrmBackend<MockDevice>, Error> {
        let (renderer, _) = gpu();
        DrmBackend::with_backlight_provider(device.clone(), renderer, options, config, Box::new(NoBacklight))
    }

    fn positions(backend: &DrmBackend<MockDevice>) -> Vec<(ConnectorId, i32)> {
        backend
            .outputs()
            .map(|output| (output.connector(), output.position().x))
            .collect()
    }

    fn repaint_all(backend: &mut DrmBackend<MockDevice>) {
        let ids: Vec<_> = backend.outputs().map(DrmOutput::id).collect();
        for id in ids {
            let damage = Region::from(backend.output(id).unwrap().geometry());
            backend.repaint(id, &damage).unwrap();
        }
    }

    #[test]
    fn outputs_tile_left_to_right() {
        let (device, connectors) = setup(3, 3);
        let backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        assert_eq!(
            positions(&backend),
            vec![(connectors[0], 0), (connectors[1], 1920), (connectors[2], 3840)]
        );
        let names: Vec<_> = backend.outputs().map(|output| output.name().to_owned()).collect();
        assert_eq!(names, vec!["HDMI1", "HDMI2", "HDMI3"]);
    }

    #[test]
    fn removing_leftmost_output_shifts_the_rest() {
        let (device, connectors) = setup(3, 3);
        let mut backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();

        device.set_connected(connectors[0], false);
        backend.update_outputs().unwrap();
        assert_eq!(positions(&backend), vec![(connectors[1], 0), (connectors[2], 1920)]);

        // its crtc is free for the next display
        device.set_connected(connectors[0], true);
        backend.update_outputs().unwrap();
        assert_eq!(
            positions(&backend),
            vec![(connectors[1], 0), (connectors[2], 1920), (connectors[0], 3840)]
        );
    }

    #[test]
    fn removed_output_leaves_no_gap() {
        let (device, connectors) = setup(3, 3);
        let mut backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        let first = backend.outputs().next().unwrap().id();

        backend.remove_output(first).unwrap();
        assert_eq!(positions(&backend), vec![(connectors[1], 0), (connectors[2], 1920)]);
        assert!(matches!(backend.remove_output(first), Err(Error::UnknownOutput(_))));
    }

    #[test]
    fn hotplugged_output_is_appended() {
        let (device, connectors) = setup(2, 2);
        device.set_connected(connectors[1], false);
        let mut backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        assert_eq!(positions(&backend), vec![(connectors[0], 0)]);

        device.set_connected(connectors[1], true);
        let mut event = DeviceEvent {
            kind: DeviceEventKind::Changed,
            sysnum: Some(0),
            devnum: None,
            hotplug: true,
        };
        backend.set_sysnum(1);
        backend.handle_device_event(&event).unwrap();
        assert_eq!(backend.outputs().count(), 1);

        event.sysnum = Some(1);
        backend.handle_device_event(&event).unwrap();
        assert_eq!(positions(&backend), vec![(connectors[0], 0), (connectors[1], 1920)]);
    }

    #[test]
    fn losing_every_output_is_fatal() {
        let (device, connectors) = setup(1, 1);
        let mut backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        device.set_connected(connectors[0], false);
        assert!(matches!(backend.update_outputs(), Err(Error::NoOutputs)));

        let (device, connectors) = setup(1, 1);
        device.set_connected(connectors[0], false);
        assert!(matches!(
            start(&device, &BackendOptions::default(), OutputConfig::default()),
            Err(Error::NoOutputs)
        ));
    }

    #[test]
    fn renderer_must_match_options() {
        let (device, _) = setup(1, 1);
        let software_options = BackendOptions {
            use_pixman: true,
            ..BackendOptions::default()
        };
        assert!(matches!(
            start(&device, &software_options, OutputConfig::default()),
            Err(Error::RendererMismatch { requested: "software" })
        ));

        let (renderer, _) = software();
        let backend = DrmBackend::with_backlight_provider(
            device.clone(),
            renderer,
            &software_options,
            OutputConfig::default(),
            Box::new(NoBacklight),
        )
        .unwrap();
        assert_eq!(backend.outputs().count(), 1);

        let (renderer, _) = software();
        assert!(matches!(
            DrmBackend::with_backlight_provider(
                device,
                renderer,
                &BackendOptions::default(),
                OutputConfig::default(),
                Box::new(NoBacklight),
            ),
            Err(Error::RendererMismatch { requested: "gpu" })
        ));
    }

    #[test]
    fn more_connectors_than_crtcs() {
        let (device, connectors) = setup(1, 2);
        let backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        assert_eq!(positions(&backend), vec![(connectors[0], 0)]);
    }

    #[test]
    fn connector_filter() {
        let (device, connectors) = setup(2, 2);
        let options = BackendOptions {
            connector: Some(connectors[1].0),
            ..BackendOptions::default()
        };
        let backend = start(&device, &options, OutputConfig::default()).unwrap();
        assert_eq!(positions(&backend), vec![(connectors[1], 0)]);
    }

    #[test]
    fn output_configured_off() {
        let (device, connectors) = setup(2, 2);
        let mut config = OutputConfig::builder();
        config.name("HDMI1").mode("off").finish_section();
        let backend = start(&device, &BackendOptions::default(), config.build()).unwrap();

        assert_eq!(positions(&backend), vec![(connectors[1], 0)]);
        assert!(device.calls().iter().any(|call| matches!(
            call,
            Call::SetCrtc {
                fb: None,
                mode: None,
                ..
            }
        )));
    }

    #[test]
    fn initial_mode_selection() {
        let device = MockDevice::new();
        let crtc = device.add_crtc();
        device.add_crtc();
        device.add_crtc();
        let modes = vec![timing(1280, 720, 60), preferred(2560, 1440, 60), timing(1920, 1080, 60)];
        let first = device.add_connector(ConnectorInterface::DisplayPort, modes.clone());
        device.attach(first, crtc, timing(1920, 1080, 60));
        device.add_connector(ConnectorInterface::DisplayPort, modes.clone());
        device.add_connector(ConnectorInterface::DisplayPort, modes);

        let mut config = OutputConfig::builder();
        config.name("DP2").mode("1280x720").finish_section();
        config
            .name("DP3")
            .mode("74.25 1024 1048 1184 1344 768 771 777 806 -hsync -vsync")
            .finish_section();
        let backend = start(&device, &BackendOptions::default(), config.build()).unwrap();
        let sizes: Vec<_> = backend
            .outputs()
            .map(|output| {
                let size = output.mode_size();
                (size.w, size.h)
            })
            .collect();
        assert_eq!(sizes, vec![(2560, 1440), (1280, 720), (1024, 768)]);

        let options = BackendOptions {
            current_mode: true,
            ..BackendOptions::default()
        };
        let backend = start(&device, &options, OutputConfig::default()).unwrap();
        let first = backend.outputs().next().unwrap();
        assert_eq!(first.mode_size(), Size::from((1920, 1080)));
    }

    #[test]
    fn later_mode_wins_ties() {
        let device = MockDevice::new();
        device.add_crtc();
        device.add_crtc();
        let modes = vec![
            preferred(1920, 1080, 60),
            timing(1280, 720, 50),
            preferred(2560, 1440, 60),
            timing(1280, 720, 60),
        ];
        device.add_connector(ConnectorInterface::HDMIA, modes.clone());
        device.add_connector(ConnectorInterface::HDMIA, modes);

        let mut config = OutputConfig::builder();
        config.name("HDMI2").mode("1280x720").finish_section();
        let backend = start(&device, &BackendOptions::default(), config.build()).unwrap();
        let picked: Vec<_> = backend
            .outputs()
            .map(|output| {
                let mode = output.current_mode().unwrap();
                (mode.size.w, mode.size.h, (mode.refresh + 500) / 1000)
            })
            .collect();
        assert_eq!(picked, vec![(2560, 1440, 60), (1280, 720, 60)]);
    }

    #[test]
    fn frame_completion_through_events() {
        let (device, _) = setup(1, 1);
        device.add_plane(0b1, vec![Fourcc::Xrgb8888]);
        let mut backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        let output = backend.outputs().next().unwrap();
        let (id, crtc) = (output.id(), output.crtc());

        repaint_all(&mut backend);
        let done = backend.handle_completion(CompletionEvent::PageFlip {
            crtc,
            frame: 1,
            time: Duration::from_millis(16),
        });
        assert_eq!(done.map(|done| done.output), Some(id));

        // a duplicate signal finishes nothing
        let again = backend.handle_completion(CompletionEvent::PageFlip {
            crtc,
            frame: 1,
            time: Duration::from_millis(16),
        });
        assert_eq!(again, None);
    }

    #[test]
    fn disconnect_during_flip_defers_teardown() {
        let (device, connectors) = setup(2, 2);
        let mut backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        let crtc = backend.outputs().next().unwrap().crtc();
        repaint_all(&mut backend);
        device.clear_calls();

        device.set_connected(connectors[0], false);
        backend.update_outputs().unwrap();
        assert_eq!(positions(&backend), vec![(connectors[1], 0)]);
        assert_eq!(device.count(|call| matches!(call, Call::SetCrtc { .. })), 0);

        let done = backend.handle_completion(CompletionEvent::PageFlip {
            crtc,
            frame: 1,
            time: Duration::from_millis(16),
        });
        assert_eq!(done, None);
        assert!(device
            .calls()
            .iter()
            .any(|call| matches!(call, Call::SetCrtc { crtc: c, .. } if *c == crtc)));
    }

    #[test]
    fn suspend_and_resume() {
        let (device, _) = setup(1, 1);
        let mut backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        let output = backend.outputs().next().unwrap();
        let (id, crtc) = (output.id(), output.crtc());
        repaint_all(&mut backend);
        backend.handle_completion(CompletionEvent::PageFlip {
            crtc,
            frame: 1,
            time: Duration::from_millis(16),
        });
        device.clear_calls();

        backend.pause(None);
        assert!(!backend.is_active());
        assert!(device.calls().contains(&Call::ReleaseMaster));
        let damage = Region::from(backend.output(id).unwrap().geometry());
        assert!(matches!(backend.repaint(id, &damage), Err(Error::DeviceInactive)));

        // signals for other devices are ignored
        backend.set_device_number((226, 0));
        backend.activate(Some((226, 1)));
        assert!(!backend.is_active());

        backend.activate(Some((226, 0)));
        assert!(backend.is_active());
        assert!(device.calls().contains(&Call::AcquireMaster));
        assert!(device
            .calls()
            .iter()
            .any(|call| matches!(call, Call::SetCrtc { fb: Some(_), mode: Some(_), .. })));
        backend.repaint(id, &damage).unwrap();
    }

    #[test]
    fn debug_bindings() {
        let (device, _) = setup(1, 1);
        let mut backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        assert_eq!(backend.debug_flags(), DebugFlags::DISABLE_OVERLAYS);

        assert!(backend.debug_binding(KEY_V));
        assert!(backend.debug_binding(KEY_O));
        assert_eq!(backend.debug_flags(), DebugFlags::HIDE_OVERLAYS);
        assert!(backend.debug_binding(KEY_C));
        assert!(backend.cursors_broken());
        assert!(!backend.debug_binding(30));
    }

    #[test]
    fn shutdown_restores_crtcs() {
        let (device, _) = setup(2, 2);
        let backend = start(&device, &BackendOptions::default(), OutputConfig::default()).unwrap();
        device.clear_calls();
        backend.shutdown();
        assert_eq!(device.count(|call| matches!(call, Call::SetCrtc { .. })), 2);
        assert_eq!(device.calls().last(), Some(&Call::ReleaseMaster));
    }
}
