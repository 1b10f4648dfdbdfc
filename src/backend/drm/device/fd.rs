use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex, PoisonError,
};

use drm::buffer::{Buffer as DrmBuffer, Handle as GemHandle, PlanarBuffer};
use drm::control::{
    connector, crtc, dumbbuffer::DumbBuffer, encoder, framebuffer, plane, Device as ControlDevice, Event,
    FbCmd2Flags, PageFlipFlags, RawResourceHandle,
};
use drm::{Device as BasicDevice, VblankWaitFlags, VblankWaitTarget};
use tracing::{debug, error, info, info_span, instrument, trace, warn};

use super::{
    ConnectorId, ConnectorInfo, ConnectorInterface, ConnectorState, CrtcId, CrtcInfo, DumbAllocation, DumbId,
    EncoderId, EncoderInfo, FramebufferDesc, FramebufferId, KmsDevice, PlaneConfig, PlaneId, PlaneInfo,
    Registration, ResourceInfo, Subpixel,
};
use crate::backend::drm::error::AccessError;
use crate::backend::drm::event::CompletionEvent;
use crate::backend::drm::mode::{ModeInfo, ModeSyncFlags, ModeTypeFlags};
use crate::backend::format::{Fourcc, Modifier};

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: AtomicBool,
    crtcs: Vec<crtc::Handle>,
    dumbs: Mutex<HashMap<DumbId, DumbBuffer>>,
    next_dumb: AtomicU32,
    span: tracing::Span,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        info!("Dropping device: {:?}", self.dev_path());
        if self.privileged.load(Ordering::SeqCst) {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

impl InternalDrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{}", self.fd.as_raw_fd())).ok()
    }

    fn access(&self, errmsg: &'static str) -> impl FnOnce(io::Error) -> AccessError + '_ {
        move |source| AccessError::new(errmsg, self.dev_path(), source)
    }

    fn handle<H: From<RawResourceHandle>>(&self, raw: u32, errmsg: &'static str) -> Result<H, AccessError> {
        drm::control::from_u32(raw).ok_or_else(|| {
            AccessError::new(
                errmsg,
                self.dev_path(),
                io::Error::new(io::ErrorKind::InvalidInput, "null handle"),
            )
        })
    }

    fn crtc_mask(&self, allowed: &[crtc::Handle]) -> u32 {
        self.crtcs
            .iter()
            .enumerate()
            .filter(|(_, crtc)| allowed.contains(crtc))
            .fold(0, |mask, (idx, _)| mask | (1 << idx))
    }
}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl DrmDeviceFd {
    /// Wrap an open drm node.
    ///
    /// Tries to become drm master and releases the lock on drop again.
    /// Clone the returned value instead of opening the node twice.
    pub fn new(fd: OwnedFd) -> Result<DrmDeviceFd, AccessError> {
        let span = info_span!("drm_device_fd");
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: AtomicBool::new(false),
            crtcs: Vec::new(),
            dumbs: Mutex::new(HashMap::new()),
            next_dumb: AtomicU32::new(1),
            span,
        };
        let _guard = dev.span.clone().entered();

        // Newer kernels grant modesetting to the first client without the
        // master lock, so failing here is not fatal.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged.store(true, Ordering::SeqCst);
        }

        let resources = dev
            .resource_handles()
            .map_err(dev.access("Error loading drm resources"))?;
        dev.crtcs = resources.crtcs().to_vec();
        debug!(crtcs = dev.crtcs.len(), "Opened drm device {:?}", dev.dev_path());

        Ok(DrmDeviceFd(Arc::new(dev)))
    }

    /// Read all pending completion events of the device
    pub fn receive_completions(&self) -> Result<Vec<CompletionEvent>, AccessError> {
        let events = self
            .0
            .receive_events()
            .map_err(self.0.access("Error processing drm events"))?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(event) => Some(CompletionEvent::PageFlip {
                    crtc: CrtcId(event.crtc.into()),
                    frame: event.frame,
                    time: event.duration,
                }),
                Event::Vblank(event) => Some(CompletionEvent::Vblank {
                    plane: PlaneId(event.user_data as u32),
                    frame: event.frame,
                    time: event.time,
                }),
                Event::Unknown(_) => {
                    trace!("Got an unknown event on the drm device");
                    None
                }
            })
            .collect())
    }
}

#[derive(Debug)]
struct Registered<'a> {
    desc: &'a FramebufferDesc,
    handle: GemHandle,
}

impl DrmBuffer for Registered<'_> {
    fn size(&self) -> (u32, u32) {
        self.desc.size
    }
    fn format(&self) -> Fourcc {
        self.desc.format
    }
    fn pitch(&self) -> u32 {
        self.desc.pitch
    }
    fn handle(&self) -> GemHandle {
        self.handle
    }
}

impl PlanarBuffer for Registered<'_> {
    fn size(&self) -> (u32, u32) {
        self.desc.size
    }
    fn format(&self) -> Fourcc {
        self.desc.format
    }
    fn modifier(&self) -> Option<Modifier> {
        None
    }
    fn pitches(&self) -> [u32; 4] {
        [self.desc.pitch, 0, 0, 0]
    }
    fn handles(&self) -> [Option<GemHandle>; 4] {
        [Some(self.handle), None, None, None]
    }
    fn offsets(&self) -> [u32; 4] {
        [0; 4]
    }
}

fn mode_from_drm(mode: drm::control::Mode) -> ModeInfo {
    let raw = drm_ffi::drm_mode_modeinfo::from(mode);
    let name = raw
        .name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8 as char)
        .collect();
    ModeInfo {
        clock: raw.clock,
        hdisplay: raw.hdisplay,
        hsync_start: raw.hsync_start,
        hsync_end: raw.hsync_end,
        htotal: raw.htotal,
        hskew: raw.hskew,
        vdisplay: raw.vdisplay,
        vsync_start: raw.vsync_start,
        vsync_end: raw.vsync_end,
        vtotal: raw.vtotal,
        vscan: raw.vscan,
        vrefresh: raw.vrefresh,
        flags: ModeSyncFlags::from_bits_truncate(raw.flags),
        mode_type: ModeTypeFlags::from_bits_truncate(raw.type_),
        name,
    }
}

fn mode_to_drm(info: &ModeInfo) -> drm::control::Mode {
    let mut name = [0; 32];
    for (dst, src) in name.iter_mut().zip(info.name.bytes().take(31)) {
        *dst = src as _;
    }
    drm::control::Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: info.clock,
        hdisplay: info.hdisplay,
        hsync_start: info.hsync_start,
        hsync_end: info.hsync_end,
        htotal: info.htotal,
        hskew: info.hskew,
        vdisplay: info.vdisplay,
        vsync_start: info.vsync_start,
        vsync_end: info.vsync_end,
        vtotal: info.vtotal,
        vscan: info.vscan,
        vrefresh: info.vrefresh,
        flags: info.flags.bits(),
        type_: info.mode_type.bits(),
        name,
    })
}

fn interface_from_drm(interface: connector::Interface) -> ConnectorInterface {
    use connector::Interface;
    match interface {
        Interface::VGA => ConnectorInterface::VGA,
        Interface::DVII => ConnectorInterface::DVII,
        Interface::DVID => ConnectorInterface::DVID,
        Interface::DVIA => ConnectorInterface::DVIA,
        Interface::Composite => ConnectorInterface::Composite,
        Interface::SVideo => ConnectorInterface::SVideo,
        Interface::LVDS => ConnectorInterface::LVDS,
        Interface::Component => ConnectorInterface::Component,
        Interface::NinePinDIN => ConnectorInterface::NinePinDIN,
        Interface::DisplayPort => ConnectorInterface::DisplayPort,
        Interface::HDMIA => ConnectorInterface::HDMIA,
        Interface::HDMIB => ConnectorInterface::HDMIB,
        Interface::TV => ConnectorInterface::TV,
        Interface::EmbeddedDisplayPort => ConnectorInterface::EmbeddedDisplayPort,
        Interface::Virtual => ConnectorInterface::Virtual,
        Interface::DSI => ConnectorInterface::DSI,
        Interface::DPI => ConnectorInterface::DPI,
        _ => ConnectorInterface::Unknown,
    }
}

impl KmsDevice for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        self.0.dev_path()
    }

    fn resources(&self) -> Result<ResourceInfo, AccessError> {
        let handles = self
            .0
            .resource_handles()
            .map_err(self.0.access("Error loading drm resources"))?;
        let card = drm_ffi::mode::get_resources(self.as_fd(), None, None, None, None)
            .map_err(self.0.access("Error loading drm resources"))?;

        Ok(ResourceInfo {
            crtcs: handles.crtcs().iter().map(|h| CrtcId((*h).into())).collect(),
            connectors: handles.connectors().iter().map(|h| ConnectorId((*h).into())).collect(),
            encoders: handles.encoders().iter().map(|h| EncoderId((*h).into())).collect(),
            min_size: (card.min_width, card.min_height),
            max_size: (card.max_width, card.max_height),
        })
    }

    fn connector(&self, id: ConnectorId) -> Result<ConnectorInfo, AccessError> {
        let handle: connector::Handle = self.0.handle(id.0, "Invalid connector")?;
        let info = self
            .0
            .get_connector(handle, true)
            .map_err(self.0.access("Error loading connector info"))?;

        Ok(ConnectorInfo {
            id,
            interface: interface_from_drm(info.interface()),
            interface_id: info.interface_id(),
            state: match info.state() {
                connector::State::Connected => ConnectorState::Connected,
                connector::State::Disconnected => ConnectorState::Disconnected,
                connector::State::Unknown => ConnectorState::Unknown,
            },
            modes: info.modes().iter().copied().map(mode_from_drm).collect(),
            encoders: info.encoders().iter().map(|h| EncoderId((*h).into())).collect(),
            current_encoder: info.current_encoder().map(|h| EncoderId(h.into())),
            physical_size: info.size().unwrap_or((0, 0)),
            subpixel: match info.subpixel() {
                connector::SubPixel::HorizontalRgb => Subpixel::HorizontalRgb,
                connector::SubPixel::HorizontalBgr => Subpixel::HorizontalBgr,
                connector::SubPixel::VerticalRgb => Subpixel::VerticalRgb,
                connector::SubPixel::VerticalBgr => Subpixel::VerticalBgr,
                connector::SubPixel::None => Subpixel::None,
                _ => Subpixel::Unknown,
            },
        })
    }

    fn encoder(&self, id: EncoderId) -> Result<EncoderInfo, AccessError> {
        let handle: encoder::Handle = self.0.handle(id.0, "Invalid encoder")?;
        let info = self
            .0
            .get_encoder(handle)
            .map_err(self.0.access("Error loading encoder info"))?;
        let handles = self
            .0
            .resource_handles()
            .map_err(self.0.access("Error loading drm resources"))?;
        let allowed = handles.filter_crtcs(info.possible_crtcs());

        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(|h| CrtcId(h.into())),
            possible_crtcs: self.0.crtc_mask(&allowed),
        })
    }

    fn crtc(&self, id: CrtcId) -> Result<CrtcInfo, AccessError> {
        let handle: crtc::Handle = self.0.handle(id.0, "Invalid crtc")?;
        let info = self
            .0
            .get_crtc(handle)
            .map_err(self.0.access("Error loading crtc info"))?;

        Ok(CrtcInfo {
            id,
            framebuffer: info.framebuffer().map(|h| FramebufferId(h.into())),
            position: info.position(),
            mode: info.mode().map(mode_from_drm),
        })
    }

    fn planes(&self) -> Result<Vec<PlaneInfo>, AccessError> {
        let handles = self
            .0
            .resource_handles()
            .map_err(self.0.access("Error loading drm resources"))?;
        let planes = self
            .0
            .plane_handles()
            .map_err(self.0.access("Error loading plane resources"))?;

        planes
            .iter()
            .map(|handle| {
                let info = self
                    .0
                    .get_plane(*handle)
                    .map_err(self.0.access("Error loading plane info"))?;
                Ok(PlaneInfo {
                    id: PlaneId((*handle).into()),
                    possible_crtcs: self.0.crtc_mask(&handles.filter_crtcs(info.possible_crtcs())),
                    formats: info
                        .formats()
                        .iter()
                        .filter_map(|code| Fourcc::try_from(*code).ok())
                        .collect(),
                })
            })
            .collect()
    }

    #[instrument(level = "trace", parent = &self.0.span, skip(self))]
    fn add_framebuffer(
        &self,
        desc: &FramebufferDesc,
        registration: Registration,
    ) -> Result<FramebufferId, AccessError> {
        let handle = self.0.handle(desc.handle, "Invalid buffer handle")?;
        let buffer = Registered { desc, handle };
        let fb = match registration {
            Registration::Planar => self
                .0
                .add_planar_framebuffer(&buffer, FbCmd2Flags::empty())
                .map_err(self.0.access("Failed to add planar framebuffer"))?,
            Registration::Legacy { depth, bpp } => self
                .0
                .add_framebuffer(&buffer, depth, bpp)
                .map_err(self.0.access("Failed to add framebuffer"))?,
        };
        Ok(FramebufferId(fb.into()))
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<(), AccessError> {
        let handle: framebuffer::Handle = self.0.handle(fb.0, "Invalid framebuffer")?;
        self.0
            .destroy_framebuffer(handle)
            .map_err(self.0.access("Failed to destroy framebuffer"))
    }

    fn create_dumb(&self, size: (u32, u32), format: Fourcc, bpp: u32) -> Result<DumbAllocation, AccessError> {
        let buffer = self
            .0
            .create_dumb_buffer(size, format, bpp)
            .map_err(self.0.access("Failed to create dumb buffer"))?;
        let id = DumbId(self.0.next_dumb.fetch_add(1, Ordering::SeqCst));
        let allocation = DumbAllocation {
            id,
            handle: DrmBuffer::handle(&buffer).into(),
            pitch: DrmBuffer::pitch(&buffer),
            size: DrmBuffer::pitch(&buffer) as u64 * size.1 as u64,
        };
        self.0
            .dumbs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, buffer);
        Ok(allocation)
    }

    fn destroy_dumb(&self, dumb: DumbId) -> Result<(), AccessError> {
        let buffer = self
            .0
            .dumbs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dumb);
        match buffer {
            Some(buffer) => self
                .0
                .destroy_dumb_buffer(buffer)
                .map_err(self.0.access("Failed to destroy dumb buffer")),
            None => Ok(()),
        }
    }

    fn with_dumb_mapping(&self, dumb: DumbId, f: &mut dyn FnMut(&mut [u8])) -> Result<(), AccessError> {
        let mut dumbs = self.0.dumbs.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = dumbs.get_mut(&dumb).ok_or_else(|| {
            AccessError::new(
                "Unknown dumb buffer",
                self.0.dev_path(),
                io::Error::from(io::ErrorKind::NotFound),
            )
        })?;
        let mut mapping = self
            .0
            .map_dumb_buffer(buffer)
            .map_err(self.0.access("Failed to map dumb buffer"))?;
        f(&mut mapping);
        Ok(())
    }

    #[instrument(level = "debug", parent = &self.0.span, skip(self, connectors))]
    fn set_crtc(
        &self,
        crtc: CrtcId,
        fb: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> Result<(), AccessError> {
        let crtc_handle: crtc::Handle = self.0.handle(crtc.0, "Invalid crtc")?;
        let fb = fb
            .map(|fb| self.0.handle::<framebuffer::Handle>(fb.0, "Invalid framebuffer"))
            .transpose()?;
        let connectors = connectors
            .iter()
            .map(|conn| self.0.handle::<connector::Handle>(conn.0, "Invalid connector"))
            .collect::<Result<Vec<_>, _>>()?;
        ControlDevice::set_crtc(&*self.0, crtc_handle, fb, position, &connectors, mode.map(mode_to_drm))
            .map_err(self.0.access("Error setting crtc"))
    }

    #[instrument(level = "trace", parent = &self.0.span, skip(self))]
    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> Result<(), AccessError> {
        let crtc_handle: crtc::Handle = self.0.handle(crtc.0, "Invalid crtc")?;
        let fb_handle: framebuffer::Handle = self.0.handle(fb.0, "Invalid framebuffer")?;
        ControlDevice::page_flip(&*self.0, crtc_handle, fb_handle, PageFlipFlags::EVENT, None)
            .map_err(self.0.access("Failed to queue page flip"))
    }

    #[instrument(level = "trace", parent = &self.0.span, skip(self))]
    fn set_plane(&self, plane: PlaneId, crtc: CrtcId, config: &PlaneConfig) -> Result<(), AccessError> {
        let plane_handle: plane::Handle = self.0.handle(plane.0, "Invalid plane")?;
        let crtc_handle: crtc::Handle = self.0.handle(crtc.0, "Invalid crtc")?;
        let fb = config
            .fb
            .map(|fb| self.0.handle::<framebuffer::Handle>(fb.0, "Invalid framebuffer"))
            .transpose()?;
        let dst = config.dst;
        let src = config.src;
        ControlDevice::set_plane(
            &*self.0,
            plane_handle,
            crtc_handle,
            fb,
            0,
            (dst.loc.x, dst.loc.y, dst.size.w.max(0) as u32, dst.size.h.max(0) as u32),
            (
                src.loc.x.to_16_16(),
                src.loc.y.to_16_16(),
                src.size.w.to_16_16(),
                src.size.h.to_16_16(),
            ),
        )
        .map_err(self.0.access("Failed to set plane"))
    }

    fn queue_vblank(&self, pipe: u32, plane: PlaneId) -> Result<(), AccessError> {
        BasicDevice::wait_vblank(
            &*self.0,
            VblankWaitTarget::Relative(1),
            VblankWaitFlags::EVENT,
            pipe,
            plane.0 as usize,
        )
        .map(|_| ())
        .map_err(self.0.access("Failed to queue vblank event"))
    }

    #[allow(deprecated)]
    fn set_cursor(&self, crtc: CrtcId, buffer: Option<(DumbId, (u32, u32))>) -> Result<(), AccessError> {
        let crtc_handle: crtc::Handle = self.0.handle(crtc.0, "Invalid crtc")?;
        match buffer {
            Some((dumb, _size)) => {
                let dumbs = self.0.dumbs.lock().unwrap_or_else(PoisonError::into_inner);
                let buffer = dumbs.get(&dumb).ok_or_else(|| {
                    AccessError::new(
                        "Unknown cursor buffer",
                        self.0.dev_path(),
                        io::Error::from(io::ErrorKind::NotFound),
                    )
                })?;
                ControlDevice::set_cursor(&*self.0, crtc_handle, Some(buffer))
            }
            None => ControlDevice::set_cursor(&*self.0, crtc_handle, Option::<&DumbBuffer>::None),
        }
        .map_err(self.0.access("Failed to set cursor"))
    }

    #[allow(deprecated)]
    fn move_cursor(&self, crtc: CrtcId, position: (i32, i32)) -> Result<(), AccessError> {
        let crtc_handle: crtc::Handle = self.0.handle(crtc.0, "Invalid crtc")?;
        ControlDevice::move_cursor(&*self.0, crtc_handle, position)
            .map_err(self.0.access("Failed to move cursor"))
    }

    fn acquire_master(&self) -> Result<(), AccessError> {
        self.0
            .acquire_master_lock()
            .map_err(self.0.access("Failed to acquire drm master"))?;
        self.0.privileged.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release_master(&self) -> Result<(), AccessError> {
        if self.0.privileged.swap(false, Ordering::SeqCst) {
            self.0
                .release_master_lock()
                .map_err(self.0.access("Failed to drop drm master"))?;
        }
        Ok(())
    }
}
