//! In-memory device recording every request, for tests.

use std::cell::{RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use super::*;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    AddFb { fb: FramebufferId, planar: bool },
    RmFb(FramebufferId),
    CreateDumb(DumbId),
    DestroyDumb(DumbId),
    SetCrtc { crtc: CrtcId, fb: Option<FramebufferId>, mode: Option<ModeInfo> },
    PageFlip { crtc: CrtcId, fb: FramebufferId },
    SetPlane { plane: PlaneId, crtc: CrtcId, config: PlaneConfig },
    QueueVblank { pipe: u32, plane: PlaneId },
    SetCursor { crtc: CrtcId, dumb: Option<DumbId> },
    MoveCursor { crtc: CrtcId, position: (i32, i32) },
    AcquireMaster,
    ReleaseMaster,
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub resources: ResourceInfo,
    pub connectors: HashMap<ConnectorId, ConnectorInfo>,
    pub encoders: HashMap<EncoderId, EncoderInfo>,
    pub crtcs: HashMap<CrtcId, CrtcInfo>,
    pub planes: Vec<PlaneInfo>,
    pub calls: Vec<Call>,
    pub framebuffers: HashSet<FramebufferId>,
    pub dumbs: HashMap<DumbId, Vec<u8>>,
    pub fail_planar: bool,
    pub fail_legacy: bool,
    pub fail_set_crtc: bool,
    pub fail_page_flip: bool,
    pub fail_set_plane: bool,
    pub fail_vblank: bool,
    pub fail_cursor: bool,
    next_id: u32,
}

impl MockState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockDevice(pub Rc<RefCell<MockState>>);

fn failure(errmsg: &'static str) -> AccessError {
    AccessError::new(errmsg, None, io::Error::new(io::ErrorKind::Other, "injected failure"))
}

impl MockDevice {
    pub(crate) fn new() -> MockDevice {
        let device = MockDevice::default();
        {
            let mut state = device.state();
            state.resources.min_size = (1, 1);
            state.resources.max_size = (8192, 8192);
        }
        device
    }

    pub(crate) fn state(&self) -> RefMut<'_, MockState> {
        self.0.borrow_mut()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.0.borrow().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.borrow().calls.iter().filter(|call| pred(call)).count()
    }

    pub(crate) fn add_crtc(&self) -> CrtcId {
        let mut state = self.state();
        let id = CrtcId(state.next_id());
        state.resources.crtcs.push(id);
        state.crtcs.insert(
            id,
            CrtcInfo {
                id,
                framebuffer: None,
                position: (0, 0),
                mode: None,
            },
        );
        id
    }

    /// A connected connector whose encoder can reach every crtc
    pub(crate) fn add_connector(&self, interface: ConnectorInterface, modes: Vec<ModeInfo>) -> ConnectorId {
        let mut state = self.state();
        let id = ConnectorId(state.next_id());
        let encoder = EncoderId(state.next_id());
        let all_crtcs = (1u32 << state.resources.crtcs.len()) - 1;
        let interface_id = state
            .connectors
            .values()
            .filter(|conn| conn.interface == interface)
            .count() as u32
            + 1;

        state.resources.connectors.push(id);
        state.resources.encoders.push(encoder);
        state.encoders.insert(
            encoder,
            EncoderInfo {
                id: encoder,
                crtc: None,
                possible_crtcs: all_crtcs,
            },
        );
        state.connectors.insert(
            id,
            ConnectorInfo {
                id,
                interface,
                interface_id,
                state: ConnectorState::Connected,
                modes,
                encoders: vec![encoder],
                current_encoder: None,
                physical_size: (520, 290),
                subpixel: Subpixel::Unknown,
            },
        );
        id
    }

    pub(crate) fn set_connected(&self, connector: ConnectorId, connected: bool) {
        if let Some(info) = self.state().connectors.get_mut(&connector) {
            info.state = if connected {
                ConnectorState::Connected
            } else {
                ConnectorState::Disconnected
            };
        }
    }

    /// Route the connector's encoder to `crtc`, which already scans out `mode`
    pub(crate) fn attach(&self, connector: ConnectorId, crtc: CrtcId, mode: ModeInfo) {
        let mut state = self.state();
        let Some(encoder) = state.connectors.get(&connector).map(|conn| conn.encoders[0]) else {
            return;
        };
        if let Some(conn) = state.connectors.get_mut(&connector) {
            conn.current_encoder = Some(encoder);
        }
        if let Some(enc) = state.encoders.get_mut(&encoder) {
            enc.crtc = Some(crtc);
        }
        if let Some(info) = state.crtcs.get_mut(&crtc) {
            info.mode = Some(mode);
            info.framebuffer = Some(FramebufferId(9999));
        }
    }

    pub(crate) fn add_plane(&self, possible_crtcs: u32, formats: Vec<Fourcc>) -> PlaneId {
        let mut state = self.state();
        let id = PlaneId(state.next_id());
        state.planes.push(PlaneInfo {
            id,
            possible_crtcs,
            formats,
        });
        id
    }
}

impl KmsDevice for MockDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("/dev/dri/card0"))
    }

    fn resources(&self) -> Result<ResourceInfo, AccessError> {
        Ok(self.0.borrow().resources.clone())
    }

    fn connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, AccessError> {
        self.0
            .borrow()
            .connectors
            .get(&connector)
            .cloned()
            .ok_or_else(|| failure("Unknown connector"))
    }

    fn encoder(&self, encoder: EncoderId) -> Result<EncoderInfo, AccessError> {
        self.0
            .borrow()
            .encoders
            .get(&encoder)
            .cloned()
            .ok_or_else(|| failure("Unknown encoder"))
    }

    fn crtc(&self, crtc: CrtcId) -> Result<CrtcInfo, AccessError> {
        self.0
            .borrow()
            .crtcs
            .get(&crtc)
            .cloned()
            .ok_or_else(|| failure("Unknown crtc"))
    }

    fn planes(&self) -> Result<Vec<PlaneInfo>, AccessError> {
        Ok(self.0.borrow().planes.clone())
    }

    fn add_framebuffer(
        &self,
        _desc: &FramebufferDesc,
        registration: Registration,
    ) -> Result<FramebufferId, AccessError> {
        let mut state = self.state();
        let planar = registration == Registration::Planar;
        if (planar && state.fail_planar) || (!planar && state.fail_legacy) {
            return Err(failure("Failed to add framebuffer"));
        }
        let fb = FramebufferId(state.next_id());
        state.framebuffers.insert(fb);
        state.calls.push(Call::AddFb { fb, planar });
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<(), AccessError> {
        let mut state = self.state();
        state.calls.push(Call::RmFb(fb));
        if state.framebuffers.remove(&fb) {
            Ok(())
        } else {
            Err(failure("Unknown framebuffer"))
        }
    }

    fn create_dumb(&self, size: (u32, u32), _format: Fourcc, bpp: u32) -> Result<DumbAllocation, AccessError> {
        let mut state = self.state();
        let id = DumbId(state.next_id());
        let pitch = size.0 * bpp / 8;
        let bytes = pitch as u64 * size.1 as u64;
        state.dumbs.insert(id, vec![0; bytes as usize]);
        state.calls.push(Call::CreateDumb(id));
        Ok(DumbAllocation {
            id,
            handle: id.0,
            pitch,
            size: bytes,
        })
    }

    fn destroy_dumb(&self, dumb: DumbId) -> Result<(), AccessError> {
        let mut state = self.state();
        state.calls.push(Call::DestroyDumb(dumb));
        state
            .dumbs
            .remove(&dumb)
            .map(|_| ())
            .ok_or_else(|| failure("Unknown dumb buffer"))
    }

    fn with_dumb_mapping(&self, dumb: DumbId, f: &mut dyn FnMut(&mut [u8])) -> Result<(), AccessError> {
        let mut state = self.state();
        let data = state.dumbs.get_mut(&dumb).ok_or_else(|| failure("Unknown dumb buffer"))?;
        f(data);
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        fb: Option<FramebufferId>,
        _position: (u32, u32),
        _connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> Result<(), AccessError> {
        let mut state = self.state();
        if state.fail_set_crtc {
            return Err(failure("Error setting crtc"));
        }
        state.calls.push(Call::SetCrtc {
            crtc,
            fb,
            mode: mode.cloned(),
        });
        if let Some(info) = state.crtcs.get_mut(&crtc) {
            info.framebuffer = fb;
            info.mode = mode.cloned();
        }
        Ok(())
    }

    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> Result<(), AccessError> {
        let mut state = self.state();
        if state.fail_page_flip {
            return Err(failure("Failed to queue page flip"));
        }
        state.calls.push(Call::PageFlip { crtc, fb });
        Ok(())
    }

    fn set_plane(&self, plane: PlaneId, crtc: CrtcId, config: &PlaneConfig) -> Result<(), AccessError> {
        let mut state = self.state();
        if state.fail_set_plane {
            return Err(failure("Failed to set plane"));
        }
        state.calls.push(Call::SetPlane {
            plane,
            crtc,
            config: *config,
        });
        Ok(())
    }

    fn queue_vblank(&self, pipe: u32, plane: PlaneId) -> Result<(), AccessError> {
        let mut state = self.state();
        if state.fail_vblank {
            return Err(failure("Failed to queue vblank event"));
        }
        state.calls.push(Call::QueueVblank { pipe, plane });
        Ok(())
    }

    fn set_cursor(&self, crtc: CrtcId, buffer: Option<(DumbId, (u32, u32))>) -> Result<(), AccessError> {
        let mut state = self.state();
        if state.fail_cursor && buffer.is_some() {
            return Err(failure("Failed to set cursor"));
        }
        state.calls.push(Call::SetCursor {
            crtc,
            dumb: buffer.map(|(dumb, _)| dumb),
        });
        Ok(())
    }

    fn move_cursor(&self, crtc: CrtcId, position: (i32, i32)) -> Result<(), AccessError> {
        let mut state = self.state();
        if state.fail_cursor {
            return Err(failure("Failed to move cursor"));
        }
        state.calls.push(Call::MoveCursor { crtc, position });
        Ok(())
    }

    fn acquire_master(&self) -> Result<(), AccessError> {
        self.state().calls.push(Call::AcquireMaster);
        Ok(())
    }

    fn release_master(&self) -> Result<(), AccessError> {
        self.state().calls.push(Call::ReleaseMaster);
        Ok(())
    }
}
