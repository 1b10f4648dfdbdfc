//! Scanout buffer handles.
//!
//! A [`BufferHandle`] couples a registered framebuffer with whatever memory backs it.
//! Handles are created by the [`BufferAllocator`] and must be given back to it exactly
//! once; [`BufferAllocator::release_slot`] takes them out of their plane slot, so
//! releasing an empty slot a second time is a no-op.

use std::fmt;
use std::rc::Rc;

use tracing::{debug, info_span, instrument, trace, warn};

use super::device::{
    DumbAllocation, DumbId, FramebufferDesc, FramebufferId, KmsDevice, Registration, ResourceInfo,
};
use super::error::AccessError;
use crate::backend::format::{get_bpp, get_depth, Fourcc};
use crate::backend::renderer::{ClientBuffer, ScanoutBuffer};

/// Errors of buffer acquisition
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The buffer is smaller or larger than any framebuffer the device accepts
    #[error("Buffer size {0:?} is outside of the scanout limits")]
    GeometryOutOfBounds((u32, u32)),
    /// No registration exists for the pixel format
    #[error("Format {0:?} can not be registered for scanout")]
    FormatUnsupported(Fourcc),
    /// The device refused the framebuffer
    #[error("Failed to register framebuffer")]
    Registration(#[source] AccessError),
    /// The device could not allocate memory
    #[error("Failed to allocate dumb buffer")]
    AllocationFailed(#[source] AccessError),
}

/// Memory handed in by a renderer or imported from a client
#[derive(Debug)]
pub enum ProducerBuffer {
    /// Front buffer of a renderer's output surface
    Render(Box<dyn ScanoutBuffer>),
    /// A client buffer imported for direct scanout
    Imported(Box<dyn ScanoutBuffer>),
}

impl ProducerBuffer {
    fn scanout(&self) -> &dyn ScanoutBuffer {
        match self {
            ProducerBuffer::Render(bo) | ProducerBuffer::Imported(bo) => &**bo,
        }
    }
}

/// A buffer that could not be registered, handed back to the caller
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Rejected {
    /// Why registration failed
    #[source]
    pub error: BufferError,
    /// The buffer, to be returned to its producer
    pub buffer: ProducerBuffer,
}

enum Backing {
    Render(Box<dyn ScanoutBuffer>),
    Imported(Box<dyn ScanoutBuffer>),
    Dumb(DumbAllocation),
    /// Borrowed view of one of an output's persistent software images
    OutputImage { dumb: DumbId, index: usize },
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Render(_) => f.write_str("Render"),
            Backing::Imported(_) => f.write_str("Imported"),
            Backing::Dumb(alloc) => write!(f, "Dumb({:?})", alloc.id),
            Backing::OutputImage { index, .. } => write!(f, "OutputImage({})", index),
        }
    }
}

/// A framebuffer ready to be shown on a plane
#[derive(Debug)]
pub struct BufferHandle {
    fb: FramebufferId,
    size: (u32, u32),
    stride: u32,
    format: Fourcc,
    byte_size: u64,
    backing: Backing,
    client: Option<Rc<dyn ClientBuffer>>,
}

impl BufferHandle {
    /// The registered framebuffer
    pub fn framebuffer(&self) -> FramebufferId {
        self.fb
    }

    /// `(width, height)` in pixels
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Bytes per row
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Pixel format the framebuffer was registered with
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Size of the backing memory in bytes
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// The dumb buffer behind this handle, if CPU-mappable
    pub fn dumb(&self) -> Option<DumbId> {
        match &self.backing {
            Backing::Dumb(alloc) => Some(alloc.id),
            Backing::OutputImage { dumb, .. } => Some(*dumb),
            _ => None,
        }
    }

    /// Index of the software output image this handle shows
    pub fn output_image(&self) -> Option<usize> {
        match self.backing {
            Backing::OutputImage { index, .. } => Some(index),
            _ => None,
        }
    }

    /// The client buffer kept alive while this handle is on screen
    pub fn client_buffer(&self) -> Option<&Rc<dyn ClientBuffer>> {
        self.client.as_ref()
    }

    /// Keep `buffer` alive until this handle is released
    ///
    /// # Panics
    ///
    /// A handle holds at most one client reference; attaching a second one panics.
    pub fn attach_client_reference(&mut self, buffer: Rc<dyn ClientBuffer>) {
        assert!(
            self.client.is_none(),
            "scanout buffer already references a client buffer"
        );
        self.client = Some(buffer);
    }

    /// Non-owning view of a persistent software image, sharing its framebuffer
    ///
    /// Returns `None` if this handle is not backed by a dumb buffer.
    pub fn image_view(&self, index: usize) -> Option<BufferHandle> {
        let Backing::Dumb(alloc) = &self.backing else {
            return None;
        };
        Some(BufferHandle {
            fb: self.fb,
            size: self.size,
            stride: self.stride,
            format: self.format,
            byte_size: self.byte_size,
            backing: Backing::OutputImage { dumb: alloc.id, index },
            client: None,
        })
    }
}

/// What the owner of a released handle still has to do
#[must_use]
#[derive(Debug)]
pub enum Released {
    /// Nothing, the memory is gone or owned elsewhere
    Done,
    /// The buffer belongs to a render surface and must be returned to it
    ReturnToSurface(Box<dyn ScanoutBuffer>),
}

/// Framebuffer sizes accepted by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutLimits {
    /// `(width, height)` lower bound
    pub min: (u32, u32),
    /// `(width, height)` upper bound
    pub max: (u32, u32),
}

impl ScanoutLimits {
    /// Whether `size` lies within the limits, bounds included
    pub fn contains(&self, size: (u32, u32)) -> bool {
        (self.min.0..=self.max.0).contains(&size.0) && (self.min.1..=self.max.1).contains(&size.1)
    }
}

impl From<&ResourceInfo> for ScanoutLimits {
    fn from(resources: &ResourceInfo) -> Self {
        ScanoutLimits {
            min: resources.min_size,
            max: resources.max_size,
        }
    }
}

/// Creates and releases [`BufferHandle`]s on one device
#[derive(Debug)]
pub struct BufferAllocator<D: KmsDevice> {
    device: D,
    limits: ScanoutLimits,
    single_plane_only: bool,
    span: tracing::Span,
}

impl<D: KmsDevice> BufferAllocator<D> {
    /// Allocator for buffers within `limits`
    pub fn new(device: D, limits: ScanoutLimits) -> BufferAllocator<D> {
        BufferAllocator {
            device,
            limits,
            single_plane_only: false,
            span: info_span!("drm_buffers"),
        }
    }

    /// The device buffers are registered with
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Whether multi-planar registration failed once and is no longer attempted
    ///
    /// Overlay planes depend on it, so they are unusable once this is set.
    pub fn single_plane_only(&self) -> bool {
        self.single_plane_only
    }

    /// Register memory from a renderer or client as a framebuffer
    ///
    /// `format` overrides the buffer's own format, e.g. to register an ARGB buffer
    /// known to be fully opaque as XRGB. On failure the buffer is handed back.
    #[instrument(level = "trace", parent = &self.span, skip(self, buffer))]
    pub fn acquire_from_producer(
        &mut self,
        buffer: ProducerBuffer,
        format: Option<Fourcc>,
    ) -> Result<BufferHandle, Rejected> {
        let bo = buffer.scanout();
        let size = bo.size();
        if !self.limits.contains(size) {
            warn!(
                "Buffer of size {:?} is outside of the scanout limits {:?}",
                size, self.limits
            );
            return Err(Rejected {
                error: BufferError::GeometryOutOfBounds(size),
                buffer,
            });
        }

        let format = format.unwrap_or_else(|| bo.format());
        let desc = FramebufferDesc {
            size,
            format,
            pitch: bo.pitch(),
            handle: bo.handle(),
        };

        let mut fb = None;
        if !self.single_plane_only {
            match self.device.add_framebuffer(&desc, Registration::Planar) {
                Ok(id) => fb = Some(id),
                Err(err) => {
                    warn!(
                        "Multi-planar framebuffer registration failed, falling back to legacy registration: {}",
                        err
                    );
                    self.single_plane_only = true;
                }
            }
        }

        let fb = match fb {
            Some(fb) => fb,
            None => {
                let (Some(depth), Some(bpp)) = (get_depth(format), get_bpp(format)) else {
                    return Err(Rejected {
                        error: BufferError::FormatUnsupported(format),
                        buffer,
                    });
                };
                match self.device.add_framebuffer(&desc, Registration::Legacy { depth, bpp }) {
                    Ok(fb) => fb,
                    Err(err) => {
                        warn!("Failed to create framebuffer: {}", err);
                        return Err(Rejected {
                            error: BufferError::Registration(err),
                            buffer,
                        });
                    }
                }
            }
        };

        trace!(?fb, "Registered {:?} buffer of size {:?}", format, size);
        let stride = desc.pitch;
        Ok(BufferHandle {
            fb,
            size,
            stride,
            format,
            byte_size: stride as u64 * size.1 as u64,
            backing: match buffer {
                ProducerBuffer::Render(bo) => Backing::Render(bo),
                ProducerBuffer::Imported(bo) => Backing::Imported(bo),
            },
            client: None,
        })
    }

    /// Allocate and register a CPU-mappable buffer
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn acquire_dumb(&mut self, size: (u32, u32), format: Fourcc) -> Result<BufferHandle, BufferError> {
        let (Some(depth), Some(bpp)) = (get_depth(format), get_bpp(format)) else {
            return Err(BufferError::FormatUnsupported(format));
        };
        let alloc = self
            .device
            .create_dumb(size, format, bpp)
            .map_err(BufferError::AllocationFailed)?;
        let desc = FramebufferDesc {
            size,
            format,
            pitch: alloc.pitch,
            handle: alloc.handle,
        };
        let fb = match self.device.add_framebuffer(&desc, Registration::Legacy { depth, bpp }) {
            Ok(fb) => fb,
            Err(err) => {
                if let Err(err) = self.device.destroy_dumb(alloc.id) {
                    warn!("Failed to free dumb buffer: {}", err);
                }
                return Err(BufferError::Registration(err));
            }
        };

        debug!(?fb, "Allocated dumb buffer of size {:?}", size);
        Ok(BufferHandle {
            fb,
            size,
            stride: alloc.pitch,
            format,
            byte_size: alloc.size,
            backing: Backing::Dumb(alloc),
            client: None,
        })
    }

    /// Give a handle back
    ///
    /// Drops the client reference first, then unregisters the framebuffer and
    /// frees memory the handle owns.
    pub fn release(&self, handle: BufferHandle) -> Released {
        let BufferHandle {
            fb, backing, client, ..
        } = handle;
        drop(client);

        if let Backing::OutputImage { .. } = backing {
            return Released::Done;
        }
        if let Err(err) = self.device.remove_framebuffer(fb) {
            warn!("Failed to remove framebuffer {:?}: {}", fb, err);
        }
        match backing {
            Backing::Render(bo) => Released::ReturnToSurface(bo),
            Backing::Dumb(alloc) => {
                if let Err(err) = self.device.destroy_dumb(alloc.id) {
                    warn!("Failed to free dumb buffer: {}", err);
                }
                Released::Done
            }
            Backing::Imported(_) | Backing::OutputImage { .. } => Released::Done,
        }
    }

    /// Release whatever `slot` holds, leaving it empty
    pub fn release_slot(&self, slot: &mut Option<BufferHandle>) -> Released {
        match slot.take() {
            Some(handle) => self.release(handle),
            None => Released::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::backend::drm::device::mock::{Call, MockDevice};
    use crate::backend::renderer::test::{TestBo, TestClientBuffer};

    fn allocator(device: &MockDevice) -> BufferAllocator<MockDevice> {
        BufferAllocator::new(
            device.clone(),
            ScanoutLimits {
                min: (1, 1),
                max: (4096, 4096),
            },
        )
    }

    fn bo(w: u32, h: u32) -> Box<TestBo> {
        Box::new(TestBo {
            size: (w, h),
            handle: 7,
            format: Fourcc::Argb8888,
        })
    }

    #[test]
    fn legacy_fallback_is_sticky() {
        let device = MockDevice::new();
        device.state().fail_planar = true;
        let mut buffers = allocator(&device);

        let first = buffers
            .acquire_from_producer(ProducerBuffer::Imported(bo(64, 64)), Some(Fourcc::Xrgb8888))
            .unwrap();
        assert!(buffers.single_plane_only());
        device.state().fail_planar = false;
        let second = buffers
            .acquire_from_producer(ProducerBuffer::Imported(bo(64, 64)), None)
            .unwrap();

        assert_eq!(device.count(|call| matches!(call, Call::AddFb { planar: true, .. })), 0);
        assert_eq!(device.count(|call| matches!(call, Call::AddFb { planar: false, .. })), 2);
        assert_eq!(first.format(), Fourcc::Xrgb8888);
        assert_eq!(second.format(), Fourcc::Argb8888);
    }

    #[test]
    fn out_of_bounds_hands_buffer_back() {
        let device = MockDevice::new();
        let mut buffers = allocator(&device);

        let rejected = buffers
            .acquire_from_producer(ProducerBuffer::Render(bo(8192, 64)), None)
            .unwrap_err();
        assert!(matches!(rejected.error, BufferError::GeometryOutOfBounds((8192, 64))));
        assert!(matches!(rejected.buffer, ProducerBuffer::Render(_)));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn yuv_dumb_buffers_are_refused() {
        let device = MockDevice::new();
        let mut buffers = allocator(&device);

        let err = buffers.acquire_dumb((64, 64), Fourcc::Nv12).unwrap_err();
        assert!(matches!(err, BufferError::FormatUnsupported(Fourcc::Nv12)));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn release_slot_is_idempotent() {
        let device = MockDevice::new();
        let mut buffers = allocator(&device);
        let mut slot = Some(buffers.acquire_dumb((64, 64), Fourcc::Xrgb8888).unwrap());

        assert!(matches!(buffers.release_slot(&mut slot), Released::Done));
        assert!(matches!(buffers.release_slot(&mut slot), Released::Done));

        assert_eq!(device.count(|call| matches!(call, Call::RmFb(_))), 1);
        assert_eq!(device.count(|call| matches!(call, Call::DestroyDumb(_))), 1);
        assert!(device.state().dumbs.is_empty());
    }

    #[test]
    fn render_buffers_return_to_surface() {
        let device = MockDevice::new();
        let mut buffers = allocator(&device);
        let handle = buffers
            .acquire_from_producer(ProducerBuffer::Render(bo(64, 64)), Some(Fourcc::Xrgb8888))
            .unwrap();

        assert!(matches!(buffers.release(handle), Released::ReturnToSurface(_)));
        assert!(device.state().framebuffers.is_empty());
    }

    #[test]
    fn client_reference_dropped_on_release() {
        let device = MockDevice::new();
        let mut buffers = allocator(&device);
        let client = TestClientBuffer::gpu(64, 64, Fourcc::Xrgb8888);
        let mut handle = buffers
            .acquire_from_producer(ProducerBuffer::Imported(bo(64, 64)), None)
            .unwrap();
        handle.attach_client_reference(client.clone());
        assert_eq!(Rc::strong_count(&client), 2);

        let _ = buffers.release(handle);
        assert_eq!(Rc::strong_count(&client), 1);
    }

    #[test]
    #[should_panic]
    fn second_client_reference_panics() {
        let device = MockDevice::new();
        let mut buffers = allocator(&device);
        let mut handle = buffers
            .acquire_from_producer(ProducerBuffer::Imported(bo(64, 64)), None)
            .unwrap();
        handle.attach_client_reference(TestClientBuffer::gpu(64, 64, Fourcc::Xrgb8888));
        handle.attach_client_reference(TestClientBuffer::gpu(64, 64, Fourcc::Xrgb8888));
    }

    #[test]
    fn image_views_share_the_framebuffer() {
        let device = MockDevice::new();
        let mut buffers = allocator(&device);
        let image = buffers.acquire_dumb((32, 32), Fourcc::Xrgb8888).unwrap();
        let mut slot = image.image_view(1);

        assert_eq!(slot.as_ref().map(|view| view.framebuffer()), Some(image.framebuffer()));
        assert!(matches!(buffers.release_slot(&mut slot), Released::Done));
        assert_eq!(device.count(|call| matches!(call, Call::RmFb(_))), 0);
        let _ = buffers.release(image);
        assert_eq!(device.count(|call| matches!(call, Call::RmFb(_))), 1);
    }
}
