//! Contract between the display backend and the compositor's renderers.
//!
//! The backend drives exactly one renderer for its lifetime, chosen at startup:
//!
//! - a [`GpuRenderer`] drawing into per-output surfaces whose front buffers
//!   are locked and scanned out directly, and which can import client
//!   buffers for direct scanout and overlays
//! - a [`SoftwareRenderer`] drawing into two CPU-mapped dumb buffers per output

use std::fmt;

use crate::backend::drm::OutputId;
use crate::backend::format::Fourcc;
use crate::utils::{Buffer, Logical, Physical, Region, Size};

/// Memory the device can wrap into a framebuffer
pub trait ScanoutBuffer: fmt::Debug {
    /// `(width, height)` in pixels
    fn size(&self) -> (u32, u32);
    /// Bytes per row
    fn pitch(&self) -> u32;
    /// GEM handle on the scanout device
    fn handle(&self) -> u32;
    /// Pixel format
    fn format(&self) -> Fourcc;
}

#[cfg(feature = "backend_gbm")]
impl<T: 'static> ScanoutBuffer for gbm::BufferObject<T> {
    fn size(&self) -> (u32, u32) {
        drm::buffer::Buffer::size(self)
    }
    fn pitch(&self) -> u32 {
        drm::buffer::Buffer::pitch(self)
    }
    fn handle(&self) -> u32 {
        drm::buffer::Buffer::handle(self).into()
    }
    fn format(&self) -> Fourcc {
        drm::buffer::Buffer::format(self)
    }
}

/// CPU-visible pixels of a shared-memory client buffer
#[derive(Debug, Clone, Copy)]
pub struct ShmBuffer<'a> {
    /// Pixel rows, `stride` bytes apart
    pub data: &'a [u8],
    /// Bytes per row
    pub stride: usize,
}

/// A buffer attached by a client
pub trait ClientBuffer: fmt::Debug {
    /// Size in buffer pixels
    fn size(&self) -> Size<i32, Buffer>;
    /// Pixel format
    fn format(&self) -> Fourcc;
    /// Pixels of shared-memory buffers, `None` for GPU buffers
    fn shm(&self) -> Option<ShmBuffer<'_>>;
}

/// Errors of the per-output render state
#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    /// The renderer could not create its state for the output
    #[error("Failed to set up output rendering")]
    OutputSetup(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The scanout images of a software output could not be allocated
    #[error("Failed to allocate scanout images")]
    ImageAllocation(#[source] crate::backend::drm::BufferError),
}

/// Hardware accelerated renderer
pub trait GpuRenderer: fmt::Debug {
    /// Create the render surface of an output, with buffers in `format`
    fn create_output_surface(
        &mut self,
        output: OutputId,
        size: Size<i32, Physical>,
        format: Fourcc,
    ) -> Result<(), RendererError>;
    /// Tear down the render surface of an output
    fn destroy_output_surface(&mut self, output: OutputId);
    /// Draw the damaged part of the output into its surface
    fn repaint_output(&mut self, output: OutputId, damage: &Region<Logical>);
    /// Take the last drawn buffer of the surface for scanout
    fn lock_front_buffer(&mut self, output: OutputId) -> Option<Box<dyn ScanoutBuffer>>;
    /// Give a buffer obtained by [`lock_front_buffer`](GpuRenderer::lock_front_buffer) back
    fn release_buffer(&mut self, output: OutputId, buffer: Box<dyn ScanoutBuffer>);
    /// Make a client buffer scanout capable, if possible
    fn import_client_buffer(&mut self, buffer: &dyn ClientBuffer) -> Option<Box<dyn ScanoutBuffer>>;
}

/// Target image of the next software repaint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareTarget {
    /// Which of the two output images is drawn
    pub index: usize,
    #[allow(missing_docs)]
    pub size: Size<i32, Physical>,
    /// Bytes per row
    pub stride: u32,
    #[allow(missing_docs)]
    pub format: Fourcc,
}

/// CPU renderer
pub trait SoftwareRenderer: fmt::Debug {
    /// Set up rendering for an output
    fn create_output(&mut self, output: OutputId, size: Size<i32, Physical>) -> Result<(), RendererError>;
    /// Tear down rendering for an output
    fn destroy_output(&mut self, output: OutputId);
    /// Select the image the next repaint draws into
    fn set_target_buffer(&mut self, output: OutputId, target: &SoftwareTarget);
    /// Draw the damaged part of the output into the mapped target image
    fn repaint_output(&mut self, output: OutputId, damage: &Region<Logical>, pixels: &mut [u8]);
}

/// The renderer driven by the backend
#[derive(Debug)]
pub enum Renderer {
    /// GPU composition with direct scanout of render buffers
    Gpu(Box<dyn GpuRenderer>),
    /// CPU composition into dumb buffers
    Software(Box<dyn SoftwareRenderer>),
}

impl Renderer {
    /// Whether GPU buffers (and with them overlays, cursors and direct scanout) are available
    pub fn is_gpu(&self) -> bool {
        matches!(self, Renderer::Gpu(_))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug)]
    pub(crate) struct TestBo {
        pub size: (u32, u32),
        pub handle: u32,
        pub format: Fourcc,
    }

    impl ScanoutBuffer for TestBo {
        fn size(&self) -> (u32, u32) {
            self.size
        }
        fn pitch(&self) -> u32 {
            self.size.0 * 4
        }
        fn handle(&self) -> u32 {
            self.handle
        }
        fn format(&self) -> Fourcc {
            self.format
        }
    }

    #[derive(Debug)]
    pub(crate) struct TestClientBuffer {
        pub size: (i32, i32),
        pub format: Fourcc,
        pub pixels: Option<Vec<u8>>,
    }

    impl TestClientBuffer {
        pub(crate) fn gpu(w: i32, h: i32, format: Fourcc) -> Rc<TestClientBuffer> {
            Rc::new(TestClientBuffer {
                size: (w, h),
                format,
                pixels: None,
            })
        }

        pub(crate) fn shm(w: i32, h: i32, fill: u8) -> Rc<TestClientBuffer> {
            Rc::new(TestClientBuffer {
                size: (w, h),
                format: Fourcc::Argb8888,
                pixels: Some(vec![fill; (w * h * 4) as usize]),
            })
        }
    }

    impl ClientBuffer for TestClientBuffer {
        fn size(&self) -> Size<i32, Buffer> {
            self.size.into()
        }
        fn format(&self) -> Fourcc {
            self.format
        }
        fn shm(&self) -> Option<ShmBuffer<'_>> {
            self.pixels.as_ref().map(|data| ShmBuffer {
                data,
                stride: self.size.0 as usize * 4,
            })
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct GpuLog {
        pub surfaces: HashSet<OutputId>,
        pub sizes: Vec<(OutputId, Size<i32, Physical>)>,
        pub repaints: Vec<OutputId>,
        pub locked: usize,
        pub released: usize,
        pub imports: usize,
        pub fail_lock: bool,
        next_handle: u32,
    }

    impl GpuLog {
        pub(crate) fn outstanding(&self) -> usize {
            self.locked - self.released
        }
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct TestGpuRenderer(pub Rc<RefCell<GpuLog>>);

    impl GpuRenderer for TestGpuRenderer {
        fn create_output_surface(
            &mut self,
            output: OutputId,
            size: Size<i32, Physical>,
            _format: Fourcc,
        ) -> Result<(), RendererError> {
            let mut log = self.0.borrow_mut();
            log.surfaces.insert(output);
            log.sizes.push((output, size));
            Ok(())
        }

        fn destroy_output_surface(&mut self, output: OutputId) {
            self.0.borrow_mut().surfaces.remove(&output);
        }

        fn repaint_output(&mut self, output: OutputId, _damage: &Region<Logical>) {
            self.0.borrow_mut().repaints.push(output);
        }

        fn lock_front_buffer(&mut self, output: OutputId) -> Option<Box<dyn ScanoutBuffer>> {
            let mut log = self.0.borrow_mut();
            if log.fail_lock {
                return None;
            }
            let size = log
                .sizes
                .iter()
                .rev()
                .find(|(id, _)| *id == output)
                .map(|(_, size)| (size.w as u32, size.h as u32))?;
            log.locked += 1;
            log.next_handle += 1;
            Some(Box::new(TestBo {
                size,
                handle: 1000 + log.next_handle,
                format: Fourcc::Xrgb8888,
            }))
        }

        fn release_buffer(&mut self, _output: OutputId, _buffer: Box<dyn ScanoutBuffer>) {
            self.0.borrow_mut().released += 1;
        }

        fn import_client_buffer(&mut self, buffer: &dyn ClientBuffer) -> Option<Box<dyn ScanoutBuffer>> {
            if buffer.shm().is_some() {
                return None;
            }
            let mut log = self.0.borrow_mut();
            log.imports += 1;
            log.next_handle += 1;
            let size = buffer.size();
            Some(Box::new(TestBo {
                size: (size.w as u32, size.h as u32),
                handle: 2000 + log.next_handle,
                format: buffer.format(),
            }))
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct SoftwareLog {
        pub outputs: HashSet<OutputId>,
        pub targets: Vec<(OutputId, usize)>,
        pub damage: Vec<Region<Logical>>,
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct TestSoftwareRenderer(pub Rc<RefCell<SoftwareLog>>);

    impl SoftwareRenderer for TestSoftwareRenderer {
        fn create_output(&mut self, output: OutputId, _size: Size<i32, Physical>) -> Result<(), RendererError> {
            self.0.borrow_mut().outputs.insert(output);
            Ok(())
        }

        fn destroy_output(&mut self, output: OutputId) {
            self.0.borrow_mut().outputs.remove(&output);
        }

        fn set_target_buffer(&mut self, output: OutputId, target: &SoftwareTarget) {
            self.0.borrow_mut().targets.push((output, target.index));
        }

        fn repaint_output(&mut self, _output: OutputId, damage: &Region<Logical>, pixels: &mut [u8]) {
            pixels.fill(0xff);
            self.0.borrow_mut().damage.push(damage.clone());
        }
    }
}
