//! Completion events of queued page-flips and vblank requests.

use std::time::Duration;

use super::device::{CrtcId, PlaneId};
use super::output::OutputId;

/// Completion reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionEvent {
    /// The primary plane of `crtc` flipped to the queued framebuffer
    PageFlip {
        /// Crtc the flip was queued on
        crtc: CrtcId,
        /// Vblank sequence number
        frame: u32,
        /// Timestamp of the flip
        time: Duration,
    },
    /// The vblank requested for an overlay plane passed
    Vblank {
        /// Plane the request was tagged with
        plane: PlaneId,
        /// Vblank sequence number
        frame: u32,
        /// Timestamp of the vblank
        time: Duration,
    },
}

/// An output finished presenting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCompletion {
    /// The output that finished
    pub output: OutputId,
    /// Presentation time
    pub time: Duration,
}

impl FrameCompletion {
    /// Presentation time in milliseconds, as `sec * 1000 + usec / 1000`
    pub fn msecs(&self) -> u32 {
        (self.time.as_secs() as u32)
            .wrapping_mul(1000)
            .wrapping_add(self.time.subsec_micros() / 1000)
    }
}

#[cfg(feature = "backend_drm")]
pub use self::source::DrmEventSource;

#[cfg(feature = "backend_drm")]
mod source {
    use std::io;
    use std::os::unix::io::{AsFd, BorrowedFd};

    use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
    use tracing::{info_span, warn};

    use super::CompletionEvent;
    use crate::backend::drm::device::DrmDeviceFd;

    /// Event source reading completion events from a drm device
    ///
    /// Feed the events into [`DrmBackend::handle_completion`](crate::backend::drm::DrmBackend::handle_completion).
    #[derive(Debug)]
    pub struct DrmEventSource {
        device: DrmDeviceFd,
        token: Option<Token>,
        span: tracing::Span,
    }

    impl DrmEventSource {
        /// Watch the given device for completion events
        pub fn new(device: DrmDeviceFd) -> DrmEventSource {
            DrmEventSource {
                device,
                token: None,
                span: info_span!("drm_events"),
            }
        }
    }

    impl AsFd for DrmEventSource {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.device.as_fd()
        }
    }

    impl EventSource for DrmEventSource {
        type Event = CompletionEvent;
        type Metadata = ();
        type Ret = ();
        type Error = io::Error;

        #[profiling::function]
        fn process_events<F>(&mut self, _: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
        where
            F: FnMut(Self::Event, &mut ()) -> Self::Ret,
        {
            if Some(token) != self.token {
                return Ok(PostAction::Continue);
            }
            let _guard = self.span.enter();
            match self.device.receive_completions() {
                Ok(events) => {
                    for event in events {
                        callback(event, &mut ());
                    }
                }
                Err(err) => {
                    warn!("Error reading drm events: {}", err);
                    return Err(err.source);
                }
            }
            Ok(PostAction::Continue)
        }

        fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
            let token = factory.token();
            self.token = Some(token);
            // Safety: the fd is owned by `self.device` and outlives the registration
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
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::FrameCompletion;
    use crate::backend::drm::output::OutputId;

    #[test]
    fn msecs_from_timestamp() {
        let done = FrameCompletion {
            output: OutputId(0),
            time: Duration::new(12, 345_678_000),
        };
        assert_eq!(done.msecs(), 12_345);
    }
}
