//! # Event Channels
//!
//! Three transports deliver records to a [`StreamConsumer`](crate::consumer::StreamConsumer):
//!
//! - [`KernelRing`]: the BPF ring buffer (`EVENTS` map), binary records
//! - [`LossyRing`]: an in-process bounded ring with the same drop-on-full behaviour
//! - [`TraceLog`]: the kernel trace pipe, one record per text line
//!
//! All of them wait with a bounded timeout so a consumer can observe its stop
//! flag between polls.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use crate::domain::ChannelError;

pub mod kernel_ring;
pub mod lossy_ring;
pub mod text_log;

pub use kernel_ring::KernelRing;
pub use lossy_ring::{lossy_ring, LossyProducer, LossyRing};
pub use text_log::{LineBuffer, TraceLog, DEFAULT_TRACE_PIPE};

/// A channel that can be drained in timed rounds.
pub trait RecordSource: Send {
    /// Short name used in logs and consumer reports.
    fn name(&self) -> &'static str;

    /// Wait up to `timeout` for data, then hand every available record to `sink`.
    ///
    /// Returns the number of records delivered. `Ok(0)` means the wait timed out.
    ///
    /// # Errors
    /// [`ChannelError::Disconnected`] once no further record can arrive;
    /// another [`ChannelError`] when the underlying wait or read fails.
    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, ChannelError>;
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, ChannelError> {
        (**self).poll(timeout, sink)
    }
}

/// Block until `fd` is readable or `timeout` elapses.
///
/// An interrupted wait (`EINTR`) counts as a timeout.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool, ChannelError> {
    let mut pfd = libc::pollfd { fd: fd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // SAFETY: pfd is a valid pollfd for the duration of the call and nfds is 1.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };

    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(ChannelError::Poll(err));
    }
    Ok(rc > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0)
}
