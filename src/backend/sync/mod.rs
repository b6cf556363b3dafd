//! Fence wrappers synchronizing buffer producers and the display pipeline
//!
//! Two kinds of fences travel with every frame:
//!
//! - An [`AcquireFence`] is handed in by the producer of a buffer and signals once
//!   the buffer contents are ready to be scanned out. It owns its file descriptor.
//! - An [`OutputFence`] is handed back to the producer (per layer for buffer release,
//!   per display for retirement). It writes into a caller-supplied [`FenceSlot`]
//!   and never leaks the descriptor it replaces.

use std::{
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use rustix::event::{EventfdFlags, PollFd, PollFlags};
use tracing::trace;

/// Fence signalling that a buffer's producer has finished writing it
///
/// Owns at most one file descriptor. Closing is idempotent and happens
/// automatically on drop or when a new descriptor is set.
#[derive(Debug, Default)]
pub struct AcquireFence {
    fd: Option<OwnedFd>,
}

impl AcquireFence {
    /// Wrap the given fence descriptor
    pub fn new(fd: OwnedFd) -> Self {
        AcquireFence { fd: Some(fd) }
    }

    /// A fence that does not wait for anything
    pub fn empty() -> Self {
        AcquireFence { fd: None }
    }

    /// Returns true if no descriptor is held
    pub fn is_empty(&self) -> bool {
        self.fd.is_none()
    }

    /// Borrow the held descriptor, if any
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Replace the held descriptor, closing the previous one
    pub fn set(&mut self, fd: Option<OwnedFd>) {
        self.fd = fd;
    }

    /// Take ownership of the held descriptor, leaving the fence empty
    pub fn take(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// Close the held descriptor
    ///
    /// Calling this on an empty fence does nothing.
    pub fn close(&mut self) {
        self.fd = None;
    }

    /// Queries the state of the fence without blocking
    ///
    /// An empty fence is always signaled.
    pub fn is_signaled(&self) -> bool {
        match self.fd.as_ref() {
            Some(fd) => matches!(poll_readable(fd.as_fd(), Duration::ZERO), Ok(true)),
            None => true,
        }
    }

    /// Blocks until the fence is signaled or `timeout` elapsed
    ///
    /// Returns `Ok(false)` on timeout.
    #[profiling::function]
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        match self.fd.as_ref() {
            Some(fd) => poll_readable(fd.as_fd(), timeout),
            None => Ok(true),
        }
    }
}

impl From<OwnedFd> for AcquireFence {
    fn from(fd: OwnedFd) -> Self {
        AcquireFence::new(fd)
    }
}

fn poll_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        match rustix::event::poll(&mut fds, remaining.as_millis().min(i32::MAX as u128) as i32) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                let revents = fds[0].revents();
                if revents.intersects(PollFlags::ERR | PollFlags::NVAL) {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
                return Ok(revents.contains(PollFlags::IN));
            }
            Err(rustix::io::Errno::INTR) => {
                trace!("fence wait interrupted, retrying");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Caller-owned storage an [`OutputFence`] writes into
///
/// Cloning yields another handle to the same slot.
#[derive(Debug, Clone, Default)]
pub struct FenceSlot(Arc<FenceSlotInner>);

#[derive(Debug, Default)]
struct FenceSlotInner {
    fd: Mutex<Option<OwnedFd>>,
    signals: AtomicUsize,
}

impl FenceSlot {
    /// Create a new empty slot
    pub fn new() -> Self {
        FenceSlot::default()
    }

    /// Take the stored descriptor out of the slot
    pub fn take(&self) -> Option<OwnedFd> {
        self.0.fd.lock().unwrap().take()
    }

    /// Returns true if a descriptor is currently stored
    pub fn is_set(&self) -> bool {
        self.0.fd.lock().unwrap().is_some()
    }

    /// How many times a descriptor has been stored into this slot
    pub fn signal_count(&self) -> usize {
        self.0.signals.load(Ordering::SeqCst)
    }
}

/// Writer for a [`FenceSlot`]
///
/// Storing a new descriptor closes the previous value of the slot first,
/// so repeated frames never leak descriptors.
#[derive(Debug, Clone)]
pub struct OutputFence {
    slot: FenceSlot,
}

impl OutputFence {
    /// Create a writer for the given slot
    pub fn new(slot: &FenceSlot) -> Self {
        OutputFence { slot: slot.clone() }
    }

    /// Store `fd` in the slot, closing whatever was stored before
    pub fn set(&self, fd: OwnedFd) {
        let previous = self.slot.0.fd.lock().unwrap().replace(fd);
        drop(previous);
        self.slot.0.signals.fetch_add(1, Ordering::SeqCst);
    }

    /// Store a duplicate of `fd` in the slot
    pub fn set_dup(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.set(crate::utils::dup_fd(fd)?);
        Ok(())
    }

    /// Store an already signaled fence in the slot
    pub fn signal(&self) -> io::Result<()> {
        self.set(signaled_fence()?);
        Ok(())
    }

    /// The slot written by this fence
    pub fn slot(&self) -> &FenceSlot {
        &self.slot
    }
}

/// Create a descriptor that polls readable right away
pub fn signaled_fence() -> io::Result<OwnedFd> {
    Ok(rustix::event::eventfd(1, EventfdFlags::CLOEXEC)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_acquire_fence_is_signaled() {
        let fence = AcquireFence::empty();
        assert!(fence.is_signaled());
        assert!(fence.wait(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn signaled_fence_polls_ready() {
        let fence = AcquireFence::new(signaled_fence().unwrap());
        assert!(fence.is_signaled());
        assert!(fence.wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let fd = rustix::event::eventfd(0, EventfdFlags::CLOEXEC).unwrap();
        let fence = AcquireFence::new(fd);
        assert!(!fence.is_signaled());
        assert!(!fence.wait(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn close_is_idempotent() {
        let mut fence = AcquireFence::new(signaled_fence().unwrap());
        fence.close();
        fence.close();
        assert!(fence.is_empty());
    }

    #[test]
    fn output_fence_replaces_previous() {
        let slot = FenceSlot::new();
        let out = OutputFence::new(&slot);
        assert!(!slot.is_set());
        out.signal().unwrap();
        out.signal().unwrap();
        assert_eq!(slot.signal_count(), 2);
        assert!(slot.take().is_some());
        assert!(slot.take().is_none());
    }
}
