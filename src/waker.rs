//! Cross-thread wakeup doorbell backing `Reactor::post`.
//!
//! The reactor itself is `!Send` (its `Slot`s and timer heap are plain
//! `Rc`/`RefCell` state), so the only thread-safe surface is `post`, which
//! pushes a callback onto a mutex-guarded queue and then writes to this
//! eventfd to break the owning thread out of `epoll_wait`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::sys::eventfd::EventFd;

#[derive(Clone)]
pub(crate) struct Waker {
    inner: Arc<EventFd>,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: Arc::new(EventFd::new()?),
        })
    }

    /// Wakes the reactor thread. Safe to call from any thread, any number
    /// of times before the reactor drains it — writes coalesce into the
    /// eventfd's counter, and a saturated counter (`EAGAIN`) still means
    /// the reactor thread has a pending wakeup, so that case is not an
    /// error here.
    pub(crate) fn wake(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drains the counter after a wakeup-triggered `epoll_wait` return.
    pub(crate) fn drain(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
