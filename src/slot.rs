use std::os::unix::io::RawFd;

use crate::error::Error;
use crate::interest::Interest;

/// A continuation is invoked exactly once, with the result of the
/// readiness wait (`Ok(())` for "retry your syscall now", or an error if
/// the Slot was cancelled/closed before readiness arrived).
pub(crate) type Continuation = Box<dyn FnOnce(Result<(), Error>)>;

/// Per-descriptor bookkeeping owned by exactly one endpoint.
///
/// Endpoints box their `Slot` so its address is stable for the lifetime of
/// the registration — the poller's epoll token for this fd literally is
/// that address (see `poller` module docs). This is why `Slot` is not
/// `Clone`/`Copy` and endpoints always hold it behind a `Box`.
pub(crate) struct Slot {
    pub(crate) fd: RawFd,
    flags: Interest,
    on_read: Option<Continuation>,
    on_write: Option<Continuation>,
}

impl Slot {
    pub(crate) fn new(fd: RawFd) -> Slot {
        Slot {
            fd,
            flags: Interest::empty(),
            on_read: None,
            on_write: None,
        }
    }

    pub(crate) fn armed(&self) -> Interest {
        self.flags
    }

    pub(crate) fn set_read(&mut self, cb: Continuation) {
        debug_assert!(self.on_read.is_none(), "at most one outstanding read per Slot");
        self.on_read = Some(cb);
        self.flags.insert(Interest::readable());
    }

    pub(crate) fn set_write(&mut self, cb: Continuation) {
        debug_assert!(self.on_write.is_none(), "at most one outstanding write per Slot");
        self.on_write = Some(cb);
        self.flags.insert(Interest::writable());
    }

    /// Clears the read arming and returns its continuation, if any. The
    /// flag is cleared before the caller invokes the handler, per the
    /// Slot state-machine invariant (`Armed -> Ready -> Idle` happens
    /// before the handler runs, so a re-arm inside the handler is seen as
    /// a fresh arming).
    pub(crate) fn take_read(&mut self) -> Option<Continuation> {
        self.flags.remove(Interest::readable());
        self.on_read.take()
    }

    pub(crate) fn take_write(&mut self) -> Option<Continuation> {
        self.flags.remove(Interest::writable());
        self.on_write.take()
    }

    /// Fires any pending continuations with `err` (used by `Close`), in
    /// FIFO order: read before write, matching issue order in practice
    /// since most protocols arm read before write on the same Slot.
    pub(crate) fn cancel_all(&mut self, err: impl Fn() -> Error) {
        if let Some(cb) = self.take_read() {
            cb(Err(err()));
        }
        if let Some(cb) = self.take_write() {
            cb(Err(err()));
        }
    }
}
