//! The single-threaded I/O context: owns the poller and timer heap, tracks
//! the pending-operation count, and dispatches ready handlers.
//!
//! A `Reactor` is cheap to clone — clones share the same underlying state
//! via `Rc<RefCell<_>>` — but every clone must stay on the thread that
//! created the original; nothing here is `Send`. The sole exception is
//! [`Handle::post`], obtained via [`Reactor::handle`], which is the one
//! thread-safe surface the crate exposes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::Error;
use crate::interest::ReadyEvent;
use crate::poller::Poller;
use crate::slot::Slot;
use crate::timer::{TimerCallback, TimerHandle, TimerHeap};
use crate::token::Token;
use crate::waker::Waker;

/// Bounds synchronous callback recursion when eager syscalls keep
/// succeeding inline. Implementation-defined per the operation protocol;
/// 32 matches the reference figure.
pub(crate) const MAX_CALLBACK_DISPATCH: usize = 32;

const TOKEN_WAKER: u64 = 0;
const TOKEN_TIMER: u64 = 1;

type PostedWork = Box<dyn FnOnce() + Send>;

struct Inner {
    poller: Poller,
    timers: TimerHeap,
    waker: Waker,
    posted: Arc<Mutex<VecDeque<PostedWork>>>,
    pending: usize,
    dispatch_depth: usize,
    closed: bool,
}

/// The reactor's configuration, mirroring the teacher crate's builder
/// style for small numeric knobs.
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    pub event_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig { event_capacity: 1024 }
    }
}

impl ReactorConfig {
    pub fn event_capacity(mut self, capacity: usize) -> ReactorConfig {
        self.event_capacity = capacity;
        self
    }
}

/// Single-threaded reactor. See the module docs for the threading
/// contract.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
}

/// The one cross-thread handle this crate exposes: lets another thread
/// schedule a callback to run on the reactor thread.
#[derive(Clone)]
pub struct Handle {
    waker: Waker,
    posted: Arc<Mutex<VecDeque<PostedWork>>>,
}

impl Handle {
    /// Enqueues `f` to run on the reactor thread and wakes it if it is
    /// currently blocked in `poll`. This is safe to call from any thread,
    /// including the reactor's own.
    pub fn post<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.posted.lock().unwrap().push_back(Box::new(f));
        self.waker.wake()
    }
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Reactor::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> io::Result<Reactor> {
        let mut poller = Poller::new(config.event_capacity)?;
        let timers = TimerHeap::new()?;
        let waker = Waker::new()?;

        poller.register_raw(waker.as_raw_fd(), TOKEN_WAKER)?;
        poller.register_raw(timers.as_raw_fd(), TOKEN_TIMER)?;

        debug!("reactor started, event_capacity={}", config.event_capacity);

        Ok(Reactor {
            inner: Rc::new(RefCell::new(Inner {
                poller,
                timers,
                waker,
                posted: Arc::new(Mutex::new(VecDeque::new())),
                pending: 0,
                dispatch_depth: 0,
                closed: false,
            })),
        })
    }

    pub fn handle(&self) -> Handle {
        let inner = self.inner.borrow();
        Handle {
            waker: inner.waker.clone(),
            posted: inner.posted.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Wakes any blocked `run` with `Error::Closed` and marks the reactor
    /// so further operations fail fast. Does not close endpoints; callers
    /// are expected to have dropped or closed their endpoints already.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let _ = inner.waker.wake();
        debug!("reactor closed");
    }

    // -- registration, used by net::tcp / net::udp --------------------

    pub(crate) fn register_read(&self, slot: *mut Slot) -> io::Result<()> {
        let fd = unsafe { (*slot).fd };
        let mut inner = self.inner.borrow_mut();
        if inner.poller.register_read(fd, slot)? {
            inner.pending += 1;
        }
        Ok(())
    }

    pub(crate) fn register_write(&self, slot: *mut Slot) -> io::Result<()> {
        let fd = unsafe { (*slot).fd };
        let mut inner = self.inner.borrow_mut();
        if inner.poller.register_write(fd, slot)? {
            inner.pending += 1;
        }
        Ok(())
    }

    pub(crate) fn deregister_read(&self, fd: RawFd) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.poller.deregister_read(fd)? {
            inner.pending = inner.pending.saturating_sub(1);
        }
        Ok(())
    }

    pub(crate) fn deregister_write(&self, fd: RawFd) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.poller.deregister_write(fd)? {
            inner.pending = inner.pending.saturating_sub(1);
        }
        Ok(())
    }

    /// Arms a one-shot timer; `cb` runs on the reactor thread once `delay`
    /// has elapsed, ordered against other timers by `(deadline, submission
    /// order)`.
    pub fn timer<F>(&self, delay: Duration, cb: F) -> io::Result<TimerHandle>
    where
        F: FnOnce() + 'static,
    {
        self.arm_timer(delay, Box::new(cb))
    }

    pub(crate) fn arm_timer(&self, delay: Duration, cb: TimerCallback) -> io::Result<TimerHandle> {
        let mut inner = self.inner.borrow_mut();
        let handle = inner.timers.arm(delay, cb)?;
        inner.pending += 1;
        Ok(handle)
    }

    /// Reserves one level of dispatch depth, returning `false` without
    /// reserving anything if `MAX_CALLBACK_DISPATCH` is already reached.
    ///
    /// Endpoints call this *before* attempting an eager syscall: on
    /// `false` they must skip the syscall entirely and arm the Slot as if
    /// it had returned would-block, rather than performing I/O they then
    /// have no budget left to report. On `true`, the caller must pair this
    /// with exactly one [`Reactor::leave_dispatch`] once its callback (if
    /// any) has returned.
    pub(crate) fn enter_dispatch(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.dispatch_depth >= MAX_CALLBACK_DISPATCH {
            warn!("dispatch depth bound reached, parking operation instead of running inline");
            return false;
        }
        inner.dispatch_depth += 1;
        true
    }

    pub(crate) fn leave_dispatch(&self) {
        let mut inner = self.inner.borrow_mut();
        debug_assert!(inner.dispatch_depth > 0);
        inner.dispatch_depth = inner.dispatch_depth.saturating_sub(1);
    }

    // -- run modes ------------------------------------------------------

    pub fn run(&self) -> io::Result<()> {
        loop {
            if self.is_closed() {
                return Err(closed_error());
            }
            if self.pending() == 0 {
                return Ok(());
            }
            self.tick(None)?;
        }
    }

    pub fn run_pending(&self) -> io::Result<()> {
        while self.pending() > 0 {
            self.tick(None)?;
        }
        Ok(())
    }

    pub fn run_one(&self) -> io::Result<()> {
        loop {
            let dispatched = self.tick(None)?;
            if dispatched > 0 {
                return Ok(());
            }
        }
    }

    pub fn run_for(&self, duration: Duration) -> io::Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.pending() == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.tick(Some(deadline - now))?;
        }
    }

    pub fn poll(&self) -> io::Result<()> {
        self.tick(Some(Duration::ZERO))?;
        Ok(())
    }

    pub fn poll_one(&self) -> io::Result<()> {
        self.tick(Some(Duration::ZERO))?;
        Ok(())
    }

    fn pending(&self) -> usize {
        self.inner.borrow().pending
    }

    /// One iteration: expire due timers, poll, dispatch. Returns how many
    /// handlers (timer or I/O) were invoked.
    fn tick(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut dispatched = self.fire_due_timers()?;

        // If timers already produced work this tick, don't additionally
        // block in the poller — a caller like `run_one` needs to observe
        // that dispatch and return, not wait out the full timeout first.
        let poll_timeout = if dispatched > 0 { Some(Duration::ZERO) } else { timeout };

        let events: Vec<ReadyEvent> = {
            let mut inner = self.inner.borrow_mut();
            inner.poller.poll(poll_timeout)?.to_vec()
        };

        for ev in events {
            dispatched += self.dispatch_one(ev)?;
        }

        Ok(dispatched)
    }

    fn fire_due_timers(&self) -> io::Result<usize> {
        let due = {
            let mut inner = self.inner.borrow_mut();
            let due = inner.timers.fire_due()?;
            let discarded = inner.timers.take_discarded();
            inner.pending = inner.pending.saturating_sub(discarded + due.len());
            due
        };

        let n = due.len();
        for cb in due {
            trace!("timer fired");
            cb();
        }
        Ok(n)
    }

    fn dispatch_one(&self, ev: ReadyEvent) -> io::Result<usize> {
        let Token(value) = ev.token;
        if value as u64 == TOKEN_WAKER {
            self.drain_waker()
        } else if value as u64 == TOKEN_TIMER {
            // The timerfd's own readiness is handled by fire_due_timers at
            // the top of every tick; nothing further to do here.
            Ok(0)
        } else {
            self.dispatch_slot(value as *mut Slot, ev)
        }
    }

    fn drain_waker(&self) -> io::Result<usize> {
        let (posted, _wake_result) = {
            let mut inner = self.inner.borrow_mut();
            let wake_result = inner.waker.drain();
            let mut posted = std::collections::VecDeque::new();
            std::mem::swap(&mut posted, &mut *inner.posted.lock().unwrap());
            (posted, wake_result)
        };

        let n = posted.len();
        for job in posted {
            {
                let mut inner = self.inner.borrow_mut();
                inner.pending = inner.pending.saturating_sub(1);
            }
            // Depth is 0 at the top of a tick, so this never fails; posted
            // jobs still count against the bound for whatever nested ops
            // they themselves trigger.
            self.enter_dispatch();
            job();
            self.leave_dispatch();
        }
        Ok(n)
    }

    /// Resolves a ready event back to its Slot and invokes whichever
    /// continuations are due, in `(read, write)` order. The interest bit
    /// is cleared with the poller *before* the continuation runs, per the
    /// Slot state machine.
    ///
    /// # Safety
    /// `addr` is only ever a live `*mut Slot` because endpoints deregister
    /// before dropping their Slot (see the crate-level resource policy),
    /// so the poller cannot hand back a stale pointer.
    fn dispatch_slot(&self, addr: *mut Slot, ev: ReadyEvent) -> io::Result<usize> {
        let slot = unsafe { &mut *addr };
        let fd = slot.fd;
        // Error/hup bits don't carry their own direction; treat them as
        // waking both armed directions so the subsequent syscall surfaces
        // the precise errno to the continuation instead of the reactor
        // guessing which one is authoritative.
        let readable = ev.readable || ev.error || ev.hup;
        let writable = ev.writable || ev.error || ev.hup;

        let mut dispatched = 0;

        if readable {
            if let Some(cb) = slot.take_read() {
                self.deregister_read(fd)?;
                dispatched += 1;
                self.enter_dispatch();
                cb(Ok(()));
                self.leave_dispatch();
            }
        }
        if writable {
            if let Some(cb) = slot.take_write() {
                self.deregister_write(fd)?;
                dispatched += 1;
                self.enter_dispatch();
                cb(Ok(()));
                self.leave_dispatch();
            }
        }

        Ok(dispatched)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, Error::Closed.to_string())
}
