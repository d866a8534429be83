//! Abstraction over `epoll`: interest-set bookkeeping plus the readiness
//! wait. Spec: `register_read`/`register_write` take the `fd` *and* a
//! pointer to the `Slot` that owns it; this implementation stores that
//! pointer directly as the `epoll_data` word, so a ready event can be
//! resolved back to its `Slot` without the poller (or reactor) holding a
//! registry of live endpoints — it only ever sees a raw address, and only
//! for as long as that address stays registered.
//!
//! # Safety
//!
//! Storing `*mut Slot` in `epoll_data` is sound only because every
//! endpoint deregisters its Slot (via `Drop`) before the Slot is freed —
//! see the resource-policy invariant in the crate root docs. `Poller`
//! itself never dereferences the pointer; only `Reactor::dispatch` does,
//! immediately after `epoll_wait` confirms the fd is still registered.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::interest::{Interest, ReadyEvent};
use crate::slot::Slot;
use crate::sys::epoll::Epoll;
use crate::token::Token;

pub(crate) struct Poller {
    epoll: Epoll,
    interests: HashMap<RawFd, (Interest, *mut Slot)>,
    events: Vec<libc::epoll_event>,
    ready: Vec<ReadyEvent>,
}

impl Poller {
    pub(crate) fn new(capacity: usize) -> io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            interests: HashMap::new(),
            events: Vec::with_capacity(capacity),
            ready: Vec::with_capacity(capacity),
        })
    }

    /// Returns `true` if the readable bit was newly armed (the reactor
    /// uses this to decide whether to bump its pending-operation count).
    pub(crate) fn register_read(&mut self, fd: RawFd, slot: *mut Slot) -> io::Result<bool> {
        self.arm(fd, slot, Interest::readable())
    }

    pub(crate) fn register_write(&mut self, fd: RawFd, slot: *mut Slot) -> io::Result<bool> {
        self.arm(fd, slot, Interest::writable())
    }

    /// Returns `true` if the readable bit was actually armed (and is now
    /// cleared).
    pub(crate) fn deregister_read(&mut self, fd: RawFd) -> io::Result<bool> {
        self.disarm(fd, Interest::readable())
    }

    pub(crate) fn deregister_write(&mut self, fd: RawFd) -> io::Result<bool> {
        self.disarm(fd, Interest::writable())
    }

    fn arm(&mut self, fd: RawFd, slot: *mut Slot, bit: Interest) -> io::Result<bool> {
        let existing = self.interests.get(&fd).map(|(i, _)| *i).unwrap_or_else(Interest::empty);
        if existing.is_readable() && bit.is_readable() || existing.is_writable() && bit.is_writable() {
            return Ok(false);
        }

        let mut combined = existing;
        combined.insert(bit);

        let events = to_epoll_bits(combined);
        let data = slot as u64;

        if existing.is_empty() {
            self.epoll.add(fd, events, data)?;
        } else {
            self.epoll.modify(fd, events, data)?;
        }

        self.interests.insert(fd, (combined, slot));
        Ok(true)
    }

    fn disarm(&mut self, fd: RawFd, bit: Interest) -> io::Result<bool> {
        let Some((mut existing, slot)) = self.interests.get(&fd).copied() else {
            return Ok(false);
        };
        let had_bit = (bit.is_readable() && existing.is_readable())
            || (bit.is_writable() && existing.is_writable());
        if !had_bit {
            return Ok(false);
        }

        existing.remove(bit);

        if existing.is_empty() {
            self.epoll.delete(fd)?;
            self.interests.remove(&fd);
        } else {
            // The surviving direction must keep routing to the same Slot,
            // so epoll_data is reprogrammed with the same pointer `arm`
            // used, not a placeholder — a stray token here would get
            // misdispatched as a reserved internal fd (waker/timer).
            self.epoll.modify(fd, to_epoll_bits(existing), slot as u64)?;
            self.interests.insert(fd, (existing, slot));
        }

        Ok(true)
    }

    /// Registers a fixed internal fd (the waker eventfd or the timer heap's
    /// timerfd) under a reserved sentinel token. These never toggle
    /// interest and are never deregistered until the reactor itself is
    /// torn down, so they bypass the per-fd interest-mask bookkeeping that
    /// `register_read`/`register_write` maintain for Slots.
    pub(crate) fn register_raw(&mut self, fd: RawFd, token: u64) -> io::Result<()> {
        self.epoll.add(fd, libc::EPOLLIN as u32, token)
    }

    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<&[ReadyEvent]> {
        let n = self.epoll.wait(&mut self.events, timeout)?;

        self.ready.clear();
        for ev in &self.events[..n] {
            let bits = ev.events as i32;
            self.ready.push(ReadyEvent {
                token: Token(ev.u64 as usize),
                readable: bits & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
                writable: bits & libc::EPOLLOUT != 0,
                error: bits & libc::EPOLLERR != 0,
                hup: bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0,
            });
        }

        Ok(&self.ready)
    }
}

fn to_epoll_bits(interest: Interest) -> u32 {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::EPOLLIN;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT;
    }
    bits as u32
}
