//! Timer heap: a single `timerfd` multiplexes an arbitrary number of
//! one-shot deadlines registered with the reactor. Entries are ordered by
//! `(deadline, sequence)` so that timers scheduled for the same instant
//! fire in registration order. Cancellation is lazy — `TimerHandle::cancel`
//! just flips a shared flag; the entry is discarded the next time it would
//! otherwise fire, rather than being removed from the heap immediately.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::sys::timerfd::TimerFd;

pub(crate) type TimerCallback = Box<dyn FnOnce()>;

/// A live registration in a [`crate::Reactor`]'s timer heap. Dropping the
/// handle does *not* cancel the timer — call [`TimerHandle::cancel`]
/// explicitly, matching the spec's "cancelled individually by handle" rule.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

struct Entry {
    deadline: Instant,
    sequence: u64,
    cancelled: Rc<Cell<bool>>,
    callback: TimerCallback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// `BinaryHeap` is a max-heap; inverting the comparison turns it into the
// min-heap by `(deadline, sequence)` the reactor needs.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

pub(crate) struct TimerHeap {
    timerfd: TimerFd,
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
    armed_head: Option<(Instant, u64)>,
    /// Entries removed without invoking their callback (cancelled before
    /// reaching the head, or cancelled-and-then-expired). The reactor
    /// drains this to keep its pending-operation count accurate, since
    /// `arm` counts every entry as pending regardless of later cancellation.
    discarded: usize,
}

impl TimerHeap {
    pub(crate) fn new() -> io::Result<TimerHeap> {
        Ok(TimerHeap {
            timerfd: TimerFd::new()?,
            heap: BinaryHeap::new(),
            next_sequence: 0,
            armed_head: None,
            discarded: 0,
        })
    }

    pub(crate) fn take_discarded(&mut self) -> usize {
        std::mem::take(&mut self.discarded)
    }

    pub(crate) fn arm(&mut self, delay: Duration, callback: TimerCallback) -> io::Result<TimerHandle> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let cancelled = Rc::new(Cell::new(false));
        let entry = Entry {
            deadline: Instant::now() + delay,
            sequence,
            cancelled: cancelled.clone(),
            callback,
        };
        self.heap.push(entry);
        self.sync_timerfd()?;

        Ok(TimerHandle { cancelled })
    }

    /// Drains the timerfd's expiry counter and returns the callbacks whose
    /// deadline has passed, in fire order. Reprograms the timerfd for the
    /// new head afterwards.
    ///
    /// Called at the top of every reactor tick, not just when the poller
    /// reports the timerfd readable, so a read that would block (no timer
    /// armed yet, or the head deadline hasn't elapsed) is expected and
    /// swallowed rather than propagated.
    pub(crate) fn fire_due(&mut self) -> io::Result<Vec<TimerCallback>> {
        match self.timerfd.read() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked Some above");
            if entry.cancelled.get() {
                self.discarded += 1;
            } else {
                due.push(entry.callback);
            }
        }

        self.sync_timerfd()?;
        Ok(due)
    }

    /// Reprograms the `timerfd` only if the earliest live deadline changed.
    /// Skips past cancelled entries at the head so a heap full of
    /// already-cancelled timers doesn't keep the fd armed.
    fn sync_timerfd(&mut self) -> io::Result<()> {
        while matches!(self.heap.peek(), Some(e) if e.cancelled.get()) {
            self.heap.pop();
            self.discarded += 1;
        }

        let head = self.heap.peek().map(|e| (e.deadline, e.sequence));
        if head == self.armed_head {
            return Ok(());
        }
        self.armed_head = head;

        match head {
            Some((deadline, _)) => {
                let now = Instant::now();
                let remaining = deadline.saturating_duration_since(now);
                let remaining = if remaining.is_zero() { Duration::from_nanos(1) } else { remaining };
                self.timerfd.set(remaining)
            }
            None => self.timerfd.set(Duration::ZERO),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl AsRawFd for TimerHeap {
    fn as_raw_fd(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn fires_in_deadline_order_not_registration_order() {
        let mut heap = TimerHeap::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        heap.arm(Duration::from_millis(30), Box::new(move || o1.borrow_mut().push(30))).unwrap();
        let o2 = order.clone();
        heap.arm(Duration::from_millis(10), Box::new(move || o2.borrow_mut().push(10))).unwrap();
        let o3 = order.clone();
        heap.arm(Duration::from_millis(20), Box::new(move || o3.borrow_mut().push(20))).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let due = heap.fire_due().unwrap();
        for cb in due {
            cb();
        }

        assert_eq!(*order.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut heap = TimerHeap::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let handle = heap.arm(Duration::from_millis(5), Box::new(move || f.set(true))).unwrap();
        handle.cancel();

        std::thread::sleep(Duration::from_millis(20));
        let due = heap.fire_due().unwrap();
        assert!(due.is_empty());
        assert!(!fired.get());
    }

    #[test]
    fn same_deadline_fires_in_registration_order() {
        let mut heap = TimerHeap::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let dur = Duration::from_millis(5);

        for i in 0..3 {
            let o = order.clone();
            heap.arm(dur, Box::new(move || o.borrow_mut().push(i))).unwrap();
        }

        std::thread::sleep(Duration::from_millis(20));
        let due = heap.fire_due().unwrap();
        for cb in due {
            cb();
        }

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
