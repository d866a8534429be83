use std::convert::TryInto;
use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;

/// A `timerfd(2)` source used by the reactor to wake `epoll_wait` at the
/// next timer-heap deadline.
///
/// Uses `CLOCK_MONOTONIC`, not `CLOCK_REALTIME`: a reactor deadline heap
/// must not jump backwards or forwards when the wall clock is adjusted.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let flags = libc::TFD_CLOEXEC | libc::TFD_NONBLOCK;
        let fd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, flags))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    /// Arms a one-shot expiry at `value` from now. `value == Duration::ZERO`
    /// disarms the timer (per `timerfd_settime(2)`).
    pub fn set(&self, value: Duration) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: duration_to_timespec(value),
        };
        let mut old: libc::itimerspec = unsafe { mem::zeroed() };
        syscall!(timerfd_settime(self.inner.as_raw_fd(), 0, &spec, &mut old))?;
        Ok(())
    }

    /// Reads the expiration counter. Must be drained on every readiness
    /// notification or the fd stays readable.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs().try_into().unwrap_or(libc::time_t::MAX),
        tv_nsec: d.subsec_nanos().try_into().unwrap(),
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
