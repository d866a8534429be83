use std::ops;

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// A set of armed poller interests for one descriptor.
///
/// Unlike the teacher crate's `Ready`, this has no `error`/`hup` members —
/// those are hint bits carried on `ReadyEvent`, not things a caller arms.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub fn empty() -> Interest {
        Interest(0)
    }

    pub fn readable() -> Interest {
        Interest(READABLE)
    }

    pub fn writable() -> Interest {
        Interest(WRITABLE)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

/// A readiness notification returned from one `Poller::poll` call.
#[derive(Copy, Clone, Debug)]
pub struct ReadyEvent {
    pub token: crate::token::Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}
