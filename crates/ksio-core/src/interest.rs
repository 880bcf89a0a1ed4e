//! Interest kinds and readiness flags
//!
//! An [`Interest`] is what a caller waits for on a descriptor. The selector
//! merges all interests of one descriptor into an [`InterestSet`] for the OS
//! watch entry, and the poller reports back a [`Readiness`].

use std::fmt;

/// The readiness condition watched for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Interest {
    Read = 0,
    Write = 1,
    Accept = 2,
    Connect = 3,
}

impl Interest {
    /// All interest kinds, in slot order.
    pub const ALL: [Interest; 4] = [
        Interest::Read,
        Interest::Write,
        Interest::Accept,
        Interest::Connect,
    ];

    /// Slot index for per-descriptor tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether a readiness report satisfies this interest.
    ///
    /// Hang-up and error satisfy every interest: the waiter finds out what
    /// happened on its next syscall.
    #[inline]
    pub fn is_satisfied_by(self, ready: Readiness) -> bool {
        if ready.intersects(Readiness::HANGUP | Readiness::ERROR) {
            return true;
        }
        match self {
            Interest::Read | Interest::Accept => ready.is_readable(),
            Interest::Write | Interest::Connect => ready.is_writable(),
        }
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::Read => write!(f, "read"),
            Interest::Write => write!(f, "write"),
            Interest::Accept => write!(f, "accept"),
            Interest::Connect => write!(f, "connect"),
        }
    }
}

/// Union of OS-level directions requested for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const EMPTY: InterestSet = InterestSet(0);
    pub const READABLE: InterestSet = InterestSet(0b01);
    pub const WRITABLE: InterestSet = InterestSet(0b10);

    /// The OS direction an interest maps to.
    #[inline]
    pub const fn of(interest: Interest) -> InterestSet {
        match interest {
            Interest::Read | Interest::Accept => InterestSet::READABLE,
            Interest::Write | Interest::Connect => InterestSet::WRITABLE,
        }
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[inline]
    pub fn add(&mut self, interest: Interest) {
        self.0 |= InterestSet::of(interest).0;
    }
}

impl std::ops::BitOr for InterestSet {
    type Output = InterestSet;

    fn bitor(self, rhs: InterestSet) -> InterestSet {
        InterestSet(self.0 | rhs.0)
    }
}

/// Readiness reported by the OS for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const NONE: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(0b0001);
    pub const WRITABLE: Readiness = Readiness(0b0010);
    pub const HANGUP: Readiness = Readiness(0b0100);
    pub const ERROR: Readiness = Readiness(0b1000);

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[inline]
    pub const fn is_hangup(self) -> bool {
        self.0 & Self::HANGUP.0 != 0
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    #[inline]
    pub const fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}
