//! Read/write interest mask

use core::fmt;
use core::ops::{BitAnd, BitOr, Not};

/// I/O interest registered with the reactor.
///
/// Values match `EPOLLIN` / `EPOLLOUT` so the mask can be handed to
/// `epoll_ctl` unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0x0);
    pub const READ: Event = Event(0x1);
    pub const WRITE: Event = Event(0x4);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keep only the READ/WRITE bits of a raw epoll mask
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Event(bits & (Self::READ.0 | Self::WRITE.0))
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Event) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Event) -> bool {
        (self.0 & other.0) != 0
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;
    fn not(self) -> Event {
        Event(!self.0 & (Self::READ.0 | Self::WRITE.0))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (false, false) => write!(f, "NONE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (true, true) => write!(f, "READ|WRITE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_ops() {
        let both = Event::READ | Event::WRITE;
        assert!(both.contains(Event::READ));
        assert!(both.contains(Event::WRITE));
        assert_eq!(both & !Event::READ, Event::WRITE);
        assert!((both & !both).is_empty());
        assert!(!Event::NONE.contains(Event::NONE));
    }

    #[test]
    fn test_truncate() {
        // EPOLLIN | EPOLLERR | EPOLLET
        let e = Event::from_bits_truncate(0x1 | 0x8 | (1 << 31));
        assert_eq!(e, Event::READ);
        assert_eq!(format!("{:?}", Event::READ | Event::WRITE), "READ|WRITE");
    }
}
