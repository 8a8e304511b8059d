//! Fiber state machine

use core::fmt;

/// State of a fiber
///
/// ```text
/// Init --swap_in--> Exec <--> Hold / Ready
///                     |
///                     +--> Term | Except
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, never run
    Init = 0,

    /// Suspended; whoever holds it must reschedule it
    Hold = 1,

    /// Running on some worker right now
    Exec = 2,

    /// Entry closure returned
    Term = 3,

    /// Suspended and wants to be re-queued immediately
    Ready = 4,

    /// Entry closure panicked
    Except = 5,
}

impl FiberState {
    /// Finished, one way or the other
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// States in which the stack may be reused or released
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            5 => FiberState::Except,
            _ => FiberState::Init,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Init => write!(f, "INIT"),
            FiberState::Hold => write!(f, "HOLD"),
            FiberState::Exec => write!(f, "EXEC"),
            FiberState::Term => write!(f, "TERM"),
            FiberState::Ready => write!(f, "READY"),
            FiberState::Except => write!(f, "EXCPT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(FiberState::Term.is_terminal());
        assert!(FiberState::Except.is_terminal());
        assert!(!FiberState::Hold.is_terminal());
        assert!(!FiberState::Exec.is_terminal());
    }

    #[test]
    fn test_resettable() {
        assert!(FiberState::Init.is_resettable());
        assert!(FiberState::Term.is_resettable());
        assert!(!FiberState::Ready.is_resettable());
        assert!(!FiberState::Exec.is_resettable());
    }

    #[test]
    fn test_u8_conversion() {
        for s in [
            FiberState::Init,
            FiberState::Hold,
            FiberState::Exec,
            FiberState::Term,
            FiberState::Ready,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
        assert_eq!(FiberState::from(200), FiberState::Init);
    }
}
