//! Flag words and identifiers shared across the engine.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Object id. Ids are unique per context and never reused.
pub type EntId = u64;
pub type RouteId = EntId;
pub type EventId = EntId;
pub type ActionId = EntId;

macro_rules! flag_word {
    ($(#[$meta:meta])* $name:ident : $repr:ty { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
        #[repr(transparent)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }
            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }
            pub const fn bits(self) -> $repr {
                self.0
            }
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }
            /// True when every bit of `other` is set.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }
        impl BitAndAssign for $name {
            fn bitand_assign(&mut self, rhs: Self) {
                self.0 &= rhs.0;
            }
        }
        impl Not for $name {
            type Output = Self;
            fn not(self) -> Self {
                Self(!self.0)
            }
        }
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut first = true;
                write!(f, "{}(", stringify!($name))?;
                $(
                    if $value != 0 && self.0 & $value == $value {
                        if !first {
                            f.write_str(" | ")?;
                        }
                        f.write_str(stringify!($flag))?;
                        first = false;
                    }
                )*
                if first {
                    write!(f, "{:#x}", self.0)?;
                }
                f.write_str(")")
            }
        }
    };
}

flag_word! {
    /// Per-route flags. The low byte plus `PARENT_EVENT_WILDCARD` doubles as
    /// the inexact-match report of a lookup.
    RouteFlags: u32 {
        SA_FAMILY_WILDCARD = 1 << 0;
        SA_REMOTE_ADDR_WILDCARD = 1 << 1;
        SA_PROTO_WILDCARD = 1 << 2;
        SA_LOCAL_ADDR_WILDCARD = 1 << 3;
        SA_REMOTE_PORT_WILDCARD = 1 << 4;
        SA_LOCAL_PORT_WILDCARD = 1 << 5;
        REMOTE_INTERFACE_WILDCARD = 1 << 6;
        LOCAL_INTERFACE_WILDCARD = 1 << 7;
        PARENT_EVENT_WILDCARD = 1 << 8;
        DIRECTION_IN = 1 << 10;
        DIRECTION_OUT = 1 << 11;
        GREENLISTED = 1 << 12;
        PENALTYBOXED = 1 << 13;
        IN_TABLE = 1 << 16;
        DELETED = 1 << 17;
    }
}

impl RouteFlags {
    /// Every per-field wildcard bit.
    pub const WILDCARD_FLAGS: Self = Self(0xff);
    pub const DIRECTION_FLAGS: Self = Self((1 << 10) | (1 << 11));
    /// Flags a caller may toggle after insertion.
    pub const STATUS_FLAGS: Self = Self((1 << 12) | (1 << 13));
    /// Flags that belong to a route's identity.
    pub const KEY_FLAGS: Self = Self(0xff | (1 << 8) | (1 << 10) | (1 << 11));
    pub(crate) const INTERNAL_FLAGS: Self = Self((1 << 16) | (1 << 17));
}

flag_word! {
    /// Aggregated outcome of an action chain.
    ActionResults: u32 {
        NONE = 0;
        ACCEPT = 1 << 0;
        REJECT = 1 << 1;
        CONNECT = 1 << 2;
        DISCONNECT = 1 << 3;
        DEROGATORY = 1 << 4;
        COMMENDABLE = 1 << 5;
        STOP = 1 << 6;
        DEALLOCATED = 1 << 7;
        INSERT = 1 << 8;
        DELETE = 1 << 9;
        ERROR = 1 << 10;
        FALLTHROUGH = 1 << 11;
        UPDATE = 1 << 12;
        PORT_RESET = 1 << 13;
        USER0 = 1 << 24;
        USER1 = 1 << 25;
        USER2 = 1 << 26;
        USER3 = 1 << 27;
    }
}

flag_word! {
    /// Lock behaviour, given at init and per call (the two are OR-ed).
    ///
    /// There is no error-checking opt-in: shared and exclusive holds are
    /// always tracked per caller, so releasing or converting a hold the
    /// caller does not own fails instead of corrupting the counts.
    LockFlags: u32 {
        NONE = 0;
        NONRECURSIVE_SHARED = 1 << 0;
        NONRECURSIVE_MUTEX = 1 << 1;
        RETAIN_SEMAPHORE = 1 << 2;
        GET_RESERVATION_TOO = 1 << 3;
        TRY_RESERVATION_TOO = 1 << 4;
    }
}

flag_word! {
    ThreadFlags: u32 {
        NONE = 0;
        READ_ONLY = 1 << 0;
    }
}

flag_word! {
    ActionFlags: u32 {
        NONE = 0;
        DISABLED = 1 << 0;
    }
}

flag_word! {
    EventConfigFlags: u32 {
        NONE = 0;
        COMMENDABLE_CLEARS_DEROGATORY = 1 << 0;
        DEROGATORY_THRESHOLD_IGNORE_COMMENDABLE = 1 << 1;
    }
}

/// Decision applied when nothing in the table decides.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Policy {
    Accept,
    #[default]
    Reject,
}

impl Policy {
    pub fn as_results(self) -> ActionResults {
        match self {
            Policy::Accept => ActionResults::ACCEPT,
            Policy::Reject => ActionResults::REJECT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_groups_cover_expected_bits() {
        assert!(RouteFlags::WILDCARD_FLAGS.contains(RouteFlags::LOCAL_INTERFACE_WILDCARD));
        assert!(!RouteFlags::WILDCARD_FLAGS.contains(RouteFlags::PARENT_EVENT_WILDCARD));
        assert!(RouteFlags::KEY_FLAGS.contains(RouteFlags::DIRECTION_IN | RouteFlags::PARENT_EVENT_WILDCARD));
        assert!(!RouteFlags::KEY_FLAGS.intersects(RouteFlags::STATUS_FLAGS));
    }

    #[test]
    fn debug_lists_set_flags() {
        let r = ActionResults::ACCEPT | ActionResults::STOP;
        assert_eq!(format!("{r:?}"), "ActionResults(ACCEPT | STOP)");
        assert_eq!(format!("{:?}", ActionResults::NONE), "ActionResults(0x0)");
    }
}
