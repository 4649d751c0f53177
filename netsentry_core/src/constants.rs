//! Constants shared across the engine

use crate::types::EntId;

/// Longest label accepted for events and actions, in bytes.
pub const MAX_LABEL_BYTES: usize = 32;
/// Widest address an endpoint can carry, in bytes.
pub const MAX_ADDR_BYTES: usize = 16;

/// Reported as the matched id when the default policy decided.
pub const ENT_ID_NONE: EntId = 0;

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

pub const IPPROTO_TCP: u16 = 6;
pub const IPPROTO_UDP: u16 = 17;

pub const DEFAULT_PRIVATE_DATA_ALIGNMENT: usize = 8;
