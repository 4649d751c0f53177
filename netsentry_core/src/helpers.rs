//! Prefix arithmetic over left-aligned 128-bit address keys

use crate::constants::MAX_ADDR_BYTES;

/// Left-align up to 16 address bytes into a key (byte 0 is the top byte).
#[inline]
pub fn addr_key(addr: &[u8]) -> u128 {
    let mut buf = [0u8; MAX_ADDR_BYTES];
    let n = addr.len().min(MAX_ADDR_BYTES);
    buf[..n].copy_from_slice(&addr[..n]);
    u128::from_be_bytes(buf)
}

pub fn common_prefix_len(key1: u128, key2: u128, max_len: u8) -> u8 {
    if max_len == 0 {
        return 0;
    }
    let diff = (key1 ^ key2) & mask(max_len);
    if diff == 0 {
        return max_len;
    }
    (diff.leading_zeros() as u8).min(max_len)
}

#[inline]
pub fn get_bit(key: u128, index: u8) -> u8 {
    debug_assert!(index <= 127);
    ((key >> (127 - index)) & 1) as u8
}

#[inline]
pub fn mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        !0u128
    } else {
        !(!0u128 >> prefix_len)
    }
}

// Canonicalise a key: zero host bits beyond `plen`.
#[inline(always)]
pub fn canonical(key: u128, plen: u8) -> u128 {
    key & mask(plen)
}

/// True when the first `plen` bits of both keys agree.
#[inline]
pub fn prefix_covers(prefix: u128, plen: u8, key: u128) -> bool {
    common_prefix_len(prefix, key, plen) == plen
}

#[inline(always)]
pub const fn is_valid_alignment(align: usize) -> bool {
    align == 0 || align.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_bytes_land_in_top_bits() {
        assert_eq!(addr_key(&[1, 2, 3, 4]), 0x0102_0304u128 << 96);
    }

    #[test]
    fn prefix_math() {
        let a = addr_key(&[10, 0, 0, 0]);
        let b = addr_key(&[10, 0, 1, 7]);
        assert_eq!(common_prefix_len(a, b, 32), 23);
        assert!(prefix_covers(a, 16, b));
        assert!(!prefix_covers(a, 24, b));
        assert!(prefix_covers(0, 0, b));
        assert_eq!(canonical(b, 24), addr_key(&[10, 0, 1, 0]));
        assert_eq!(get_bit(addr_key(&[0x80]), 0), 1);
        assert_eq!(mask(128), !0);
    }
}
