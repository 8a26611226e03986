//! Fixed-width byte-string keys and prefix arithmetic.
//!
//! Keys are compared and traversed bytewise; `depth` counts consumed bytes,
//! so the byte examined at depth `d` is `k[d - 1]` and depth 0 is the root
//! pseudo-byte 0.

use crate::config::KEY_LEN;

pub type Key = [u8; KEY_LEN];
pub type Value = u64;

/// Byte of `k` consumed when standing at `depth`; 0 at the root.
pub fn get_partial(k: &Key, depth: usize) -> u8 {
    if depth == 0 {
        0
    } else {
        k[depth - 1]
    }
}

/// Smallest key sharing the first `depth` bytes of `k`.
pub fn get_leftmost(k: &Key, depth: usize) -> Key {
    let mut res = [0u8; KEY_LEN];
    res[..depth].copy_from_slice(&k[..depth]);
    res
}

/// Largest key sharing the first `depth` bytes of `k`.
pub fn get_rightmost(k: &Key, depth: usize) -> Key {
    let mut res = [0xffu8; KEY_LEN];
    res[..depth].copy_from_slice(&k[..depth]);
    res
}

/// Smallest key under an arbitrary-length byte prefix.
pub fn prefix_leftmost(prefix: &[u8]) -> Key {
    let mut res = [0u8; KEY_LEN];
    res[..prefix.len()].copy_from_slice(prefix);
    res
}

/// Largest key under an arbitrary-length byte prefix.
pub fn prefix_rightmost(prefix: &[u8]) -> Key {
    let mut res = [0xffu8; KEY_LEN];
    res[..prefix.len()].copy_from_slice(prefix);
    res
}

/// Truncate `k` at `depth`, substituting `diff_partial` for the byte
/// consumed there and zero-filling the tail.
pub fn remake_prefix(k: &Key, depth: usize, diff_partial: u8) -> Key {
    let mut res = [0u8; KEY_LEN];
    if depth > 0 {
        res[..depth - 1].copy_from_slice(&k[..depth - 1]);
        res[depth - 1] = diff_partial;
    }
    res
}

/// Number of equal partial bytes of `k1` and `k2` starting at `depth`,
/// counting the (already matched) byte at `depth` itself. Capped at
/// `KEY_LEN - depth`, so `lcp(k, k, d) == KEY_LEN - d`.
pub fn longest_common_prefix(k1: &Key, k2: &Key, depth: usize) -> usize {
    debug_assert!(depth <= KEY_LEN);
    let max_cmp = KEY_LEN - depth;
    for idx in 0..=max_cmp {
        if get_partial(k1, depth + idx) != get_partial(k2, depth + idx) {
            return idx;
        }
    }
    max_cmp
}

/// `k + n` as a big-endian integer, carrying across bytes.
pub fn key_add(k: &Key, n: u8) -> Key {
    let mut res = *k;
    let mut carry = n as u32;
    for i in (0..KEY_LEN).rev() {
        if carry == 0 {
            break;
        }
        let sum = res[i] as u32 + carry;
        res[i] = (sum % 256) as u8;
        carry = sum / 256;
    }
    res
}

/// `k - n` as a big-endian integer, borrowing across bytes.
pub fn key_sub(k: &Key, n: u8) -> Key {
    let mut res = *k;
    let mut borrow = n as u32;
    for i in (0..KEY_LEN).rev() {
        if borrow == 0 {
            break;
        }
        let cur = res[i] as u32;
        if cur >= borrow {
            res[i] = (cur - borrow) as u8;
            borrow = 0;
        } else {
            res[i] = (cur + 256 - borrow) as u8;
            borrow = 1;
        }
    }
    res
}

/// Big-endian encoding of `v`; short integers are left-padded with zeros.
pub fn int_to_key(v: u64) -> Key {
    let mut res = [0u8; KEY_LEN];
    for i in 1..=KEY_LEN {
        let shr = (KEY_LEN - i) * 8;
        res[i - 1] = if shr >= 64 { 0 } else { (v >> shr) as u8 };
    }
    res
}

/// Inverse of [`int_to_key`] for keys that fit a `u64`.
pub fn key_to_int(k: &Key) -> u64 {
    k.iter().fold(0u64, |acc, &b| (acc << 8) + b as u64)
}

/// First `KEY_LEN` bytes of `s`, zero-padded.
pub fn str_to_key(s: &str) -> Key {
    let bytes = s.as_bytes();
    let n = bytes.len().min(KEY_LEN);
    let mut res = [0u8; KEY_LEN];
    res[..n].copy_from_slice(&bytes[..n]);
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn partial_is_shifted_by_one() {
        let k = int_to_key(0x0102030405060708);
        assert_eq!(get_partial(&k, 0), 0);
        assert_eq!(get_partial(&k, 1), 0x01);
        assert_eq!(get_partial(&k, 8), 0x08);
    }

    #[test]
    fn leftmost_rightmost_pad() {
        let k = int_to_key(0xaabb000000000000);
        let l = get_leftmost(&k, 2);
        let r = get_rightmost(&k, 2);
        for i in 2..KEY_LEN {
            assert_eq!(get_partial(&l, i + 1), 0);
            assert_eq!(get_partial(&r, i + 1), 0xff);
        }
        assert_eq!(l[..2], k[..2]);
        assert_eq!(r[..2], k[..2]);
    }

    #[test]
    fn lcp_of_equal_keys_spans_the_rest() {
        let k = int_to_key(42);
        for d in 0..=KEY_LEN {
            assert_eq!(longest_common_prefix(&k, &k, d), KEY_LEN - d);
        }
    }

    #[test]
    fn lcp_counts_the_matched_byte() {
        let a = int_to_key(0x0101010101010101);
        let b = int_to_key(0x0101010101010102);
        assert_eq!(longest_common_prefix(&a, &b, 1), 7);
        assert_eq!(longest_common_prefix(&a, &b, 8), 0);
    }

    #[test]
    fn add_sub_carry_chains() {
        let k = int_to_key(0x00000000000000ff);
        assert_eq!(key_to_int(&key_add(&k, 1)), 0x100);
        let k = int_to_key(0x0000000000ffffff);
        assert_eq!(key_to_int(&key_add(&k, 2)), 0x1000001);
        let k = int_to_key(0x100);
        assert_eq!(key_to_int(&key_sub(&k, 1)), 0xff);
    }

    #[test]
    fn remake_prefix_truncates() {
        let k = int_to_key(0x1122334455667788);
        let r = remake_prefix(&k, 3, 0x99);
        assert_eq!(key_to_int(&r), 0x1122990000000000);
        assert_eq!(remake_prefix(&k, 0, 0x99), [0u8; KEY_LEN]);
    }

    #[test]
    fn str_keys_truncate_and_pad() {
        assert_eq!(str_to_key("ab"), [b'a', b'b', 0, 0, 0, 0, 0, 0]);
        assert_eq!(str_to_key("abcdefghij")[..8], *b"abcdefgh");
    }

    proptest! {
        #[test]
        fn int_key_round_trip(v in any::<u64>()) {
            prop_assert_eq!(key_to_int(&int_to_key(v)), v);
        }

        #[test]
        fn add_then_sub_is_identity(v in 0u64..u64::MAX - 256, n in 0u8..=255) {
            let k = int_to_key(v);
            prop_assert_eq!(key_sub(&key_add(&k, n), n), k);
        }

        #[test]
        fn lcp_is_symmetric(a in any::<u64>(), b in any::<u64>(), d in 0usize..=KEY_LEN) {
            let (ka, kb) = (int_to_key(a), int_to_key(b));
            prop_assert_eq!(
                longest_common_prefix(&ka, &kb, d),
                longest_common_prefix(&kb, &ka, d)
            );
        }
    }
}
