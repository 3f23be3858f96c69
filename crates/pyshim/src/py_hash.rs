//! CPython-compatible hash algorithms (`Py_hash_t` values).
//!
//! Hashes are deterministic and equal to CPython's with `PYTHONHASHSEED=0`:
//! str and bytes use SipHash-1-3 with a zero key, numbers hash modulo the
//! Mersenne prime `2^61 - 1` so that `hash(1) == hash(1.0) == hash(True)`, and
//! tuples mix their item hashes with the xxHash-derived accumulator.
//!
//! `-1` is never a valid result: the C API reserves it as the error sentinel,
//! so every algorithm remaps it (to `-2`, or a tuple-specific constant).

use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive;

/// `2^61 - 1`, the modulus for numeric hashing.
const MODULUS: u64 = (1 << 61) - 1;
/// Number of bits in [`MODULUS`].
const MODULUS_BITS: u32 = 61;
/// Hash of positive infinity.
const HASH_INF: i64 = 314_159;

const XXPRIME_1: u64 = 11_400_714_785_074_694_791;
const XXPRIME_2: u64 = 14_029_467_366_897_019_727;
const XXPRIME_5: u64 = 2_870_177_450_012_600_261;

/// Remaps the reserved error sentinel.
const fn fix_sentinel(hash: i64) -> i64 {
    if hash == -1 { -2 } else { hash }
}

fn signed(magnitude: u64, negative: bool) -> i64 {
    // magnitude < 2^61, so the conversion cannot fail
    let value = i64::try_from(magnitude).unwrap_or(i64::MAX);
    fix_sentinel(if negative { -value } else { value })
}

/// Hash of a bytes or str payload.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    fix_sentinel(i64::from_ne_bytes(siphash13(bytes).to_ne_bytes()))
}

/// Hash of an int that fits in 64 bits.
#[must_use]
pub fn hash_i64(value: i64) -> i64 {
    signed(value.unsigned_abs() % MODULUS, value < 0)
}

/// Hash of an arbitrary-precision int.
#[must_use]
pub fn hash_bigint(value: &BigInt) -> i64 {
    if let Some(small) = value.to_i64() {
        return hash_i64(small);
    }
    let (sign, digits) = value.to_u64_digits();
    // Horner's rule over base-2^64 digits, most significant first.
    let remainder = digits.iter().rev().fold(0u128, |acc, &digit| {
        ((acc << 64) | u128::from(digit)) % u128::from(MODULUS)
    });
    let remainder = u64::try_from(remainder).unwrap_or_default();
    signed(remainder, sign == Sign::Minus)
}

/// Hash of a finite or infinite float. NaN hashes by identity and is handled by the caller.
#[must_use]
pub fn hash_f64(value: f64) -> i64 {
    if value.is_infinite() {
        return if value > 0.0 { HASH_INF } else { -HASH_INF };
    }
    if value.is_nan() || value == 0.0 {
        return 0;
    }
    let (mut mantissa, mut exponent) = frexp(value.abs());
    // Consume the mantissa 28 bits at a time, reducing modulo 2^61 - 1 as we go.
    let mut acc: u64 = 0;
    while mantissa > 0.0 {
        acc = ((acc << 28) & MODULUS) | (acc >> (MODULUS_BITS - 28));
        mantissa *= 268_435_456.0;
        exponent -= 28;
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "mantissa is in [0, 2^28)")]
        let chunk = mantissa as u64;
        mantissa -= chunk as f64;
        acc += chunk;
        if acc >= MODULUS {
            acc -= MODULUS;
        }
    }
    // Multiplying by 2^e modulo 2^61 - 1 is a rotation by e mod 61 bits.
    let shift = exponent.rem_euclid(61).unsigned_abs();
    acc = ((acc << shift) & MODULUS) | (acc >> (MODULUS_BITS - shift));
    signed(acc, value < 0.0)
}

/// Identity hash for objects without value hashing (NaN floats).
#[must_use]
pub fn hash_pointer(address: usize) -> i64 {
    let rotated = address.rotate_right(4) as u64;
    fix_sentinel(i64::from_ne_bytes(rotated.to_ne_bytes()))
}

/// Combines item hashes into a tuple hash.
#[must_use]
pub fn hash_tuple(item_hashes: impl ExactSizeIterator<Item = i64>) -> i64 {
    let len = item_hashes.len() as u64;
    let mut acc = XXPRIME_5;
    for item in item_hashes {
        let lane = u64::from_ne_bytes(item.to_ne_bytes());
        acc = acc.wrapping_add(lane.wrapping_mul(XXPRIME_2));
        acc = acc.rotate_left(31);
        acc = acc.wrapping_mul(XXPRIME_1);
    }
    acc = acc.wrapping_add(len ^ (XXPRIME_5 ^ 3_527_539));
    let hash = i64::from_ne_bytes(acc.to_ne_bytes());
    if hash == -1 { 1_546_275_796 } else { hash }
}

/// `(frac, exp)` with `value == frac * 2^exp` and `0.5 <= frac < 1.0`, for finite positive `value`.
fn frexp(value: f64) -> (f64, i32) {
    let bits = value.to_bits();
    let biased = i32::try_from((bits >> 52) & 0x7ff).unwrap_or_default();
    if biased == 0 {
        // Subnormal: scale into the normal range first.
        let (frac, exp) = frexp(value * 2f64.powi(64));
        return (frac, exp - 64);
    }
    let frac = f64::from_bits((bits & 0x000f_ffff_ffff_ffff) | 0x3fe0_0000_0000_0000);
    (frac, biased - 1022)
}

/// SipHash-1-3 keyed with zeros.
fn siphash13(bytes: &[u8]) -> u64 {
    let mut state = SipState {
        v: [
            0x736f_6d65_7073_6575,
            0x646f_7261_6e64_6f6d,
            0x6c79_6765_6e65_7261,
            0x7465_6462_7974_6573,
        ],
    };
    let mut words = bytes.chunks_exact(8);
    for word in &mut words {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(word);
        state.compress(u64::from_le_bytes(buf));
    }
    let mut last = (bytes.len() as u64) << 56;
    for (i, &byte) in words.remainder().iter().enumerate() {
        last |= u64::from(byte) << (8 * i);
    }
    state.compress(last);
    state.v[2] ^= 0xff;
    for _ in 0..3 {
        state.round();
    }
    state.v.iter().fold(0, |acc, v| acc ^ v)
}

struct SipState {
    v: [u64; 4],
}

impl SipState {
    fn compress(&mut self, message: u64) {
        self.v[3] ^= message;
        self.round();
        self.v[0] ^= message;
    }

    fn round(&mut self) {
        let [v0, v1, v2, v3] = &mut self.v;
        *v0 = v0.wrapping_add(*v1);
        *v1 = v1.rotate_left(13) ^ *v0;
        *v0 = v0.rotate_left(32);
        *v2 = v2.wrapping_add(*v3);
        *v3 = v3.rotate_left(16) ^ *v2;
        *v0 = v0.wrapping_add(*v3);
        *v3 = v3.rotate_left(21) ^ *v0;
        *v2 = v2.wrapping_add(*v1);
        *v1 = v1.rotate_left(17) ^ *v2;
        *v2 = v2.rotate_left(32);
    }
}
