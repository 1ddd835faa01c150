//! Proof-of-work arithmetic and difficulty retargeting.
//!
//! Targets are 256-bit integers; the compact "bits" form stores a
//! 3-byte mantissa and a byte exponent. The retarget functions here are
//! pure; the chain feeds them the ancestor data they need.

use std::cmp::Ordering;
use std::fmt;

/// 256-bit unsigned integer, little-endian 64-bit limbs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct U256([u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const ONE: U256 = U256([1, 0, 0, 0]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn from_u64(value: u64) -> U256 {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&limb| limb == 0)
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> U256 {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let start = 32 - 8 * (i + 1);
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[start..start + 8]);
            *limb = u64::from_be_bytes(chunk);
        }
        U256(limbs)
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, limb) in self.0.iter().enumerate() {
            let start = 32 - 8 * (i + 1);
            bytes[start..start + 8].copy_from_slice(&limb.to_be_bytes());
        }
        bytes
    }

    pub fn from_le_bytes(bytes: [u8; 32]) -> U256 {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[8 * i..8 * i + 8]);
            *limb = u64::from_le_bytes(chunk);
        }
        U256(limbs)
    }

    /// Index of the highest set bit plus one; zero for zero.
    pub fn bits(&self) -> u32 {
        for (i, &limb) in self.0.iter().enumerate().rev() {
            if limb != 0 {
                return 64 * i as u32 + 64 - limb.leading_zeros();
            }
        }
        0
    }

    pub fn bit(&self, index: u32) -> bool {
        self.0[(index / 64) as usize] >> (index % 64) & 1 == 1
    }

    fn set_bit(&mut self, index: u32) {
        self.0[(index / 64) as usize] |= 1 << (index % 64);
    }

    pub fn low_u32(&self) -> u32 {
        self.0[0] as u32
    }

    pub fn overflowing_add(self, rhs: U256) -> (U256, bool) {
        let mut limbs = [0u64; 4];
        let mut carry = false;
        for i in 0..4 {
            let (sum, c1) = self.0[i].overflowing_add(rhs.0[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            limbs[i] = sum;
            carry = c1 || c2;
        }
        (U256(limbs), carry)
    }

    pub fn saturating_add(self, rhs: U256) -> U256 {
        let (sum, carry) = self.overflowing_add(rhs);
        if carry {
            U256::MAX
        } else {
            sum
        }
    }

    /// Wrapping subtraction; callers guarantee `self >= rhs`.
    pub fn wrapping_sub(self, rhs: U256) -> U256 {
        let mut limbs = [0u64; 4];
        let mut borrow = false;
        for i in 0..4 {
            let (diff, b1) = self.0[i].overflowing_sub(rhs.0[i]);
            let (diff, b2) = diff.overflowing_sub(borrow as u64);
            limbs[i] = diff;
            borrow = b1 || b2;
        }
        U256(limbs)
    }

    pub fn not(self) -> U256 {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    /// Two's-complement negation: `2^256 - self` for non-zero values.
    pub fn wrapping_neg(self) -> U256 {
        self.not().overflowing_add(U256::ONE).0
    }

    /// Multiplies by a 64-bit factor, returning the product and the
    /// overflowing high limb.
    pub fn mul_u64(self, factor: u64) -> (U256, u64) {
        let mut limbs = [0u64; 4];
        let mut carry = 0u64;
        for i in 0..4 {
            let product = self.0[i] as u128 * factor as u128 + carry as u128;
            limbs[i] = product as u64;
            carry = (product >> 64) as u64;
        }
        (U256(limbs), carry)
    }

    pub fn div_u64(self, divisor: u64) -> U256 {
        debug_assert!(divisor != 0);
        let mut limbs = [0u64; 4];
        let mut rem = 0u128;
        for i in (0..4).rev() {
            let cur = rem << 64 | self.0[i] as u128;
            limbs[i] = (cur / divisor as u128) as u64;
            rem = cur % divisor as u128;
        }
        U256(limbs)
    }

    /// Shift-subtract long division.
    pub fn div(self, divisor: U256) -> U256 {
        debug_assert!(!divisor.is_zero());
        let mut quotient = U256::ZERO;
        let mut rem = U256::ZERO;
        let top = self.bits();
        for i in (0..top).rev() {
            rem = rem.shl(1);
            if self.bit(i) {
                rem.0[0] |= 1;
            }
            if rem >= divisor {
                rem = rem.wrapping_sub(divisor);
                quotient.set_bit(i);
            }
        }
        quotient
    }

    pub fn shl(self, shift: u32) -> U256 {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut limbs = [0u64; 4];
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in (0..4).rev() {
            if i >= limb_shift {
                limbs[i] = self.0[i - limb_shift] << bit_shift;
                if bit_shift > 0 && i > limb_shift {
                    limbs[i] |= self.0[i - limb_shift - 1] >> (64 - bit_shift);
                }
            }
        }
        U256(limbs)
    }

    pub fn shr(self, shift: u32) -> U256 {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut limbs = [0u64; 4];
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i + limb_shift < 4 {
                limbs[i] = self.0[i + limb_shift] >> bit_shift;
                if bit_shift > 0 && i + limb_shift + 1 < 4 {
                    limbs[i] |= self.0[i + limb_shift + 1] << (64 - bit_shift);
                }
            }
        }
        U256(limbs)
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::LowerHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_be_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Expands compact bits into a target. Returns `None` for negative or
/// overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if mantissa != 0 && bits & 0x0080_0000 != 0 {
        return None; // negative
    }
    if mantissa != 0 {
        let overflow = exponent > 34
            || (mantissa > 0xff && exponent > 33)
            || (mantissa > 0xffff && exponent > 32);
        if overflow {
            return None;
        }
    }
    let target = if exponent <= 3 {
        U256::from_u64((mantissa >> (8 * (3 - exponent))) as u64)
    } else {
        U256::from_u64(mantissa as u64).shl(8 * (exponent - 3))
    };
    Some(target)
}

/// Compresses a target into compact bits.
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        target.low_u32() << (8 * (3 - size))
    } else {
        target.shr(8 * (size - 3)).low_u32()
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | size << 24
}

/// Expected work of one block: `2^256 / (target + 1)`.
pub fn work_from_bits(bits: u32) -> U256 {
    let Some(target) = compact_to_target(bits) else {
        return U256::ZERO;
    };
    if target.is_zero() {
        return U256::ZERO;
    }
    // (~target / (target + 1)) + 1 == floor(2^256 / (target + 1)).
    let denominator = target.saturating_add(U256::ONE);
    target.not().div(denominator).overflowing_add(U256::ONE).0
}

/// Checks a block hash against its claimed compact target.
pub fn check_proof_of_work(hash_le: [u8; 32], bits: u32, pow_limit: &U256) -> bool {
    let Some(target) = compact_to_target(bits) else {
        return false;
    };
    if target.is_zero() || target > *pow_limit {
        return false;
    }
    U256::from_le_bytes(hash_le) <= target
}

/// Pre-fork 2016-block retarget with the ±4x clamp.
pub fn legacy_retarget(
    prev_bits: u32,
    first_time: u64,
    prev_time: u64,
    target_timespan: u64,
    pow_limit: &U256,
) -> u32 {
    let actual = prev_time.saturating_sub(first_time);
    let actual = actual.clamp(target_timespan / 4, target_timespan * 4);
    let Some(target) = compact_to_target(prev_bits) else {
        return target_to_compact(*pow_limit);
    };
    let (scaled, carry) = target.mul_u64(actual);
    let next = if carry != 0 { *pow_limit } else { scaled.div_u64(target_timespan) };
    target_to_compact(next.min(*pow_limit))
}

/// Emergency difficulty adjustment: ease the target by 25%.
pub fn eda_ease_bits(prev_bits: u32, pow_limit: &U256) -> u32 {
    let Some(target) = compact_to_target(prev_bits) else {
        return target_to_compact(*pow_limit);
    };
    let eased = target.saturating_add(target.shr(2));
    target_to_compact(eased.min(*pow_limit))
}

/// 144-block difficulty adjustment: project the window's work onto the
/// target spacing and invert it into a target.
///
/// `work` is the chainwork accumulated between the two suitable
/// boundary blocks and `timespan` their timestamp difference.
pub fn daa_target(work: U256, timespan: u64, target_spacing: u64, pow_limit: &U256) -> U256 {
    let ideal = 144 * target_spacing;
    let timespan = timespan.clamp(ideal / 2, ideal * 2);
    let (scaled, carry) = work.mul_u64(target_spacing);
    let projected = if carry != 0 { U256::MAX.div_u64(timespan) } else { scaled.div_u64(timespan) };
    if projected.is_zero() {
        return *pow_limit;
    }
    // (2^256 - W) / W == 2^256/W - 1.
    let target = projected.wrapping_neg().div(projected);
    target.min(*pow_limit)
}

/// Half-life of the ASERT schedule: two days of seconds.
pub const ASERT_HALF_LIFE: u64 = 172_800;

/// aserti3-2d: deterministic exponential target schedule anchored at a
/// reference block. `eval_height`/`eval_time` come from the parent of
/// the block whose target is being computed; `anchor_parent_time` is the
/// timestamp of the anchor's ancestor.
pub fn asert_target(
    anchor_bits: u32,
    anchor_height: u32,
    anchor_parent_time: u64,
    eval_height: u32,
    eval_time: u64,
    target_spacing: u64,
    half_life: u64,
    pow_limit: &U256,
) -> U256 {
    let Some(ref_target) = compact_to_target(anchor_bits) else {
        return *pow_limit;
    };

    let time_diff = eval_time as i64 - anchor_parent_time as i64;
    let height_diff = eval_height as i64 - anchor_height as i64 + 1;
    let exponent = (time_diff - target_spacing as i64 * height_diff)
        .saturating_mul(65536)
        / half_life as i64;

    // Split into whole doublings and a 16-bit fraction; the shift keeps
    // floor semantics for negative exponents.
    let shifts = exponent >> 16;
    let frac = (exponent - (shifts << 16)) as u128;
    debug_assert!(frac < 65536);

    // Cubic approximation of 2^(frac/2^16), scaled by 2^16.
    let factor = ((195_766_423_245_049u128 * frac
        + 971_821_376u128 * frac * frac
        + 5127u128 * frac * frac * frac
        + (1u128 << 47))
        >> 48) as u64
        + 65536;

    let (product, carry) = ref_target.mul_u64(factor);
    let net = shifts - 16;
    let target = if net >= 0 {
        if carry != 0 || net >= 256 {
            *pow_limit
        } else {
            let shifted = product.shl(net as u32);
            // Bits pushed past the top mean the schedule has outgrown
            // the representable range.
            if shifted.shr(net as u32) != product {
                *pow_limit
            } else {
                shifted
            }
        }
    } else {
        // value = carry·2^256 + product, shifted right.
        let right = (-net) as u32;
        let mut shifted = product.shr(right);
        if carry != 0 {
            if right < 64 && carry >> right != 0 {
                // Bits would remain above 2^256.
                shifted = *pow_limit;
            } else if right >= 256 {
                let extra = right - 256;
                let high = if extra >= 64 { 0 } else { carry >> extra };
                shifted = shifted.saturating_add(U256::from_u64(high));
            } else {
                let masked = if right >= 64 { carry } else { carry & ((1u64 << right) - 1) };
                shifted = shifted.saturating_add(U256::from_u64(masked).shl(256 - right));
            }
        }
        shifted
    };

    if target.is_zero() {
        return U256::ONE;
    }
    target.min(*pow_limit)
}
