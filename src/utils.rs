use std::ops::{BitAnd, Shl, Shr};

use num::Integer;

/// Make an n_bits-long mask (all ones)
pub fn mask<T>(n_bits: T) -> T
where
    T: Integer + Shl<Output = T>,
{
    (T::one() << n_bits) - T::one()
}

/// Obtain value[end:start] (verilog notation) from value
pub fn extract_field<T>(value: T, end: T, start: T) -> T
where
    T: Copy + Integer + Shl<Output = T> + Shr<Output = T> + BitAnd<Output = T>,
{
    mask(end - start + T::one()) & (value >> start)
}

/// Copy the bit at sign_bit_position into all higher bits of the u64.
pub fn sign_extend64(value: u64, sign_bit_position: u32) -> u64 {
    if sign_bit_position >= 63 {
        return value;
    }
    let sign_bit = 1 & (value >> sign_bit_position);
    if sign_bit == 1 {
        value | !mask::<u64>(sign_bit_position.into())
    } else {
        value & mask::<u64>((sign_bit_position + 1).into())
    }
}

/// Truncate a value to the given number of bits.
pub fn truncate(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & mask::<u64>(bits.into())
    }
}

/// Interpret the low `bits` of `value` as a signed integer.
pub fn to_signed(value: u64, bits: u32) -> i64 {
    sign_extend64(truncate(value, bits), bits - 1) as i64
}
