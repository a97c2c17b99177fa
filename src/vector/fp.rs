//! Floating-point arithmetic engine
//!
//! Half, single and double element widths, with bf16 entering through
//! its widening-FMA and conversion forms. Narrow widths compute in
//! f32 and doubles compute natively; f32 carries enough precision
//! that the narrow results round identically to direct computation.
//!
//! IEEE exception flags raised by the host math are not observable,
//! so the engine derives them: invalid and divide-by-zero exactly
//! from the operands, overflow/underflow/inexact from the shape of
//! the result. Flags collect in a thread-local accumulator, cleared
//! at instruction entry and drained into `fcsr.fflags` at completion,
//! with a per-element copy kept in the instruction trace.

use std::cell::Cell;

use crate::hart::{Exception, Hart};
use crate::instr::{CvtOp, FpCmpOp, FpOp, OperandKind, VecInstr};
use crate::utils::{to_signed, truncate};
use crate::vector::check;
use crate::vector::regs::ElemPolicy;
use crate::vector::vtype::Lmul;
use crate::vector::{current_vlmax, policies};

pub const FFLAG_NX: u8 = 0x01;
pub const FFLAG_UF: u8 = 0x02;
pub const FFLAG_OF: u8 = 0x04;
pub const FFLAG_DZ: u8 = 0x08;
pub const FFLAG_NV: u8 = 0x10;

thread_local! {
    static FP_FLAGS: Cell<u8> = const { Cell::new(0) };
}

pub fn clear_flags() {
    FP_FLAGS.with(|f| f.set(0));
}

pub fn raise(flags: u8) {
    FP_FLAGS.with(|f| f.set(f.get() | flags));
}

pub fn peek_flags() -> u8 {
    FP_FLAGS.with(|f| f.get())
}

pub fn take_flags() -> u8 {
    FP_FLAGS.with(|f| f.replace(0))
}

/// Element format of an FP operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FpWidth {
    F16,
    Bf16,
    F32,
    F64,
}

impl FpWidth {
    pub fn bits(&self) -> u32 {
        match self {
            FpWidth::F16 | FpWidth::Bf16 => 16,
            FpWidth::F32 => 32,
            FpWidth::F64 => 64,
        }
    }

    fn from_sew(bits: u32) -> Option<Self> {
        match bits {
            16 => Some(FpWidth::F16),
            32 => Some(FpWidth::F32),
            64 => Some(FpWidth::F64),
            _ => None,
        }
    }

    /// The doubled width for widening operations.
    fn widen(&self) -> Option<Self> {
        match self {
            FpWidth::F16 | FpWidth::Bf16 => Some(FpWidth::F32),
            FpWidth::F32 => Some(FpWidth::F64),
            FpWidth::F64 => None,
        }
    }

    pub fn canonical_nan(&self) -> u64 {
        match self {
            FpWidth::F16 => 0x7e00,
            FpWidth::Bf16 => 0x7fc0,
            FpWidth::F32 => 0x7fc0_0000,
            FpWidth::F64 => 0x7ff8_0000_0000_0000,
        }
    }

    fn exp_bits(&self) -> u32 {
        match self {
            FpWidth::F16 => 5,
            FpWidth::Bf16 | FpWidth::F32 => 8,
            FpWidth::F64 => 11,
        }
    }

    fn sig_bits(&self) -> u32 {
        self.bits() - 1 - self.exp_bits()
    }
}

pub fn is_nan_bits(bits: u64, w: FpWidth) -> bool {
    let exp_mask = ((1u64 << w.exp_bits()) - 1) << w.sig_bits();
    let sig_mask = (1u64 << w.sig_bits()) - 1;
    let bits = truncate(bits, w.bits());
    (bits & exp_mask) == exp_mask && (bits & sig_mask) != 0
}

pub fn is_snan_bits(bits: u64, w: FpWidth) -> bool {
    is_nan_bits(bits, w) && (bits >> (w.sig_bits() - 1)) & 1 == 0
}

/// Convert half-precision bits to f32 exactly.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from(bits >> 10) & 0x1f;
    let sig = u32::from(bits) & 0x3ff;
    let value = if exp == 0x1f {
        // Inf or NaN; keep the quiet bit
        sign | 0x7f80_0000 | (sig << 13)
    } else if exp == 0 {
        if sig == 0 {
            sign
        } else {
            // Subnormal: normalize into the f32 exponent range
            let shift = sig.leading_zeros() - 21;
            let sig = (sig << shift) & 0x3ff;
            let exp = 127 - 14 - shift;
            sign | (exp << 23) | (sig << 13)
        }
    } else {
        sign | ((exp + 127 - 15) << 23) | (sig << 13)
    };
    f32::from_bits(value)
}

/// Round an f32 to half precision (round-to-nearest-even), raising
/// overflow/underflow/inexact as appropriate.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 31) as u16) << 15;
    if value.is_nan() {
        return 0x7e00;
    }
    if value.is_infinite() {
        return sign | 0x7c00;
    }
    let abs = value.abs();
    if abs == 0.0 {
        return sign;
    }
    // Half-precision max finite is 65504
    if abs >= 65520.0 {
        raise(FFLAG_OF | FFLAG_NX);
        return sign | 0x7c00;
    }
    let exp = (bits >> 23 & 0xff) as i32 - 127;
    if exp >= -14 {
        // Normal range: round 23-bit significand to 10 bits
        let sig = bits & 0x7f_ffff;
        let rounded = round_sig(u64::from(sig) | 0x80_0000, 13);
        let (sig, exp) = if rounded >= 0x800 {
            (rounded >> 1 & 0x3ff, exp + 1)
        } else {
            (rounded & 0x3ff, exp)
        };
        if exp > 15 {
            raise(FFLAG_OF | FFLAG_NX);
            return sign | 0x7c00;
        }
        if u64::from(bits) & ((1 << 13) - 1) != 0 {
            raise(FFLAG_NX);
        }
        sign | (((exp + 15) as u16) << 10) | sig as u16
    } else {
        // Subnormal result: the 24-bit significand shifts right by
        // -exp - 1 to land in the 2^-24 subnormal scale
        let shift = (-1 - exp) as u32;
        let sig = u64::from(bits & 0x7f_ffff) | 0x80_0000;
        if shift >= 25 {
            raise(FFLAG_UF | FFLAG_NX);
            return sign;
        }
        let rounded = round_sig(sig, shift);
        if sig & ((1u64 << shift) - 1) != 0 {
            raise(FFLAG_UF | FFLAG_NX);
        }
        sign | (rounded as u16 & 0x7ff)
    }
}

/// Round-to-nearest-even of the low `shift` bits.
fn round_sig(sig: u64, shift: u32) -> u64 {
    if shift == 0 || shift >= 64 {
        return if shift == 0 { sig } else { 0 };
    }
    let shifted = sig >> shift;
    let round_bit = sig >> (shift - 1) & 1;
    let sticky = sig & ((1u64 << (shift - 1)) - 1) != 0;
    if round_bit == 1 && (sticky || shifted & 1 == 1) {
        shifted + 1
    } else {
        shifted
    }
}

pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits(u32::from(bits) << 16)
}

/// Round an f32 to bf16 (round-to-nearest-even).
pub fn f32_to_bf16(value: f32) -> u16 {
    if value.is_nan() {
        return 0x7fc0;
    }
    let bits = value.to_bits();
    let rounded = round_sig(u64::from(bits), 16) as u32;
    if bits & 0xffff != 0 {
        raise(FFLAG_NX);
        if (rounded << 16) & 0x7fff_ffff == 0x7f80_0000 && !value.is_infinite() {
            raise(FFLAG_OF);
        }
    }
    rounded as u16
}

/// Computation value: narrow widths compute in f32, doubles natively.
#[derive(Debug, Copy, Clone, PartialEq)]
enum Num {
    S(f32),
    D(f64),
}

fn load(bits: u64, w: FpWidth) -> Num {
    match w {
        FpWidth::F16 => Num::S(f16_to_f32(bits as u16)),
        FpWidth::Bf16 => Num::S(bf16_to_f32(bits as u16)),
        FpWidth::F32 => Num::S(f32::from_bits(bits as u32)),
        FpWidth::F64 => Num::D(f64::from_bits(bits)),
    }
}

fn store(value: Num, w: FpWidth) -> u64 {
    match (value, w) {
        (Num::S(v), FpWidth::F16) => f32_to_f16(v).into(),
        (Num::S(v), FpWidth::Bf16) => f32_to_bf16(v).into(),
        (Num::S(v), FpWidth::F32) => v.to_bits().into(),
        (Num::D(v), FpWidth::F64) => v.to_bits(),
        (Num::S(v), FpWidth::F64) => f64::from(v).to_bits(),
        (Num::D(v), _) => store(Num::S(v as f32), w),
    }
}

/// Exact widening to f64 for conversions and widening reads.
fn to_f64(bits: u64, w: FpWidth) -> f64 {
    match load(bits, w) {
        Num::S(v) => v.into(),
        Num::D(v) => v,
    }
}

impl Num {
    fn is_nan(&self) -> bool {
        match self {
            Num::S(v) => v.is_nan(),
            Num::D(v) => v.is_nan(),
        }
    }

    fn is_infinite(&self) -> bool {
        match self {
            Num::S(v) => v.is_infinite(),
            Num::D(v) => v.is_infinite(),
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            Num::S(v) => v.is_finite(),
            Num::D(v) => v.is_finite(),
        }
    }

    fn is_zero(&self) -> bool {
        match self {
            Num::S(v) => *v == 0.0,
            Num::D(v) => *v == 0.0,
        }
    }

    fn is_subnormal(&self) -> bool {
        match self {
            Num::S(v) => v.is_subnormal(),
            Num::D(v) => v.is_subnormal(),
        }
    }
}

fn map2(a: Num, b: Num, fs: impl Fn(f32, f32) -> f32, fd: impl Fn(f64, f64) -> f64) -> Num {
    match (a, b) {
        (Num::S(a), Num::S(b)) => Num::S(fs(a, b)),
        (Num::D(a), Num::D(b)) => Num::D(fd(a, b)),
        _ => panic!("mixed-width fp computation"),
    }
}

fn map3(
    a: Num,
    b: Num,
    c: Num,
    fs: impl Fn(f32, f32, f32) -> f32,
    fd: impl Fn(f64, f64, f64) -> f64,
) -> Num {
    match (a, b, c) {
        (Num::S(a), Num::S(b), Num::S(c)) => Num::S(fs(a, b, c)),
        (Num::D(a), Num::D(b), Num::D(c)) => Num::D(fd(a, b, c)),
        _ => panic!("mixed-width fp computation"),
    }
}

/// Flags for a computed result: overflow when finite operands produce
/// an infinity, underflow for subnormal products/quotients, invalid
/// when a NaN appears from non-NaN operands.
fn result_flags(result: Num, operands: &[Num], underflow_applies: bool) {
    let any_nan = operands.iter().any(Num::is_nan);
    if result.is_nan() && !any_nan {
        raise(FFLAG_NV);
    }
    if result.is_infinite() && operands.iter().all(Num::is_finite) && !any_nan {
        raise(FFLAG_OF | FFLAG_NX);
    }
    if underflow_applies && result.is_subnormal() {
        raise(FFLAG_UF | FFLAG_NX);
    }
}

fn snan_flags(operand_bits: &[u64], w: FpWidth) {
    if operand_bits.iter().any(|&b| is_snan_bits(b, w)) {
        raise(FFLAG_NV);
    }
}

/// RISC-V fmin/fmax: a single NaN operand yields the other operand,
/// two NaNs yield the canonical NaN, and -0.0 orders below +0.0.
fn min_max(a_bits: u64, b_bits: u64, w: FpWidth, is_min: bool) -> u64 {
    snan_flags(&[a_bits, b_bits], w);
    let a_nan = is_nan_bits(a_bits, w);
    let b_nan = is_nan_bits(b_bits, w);
    if a_nan && b_nan {
        return w.canonical_nan();
    }
    if a_nan {
        return truncate(b_bits, w.bits());
    }
    if b_nan {
        return truncate(a_bits, w.bits());
    }
    let a = to_f64(a_bits, w);
    let b = to_f64(b_bits, w);
    let sign_bit = w.bits() - 1;
    let a_neg_zero = a == 0.0 && (a_bits >> sign_bit) & 1 == 1;
    let b_neg_zero = b == 0.0 && (b_bits >> sign_bit) & 1 == 1;
    let a_wins = if a == 0.0 && b == 0.0 {
        // Zeros compare equal; order the signed zeros explicitly
        if is_min {
            a_neg_zero || !b_neg_zero
        } else {
            !a_neg_zero || b_neg_zero
        }
    } else if is_min {
        a < b
    } else {
        a > b
    };
    truncate(if a_wins { a_bits } else { b_bits }, w.bits())
}

/// Sign injection on raw bits.
fn sign_inject(a_bits: u64, b_bits: u64, w: FpWidth, mode: FpOp) -> u64 {
    let sign_bit = 1u64 << (w.bits() - 1);
    let mag = truncate(a_bits, w.bits()) & !sign_bit;
    let b_sign = truncate(b_bits, w.bits()) & sign_bit;
    match mode {
        FpOp::Sgnj => mag | b_sign,
        FpOp::Sgnjn => mag | (b_sign ^ sign_bit),
        FpOp::Sgnjx => mag | ((truncate(a_bits, w.bits()) & sign_bit) ^ b_sign),
        _ => unreachable!("sign-injection mode"),
    }
}

/// The 10-bit fclass result.
pub fn classify(bits: u64, w: FpWidth) -> u64 {
    let sign = (truncate(bits, w.bits()) >> (w.bits() - 1)) & 1 == 1;
    let exp_mask = ((1u64 << w.exp_bits()) - 1) << w.sig_bits();
    let sig_mask = (1u64 << w.sig_bits()) - 1;
    let bits_t = truncate(bits, w.bits());
    let exp = bits_t & exp_mask;
    let sig = bits_t & sig_mask;
    if exp == exp_mask {
        if sig == 0 {
            return if sign { 1 << 0 } else { 1 << 7 };
        }
        return if is_snan_bits(bits, w) { 1 << 8 } else { 1 << 9 };
    }
    if exp == 0 {
        if sig == 0 {
            return if sign { 1 << 3 } else { 1 << 4 };
        }
        return if sign { 1 << 2 } else { 1 << 5 };
    }
    if sign {
        1 << 1
    } else {
        1 << 6
    }
}

/// frsqrt7 estimate table, indexed by the low bit of the exponent
/// and the six most significant bits of the normalized significand.
/// Each entry holds the seven most significant fraction bits of the
/// estimate: the reciprocal square root of the input interval's
/// midpoint, rounded to 7 bits.
const RSQRT7_TABLE: [u8; 128] = [
    52, 51, 50, 48, 47, 46, 44, 43,
    42, 41, 40, 39, 38, 36, 35, 34,
    33, 32, 31, 30, 30, 29, 28, 27,
    26, 25, 24, 23, 23, 22, 21, 20,
    19, 19, 18, 17, 16, 16, 15, 14,
    14, 13, 12, 12, 11, 10, 10, 9,
    9, 8, 7, 7, 6, 6, 5, 4,
    4, 3, 3, 2, 2, 1, 1, 0,
    127, 125, 123, 121, 119, 118, 116, 114,
    113, 111, 109, 108, 106, 105, 103, 102,
    100, 99, 97, 96, 95, 93, 92, 91,
    90, 88, 87, 86, 85, 84, 83, 82,
    80, 79, 78, 77, 76, 75, 74, 73,
    72, 71, 70, 70, 69, 68, 67, 66,
    65, 64, 63, 63, 62, 61, 60, 59,
    59, 58, 57, 56, 56, 55, 54, 53,
];

/// frec7 estimate table, indexed by the seven most significant bits
/// of the normalized significand: the reciprocal of the input
/// interval's midpoint, rounded to 7 bits.
const REC7_TABLE: [u8; 128] = [
    127, 125, 123, 121, 119, 117, 116, 114,
    112, 110, 109, 107, 105, 104, 102, 100,
    99, 97, 96, 94, 93, 91, 90, 88,
    87, 85, 84, 83, 81, 80, 79, 77,
    76, 75, 74, 72, 71, 70, 69, 68,
    66, 65, 64, 63, 62, 61, 60, 59,
    58, 57, 56, 55, 54, 53, 52, 51,
    50, 49, 48, 47, 46, 45, 44, 43,
    42, 41, 40, 40, 39, 38, 37, 36,
    35, 35, 34, 33, 32, 31, 31, 30,
    29, 28, 28, 27, 26, 25, 25, 24,
    23, 23, 22, 21, 21, 20, 19, 19,
    18, 17, 17, 16, 15, 15, 14, 14,
    13, 12, 12, 11, 11, 10, 9, 9,
    8, 8, 7, 7, 6, 5, 5, 4,
    4, 3, 3, 2, 2, 1, 1, 0,
];

fn exp_bias(w: FpWidth) -> i64 {
    (1i64 << (w.exp_bits() - 1)) - 1
}

/// frsqrt7: table-lookup estimate of 1/sqrt(x) to 7 significand bits.
fn rsqrt7(bits: u64, w: FpWidth) -> u64 {
    if is_snan_bits(bits, w) {
        raise(FFLAG_NV);
        return w.canonical_nan();
    }
    if is_nan_bits(bits, w) {
        return w.canonical_nan();
    }
    let sig_bits = w.sig_bits();
    let exp_field_mask = (1u64 << w.exp_bits()) - 1;
    let sig_mask = (1u64 << sig_bits) - 1;
    let bits_t = truncate(bits, w.bits());
    let sign = bits_t >> (w.bits() - 1) & 1 == 1;
    let exp_field = bits_t >> sig_bits & exp_field_mask;
    let mut sig = bits_t & sig_mask;
    if exp_field == 0 && sig == 0 {
        raise(FFLAG_DZ);
        // Signed infinity of the zero's sign
        let inf = exp_field_mask << sig_bits;
        return if sign { inf | 1 << (w.bits() - 1) } else { inf };
    }
    if sign {
        raise(FFLAG_NV);
        return w.canonical_nan();
    }
    if exp_field == exp_field_mask {
        // +infinity
        return 0;
    }
    let mut exp = exp_field as i64;
    if exp == 0 {
        // Normalize a subnormal significand
        while sig & (1 << (sig_bits - 1)) == 0 {
            sig <<= 1;
            exp -= 1;
        }
        sig = (sig << 1) & sig_mask;
    }
    let idx = (((exp & 1) << 6) | (sig >> (sig_bits - 6)) as i64) as usize;
    let out_sig = u64::from(RSQRT7_TABLE[idx]) << (sig_bits - 7);
    let out_exp = ((3 * exp_bias(w) - 1 - exp) / 2) as u64;
    (out_exp << sig_bits) | out_sig
}

/// frec7: table-lookup estimate of 1/x to 7 significand bits.
fn rec7(bits: u64, w: FpWidth, frm: u8) -> u64 {
    if is_snan_bits(bits, w) {
        raise(FFLAG_NV);
        return w.canonical_nan();
    }
    if is_nan_bits(bits, w) {
        return w.canonical_nan();
    }
    let sig_bits = w.sig_bits();
    let exp_field_mask = (1u64 << w.exp_bits()) - 1;
    let sig_mask = (1u64 << sig_bits) - 1;
    let sign_bit = 1u64 << (w.bits() - 1);
    let bits_t = truncate(bits, w.bits());
    let sign = bits_t & sign_bit != 0;
    let exp_field = bits_t >> sig_bits & exp_field_mask;
    let mut sig = bits_t & sig_mask;
    if exp_field == 0 && sig == 0 {
        raise(FFLAG_DZ);
        let inf = exp_field_mask << sig_bits;
        return if sign { inf | sign_bit } else { inf };
    }
    if exp_field == exp_field_mask {
        // Infinity reciprocates to zero of the same sign
        return if sign { sign_bit } else { 0 };
    }
    let mut exp = exp_field as i64;
    if exp == 0 {
        while sig & (1 << (sig_bits - 1)) == 0 {
            sig <<= 1;
            exp -= 1;
        }
        sig = (sig << 1) & sig_mask;
    }
    let idx = (sig >> (sig_bits - 7)) as usize;
    let mut out_sig = u64::from(REC7_TABLE[idx]) << (sig_bits - 7);
    let mut out_exp = 2 * exp_bias(w) - 1 - exp;
    if out_exp >= (1i64 << w.exp_bits()) - 1 {
        // The estimate overflows the format: greatest magnitude or
        // infinity per the rounding mode
        raise(FFLAG_OF | FFLAG_NX);
        let max_mag = ((exp_field_mask - 1) << sig_bits) | sig_mask;
        let round_to_max = match frm {
            1 => true,  // rtz
            2 => !sign, // rdn: positive rounds down to max
            3 => sign,  // rup: negative rounds up to -max
            _ => false,
        };
        let mag = if round_to_max {
            max_mag
        } else {
            exp_field_mask << sig_bits
        };
        return if sign { mag | sign_bit } else { mag };
    }
    if out_exp <= 0 {
        // Subnormal estimate: restore the implicit bit and shift into
        // the subnormal scale
        out_sig = (out_sig | (1 << sig_bits)) >> (1 - out_exp);
        out_exp = 0;
    }
    let mag = ((out_exp as u64) << sig_bits) | out_sig;
    if sign {
        mag | sign_bit
    } else {
        mag
    }
}

/// Round a host f64 to a signed/unsigned integer of the given width
/// per the rounding mode, saturating with the invalid flag on range
/// and NaN inputs.
fn f64_to_int(value: f64, bits: u32, signed: bool, frm: u8) -> u64 {
    let rounded = match frm {
        0 => value.round_ties_even(),
        1 => value.trunc(),
        2 => value.floor(),
        3 => value.ceil(),
        _ => value.round(),
    };
    if value.is_nan() {
        raise(FFLAG_NV);
        return if signed {
            truncate(!0 >> 1, bits) // most positive
        } else {
            truncate(!0, bits)
        };
    }
    if rounded != value {
        raise(FFLAG_NX);
    }
    if signed {
        let min = -(2f64.powi(bits as i32 - 1));
        let max = 2f64.powi(bits as i32 - 1) - 1.0;
        if rounded < min {
            raise(FFLAG_NV);
            return truncate(1 << (bits - 1), bits);
        }
        if rounded > max {
            raise(FFLAG_NV);
            return truncate((1u128 << (bits - 1)) as u64 - 1, bits);
        }
        truncate(rounded as i64 as u64, bits)
    } else {
        let max = 2f64.powi(bits as i32) - 1.0;
        if rounded < 0.0 {
            raise(FFLAG_NV);
            return 0;
        }
        if rounded > max {
            raise(FFLAG_NV);
            return truncate(!0, bits);
        }
        rounded as u64
    }
}

/// Narrow an f64 to f32 with round-toward-odd.
fn f64_to_f32_rod(value: f64) -> f32 {
    if value.is_nan() {
        return f32::from_bits(0x7fc0_0000);
    }
    let narrowed = value as f32;
    if f64::from(narrowed) == value {
        return narrowed;
    }
    raise(FFLAG_NX);
    let toward_zero = if f64::from(narrowed).abs() > value.abs() {
        f32::from_bits(narrowed.to_bits() - 1)
    } else {
        narrowed
    };
    f32::from_bits(toward_zero.to_bits() | 1)
}

/// FP scalar operand at the element width, NaN-boxed.
fn fp_scalar(hart: &Hart, instr: &VecInstr, w: FpWidth) -> u64 {
    match instr.kinds[1] {
        OperandKind::FpReg => hart.fregs.read_boxed(instr.rs1(), w.bits()),
        _ => 0,
    }
}

struct FpCtx {
    w: FpWidth,
    sew: u32,
    lmul: Lmul,
    vd: u32,
    vs2: u32,
    vstart: u64,
    vl: u64,
    inactive: ElemPolicy,
    tail: ElemPolicy,
}

fn fp_ctx(hart: &Hart, instr: &VecInstr) -> Result<FpCtx, Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let w = FpWidth::from_sew(sew).ok_or(Exception::IllegalInstruction)?;
    let (inactive, tail) = policies(hart);
    Ok(FpCtx {
        w,
        sew,
        lmul: hart.csr.vtype.lmul,
        vd: instr.vd(),
        vs2: instr.vs2(),
        vstart: hart.csr.vstart,
        vl: hart.csr.vl,
        inactive,
        tail,
    })
}

/// Record the flags the element raised beyond what was already
/// accumulated.
fn record_elem_flags(hart: &mut Hart, ix: u64, before: u8) {
    let after = peek_flags();
    if hart.elem_fflags.len() <= ix as usize {
        hart.elem_fflags.resize(ix as usize + 1, 0);
    }
    hart.elem_fflags[ix as usize] = after & !before;
}

/// vs1-or-scalar element source for FP forms.
fn fp_src1(hart: &Hart, instr: &VecInstr, ix: u64, w: FpWidth, scalar: u64) -> u64 {
    if instr.kinds[1] == OperandKind::VecReg {
        hart.vregs.read_uint(instr.vs1(), ix, w.bits())
    } else {
        scalar
    }
}

fn check_fp_binary(hart: &Hart, instr: &VecInstr, ctx: &FpCtx) -> Result<(), Exception> {
    check::require_aligned(ctx.vd, ctx.lmul)?;
    check::require_aligned(ctx.vs2, ctx.lmul)?;
    check::check_masked_dest(ctx.vd, instr.masked)?;
    let mut sources = vec![(ctx.vs2, ctx.sew)];
    if instr.kinds[1] == OperandKind::VecReg {
        check::require_aligned(instr.vs1(), ctx.lmul)?;
        sources.push((instr.vs1(), ctx.sew));
    }
    check::check_masked_sources(&sources, instr.masked)
}

pub fn exec(hart: &mut Hart, instr: &VecInstr, op: FpOp) -> Result<(), Exception> {
    match op {
        FpOp::Wadd | FpOp::Wsub | FpOp::WaddW | FpOp::WsubW | FpOp::Wmul | FpOp::Wmacc
        | FpOp::Wnmacc | FpOp::Wmsac | FpOp::Wnmsac => return exec_widening(hart, instr, op, false),
        FpOp::WmaccBf16 => return exec_widening(hart, instr, FpOp::Wmacc, true),
        _ => (),
    }

    let ctx = fp_ctx(hart, instr)?;
    check_fp_binary(hart, instr, &ctx)?;
    let scalar = fp_scalar(hart, instr, ctx.w);
    let is_fma = matches!(
        op,
        FpOp::Macc
            | FpOp::Nmacc
            | FpOp::Msac
            | FpOp::Nmsac
            | FpOp::Madd
            | FpOp::Nmadd
            | FpOp::Msub
            | FpOp::Nmsub
    );
    let frm = hart.csr.frm;

    for ix in ctx.vstart..ctx.vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(ctx.vd, ix, ctx.sew, ctx.inactive);
            continue;
        }
        let before = peek_flags();
        let a_bits = hart.vregs.read_uint(ctx.vs2, ix, ctx.sew);
        let b_bits = fp_src1(hart, instr, ix, ctx.w, scalar);
        let value = match op {
            FpOp::Min => min_max(a_bits, b_bits, ctx.w, true),
            FpOp::Max => min_max(a_bits, b_bits, ctx.w, false),
            FpOp::Sgnj | FpOp::Sgnjn | FpOp::Sgnjx => sign_inject(a_bits, b_bits, ctx.w, op),
            FpOp::Class => classify(a_bits, ctx.w),
            FpOp::Rsqrt7 => rsqrt7(a_bits, ctx.w),
            FpOp::Rec7 => rec7(a_bits, ctx.w, frm),
            FpOp::Sqrt => {
                snan_flags(&[a_bits], ctx.w);
                let a = load(a_bits, ctx.w);
                let r = match a {
                    Num::S(v) => Num::S(v.sqrt()),
                    Num::D(v) => Num::D(v.sqrt()),
                };
                result_flags(r, &[a], false);
                canonicalize(r, ctx.w)
            }
            _ if is_fma => {
                let d_bits = hart.vregs.read_uint(ctx.vd, ix, ctx.sew);
                snan_flags(&[a_bits, b_bits, d_bits], ctx.w);
                let a = load(a_bits, ctx.w);
                let b = load(b_bits, ctx.w);
                let d = load(d_bits, ctx.w);
                let r = fma_variant(op, a, b, d);
                result_flags(r, &[a, b, d], true);
                canonicalize(r, ctx.w)
            }
            _ => {
                snan_flags(&[a_bits, b_bits], ctx.w);
                let a = load(a_bits, ctx.w);
                let b = load(b_bits, ctx.w);
                let r = match op {
                    FpOp::Add => map2(a, b, |a, b| a + b, |a, b| a + b),
                    FpOp::Sub => map2(a, b, |a, b| a - b, |a, b| a - b),
                    FpOp::Rsub => map2(a, b, |a, b| b - a, |a, b| b - a),
                    FpOp::Mul => map2(a, b, |a, b| a * b, |a, b| a * b),
                    FpOp::Div => {
                        if !b.is_nan() && b.is_zero() && !a.is_nan() && !a.is_zero() {
                            raise(FFLAG_DZ);
                        }
                        map2(a, b, |a, b| a / b, |a, b| a / b)
                    }
                    FpOp::Rdiv => {
                        if !a.is_nan() && a.is_zero() && !b.is_nan() && !b.is_zero() {
                            raise(FFLAG_DZ);
                        }
                        map2(a, b, |a, b| b / a, |a, b| b / a)
                    }
                    _ => unreachable!("handled above"),
                };
                let underflow = matches!(op, FpOp::Mul | FpOp::Div | FpOp::Rdiv);
                result_flags(r, &[a, b], underflow);
                canonicalize(r, ctx.w)
            }
        };
        hart.vregs.write_uint(ctx.vd, ix, ctx.sew, value);
        record_elem_flags(hart, ix, before);
    }
    hart.vregs
        .fill_tail(ctx.vd, ctx.vl, current_vlmax(hart), ctx.sew, ctx.tail);
    Ok(())
}

fn canonicalize(r: Num, w: FpWidth) -> u64 {
    if r.is_nan() {
        w.canonical_nan()
    } else {
        store(r, w)
    }
}

fn fma_variant(op: FpOp, a: Num, b: Num, d: Num) -> Num {
    // a = vs2 element, b = vs1/scalar, d = destination element
    match op {
        // vd = +(vs1 * vs2) + vd
        FpOp::Macc => map3(a, b, d, |a, b, d| b.mul_add(a, d), |a, b, d| b.mul_add(a, d)),
        // vd = -(vs1 * vs2) - vd
        FpOp::Nmacc => map3(
            a,
            b,
            d,
            |a, b, d| (-b).mul_add(a, -d),
            |a, b, d| (-b).mul_add(a, -d),
        ),
        // vd = +(vs1 * vs2) - vd
        FpOp::Msac => map3(
            a,
            b,
            d,
            |a, b, d| b.mul_add(a, -d),
            |a, b, d| b.mul_add(a, -d),
        ),
        // vd = -(vs1 * vs2) + vd
        FpOp::Nmsac => map3(
            a,
            b,
            d,
            |a, b, d| (-b).mul_add(a, d),
            |a, b, d| (-b).mul_add(a, d),
        ),
        // vd = +(vs1 * vd) + vs2
        FpOp::Madd => map3(a, b, d, |a, b, d| b.mul_add(d, a), |a, b, d| b.mul_add(d, a)),
        // vd = -(vs1 * vd) - vs2
        FpOp::Nmadd => map3(
            a,
            b,
            d,
            |a, b, d| (-b).mul_add(d, -a),
            |a, b, d| (-b).mul_add(d, -a),
        ),
        // vd = +(vs1 * vd) - vs2
        FpOp::Msub => map3(
            a,
            b,
            d,
            |a, b, d| b.mul_add(d, -a),
            |a, b, d| b.mul_add(d, -a),
        ),
        // vd = -(vs1 * vd) + vs2
        FpOp::Nmsub => map3(
            a,
            b,
            d,
            |a, b, d| (-b).mul_add(d, a),
            |a, b, d| (-b).mul_add(d, a),
        ),
        _ => unreachable!("fma variant"),
    }
}

/// Widening FP forms: sources at SEW (or bf16), destination at 2x.
fn exec_widening(hart: &mut Hart, instr: &VecInstr, op: FpOp, bf16: bool) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let narrow_w = if bf16 {
        if sew != 16 {
            return Err(Exception::IllegalInstruction);
        }
        FpWidth::Bf16
    } else {
        FpWidth::from_sew(sew).ok_or(Exception::IllegalInstruction)?
    };
    let wide_w = narrow_w.widen().ok_or(Exception::IllegalInstruction)?;
    let wide = sew * 2;
    let lmul = hart.csr.vtype.lmul;
    let d_emul = lmul.emul(sew, wide).ok_or(Exception::IllegalInstruction)?;
    let vd = instr.vd();
    let vs2 = instr.vs2();

    let wide_vs2 = matches!(op, FpOp::WaddW | FpOp::WsubW);
    let vs2_eew = if wide_vs2 { wide } else { sew };
    let vs2_emul = if wide_vs2 { d_emul } else { lmul };
    let vs2_w = if wide_vs2 { wide_w } else { narrow_w };

    check::require_aligned(vd, d_emul)?;
    check::require_aligned(vs2, vs2_emul)?;
    check::check_masked_dest(vd, instr.masked)?;
    let mut sources = vec![(vs2, vs2_eew)];
    if !wide_vs2 {
        check::check_widen_overlap(vd, d_emul, vs2, lmul)?;
    }
    if instr.kinds[1] == OperandKind::VecReg {
        check::require_aligned(instr.vs1(), lmul)?;
        check::check_widen_overlap(vd, d_emul, instr.vs1(), lmul)?;
        sources.push((instr.vs1(), sew));
    }
    check::check_masked_sources(&sources, instr.masked)?;

    let scalar = fp_scalar(hart, instr, narrow_w);
    let accumulate = matches!(op, FpOp::Wmacc | FpOp::Wnmacc | FpOp::Wmsac | FpOp::Wnmsac);
    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);

    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, wide, inactive);
            continue;
        }
        let before = peek_flags();
        let a_bits = hart.vregs.read_uint(vs2, ix, vs2_eew);
        let b_bits = fp_src1(hart, instr, ix, narrow_w, scalar);
        // Exact promotion to the wide compute format
        let a = to_f64(a_bits, vs2_w);
        let b = to_f64(b_bits, narrow_w);
        if is_snan_bits(a_bits, vs2_w) || is_snan_bits(b_bits, narrow_w) {
            raise(FFLAG_NV);
        }
        let r = if accumulate {
            let d_bits = hart.vregs.read_uint(vd, ix, wide);
            if is_snan_bits(d_bits, wide_w) {
                raise(FFLAG_NV);
            }
            let d = to_f64(d_bits, wide_w);
            match op {
                FpOp::Wmacc => b.mul_add(a, d),
                FpOp::Wnmacc => (-b).mul_add(a, -d),
                FpOp::Wmsac => b.mul_add(a, -d),
                FpOp::Wnmsac => (-b).mul_add(a, d),
                _ => unreachable!(),
            }
        } else {
            match op {
                FpOp::Wadd | FpOp::WaddW => a + b,
                FpOp::Wsub | FpOp::WsubW => a - b,
                FpOp::Wmul => a * b,
                _ => unreachable!(),
            }
        };
        let rn = if wide_w == FpWidth::F64 {
            Num::D(r)
        } else {
            Num::S(r as f32)
        };
        let operands = [Num::D(a), Num::D(b)];
        result_flags(Num::D(r), &operands, accumulate);
        if rn.is_infinite() && r.is_finite() {
            raise(FFLAG_OF | FFLAG_NX);
        }
        let value = if rn.is_nan() {
            wide_w.canonical_nan()
        } else {
            store(rn, wide_w)
        };
        hart.vregs.write_uint(vd, ix, wide, value);
        record_elem_flags(hart, ix, before);
    }
    hart.vregs
        .fill_tail(vd, vl, current_vlmax(hart), wide, tail);
    Ok(())
}

/// FP compares producing mask bits. flt/fle/fgt/fge signal on any
/// NaN; feq/fne only on signaling NaNs.
pub fn exec_cmp(hart: &mut Hart, instr: &VecInstr, op: FpCmpOp) -> Result<(), Exception> {
    let ctx = fp_ctx(hart, instr)?;
    check::require_aligned(ctx.vs2, ctx.lmul)?;
    check::check_masked_dest(ctx.vd, instr.masked)?;
    let mut sources = vec![(ctx.vs2, ctx.sew)];
    if instr.kinds[1] == OperandKind::VecReg {
        check::require_aligned(instr.vs1(), ctx.lmul)?;
        sources.push((instr.vs1(), ctx.sew));
    }
    check::check_masked_sources(&sources, instr.masked)?;

    let scalar = fp_scalar(hart, instr, ctx.w);
    for ix in ctx.vstart..ctx.vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            if ctx.inactive == ElemPolicy::AgnosticOnes {
                hart.vregs.write_mask_bit(ctx.vd, ix, true);
            }
            continue;
        }
        let a_bits = hart.vregs.read_uint(ctx.vs2, ix, ctx.sew);
        let b_bits = fp_src1(hart, instr, ix, ctx.w, scalar);
        let a_nan = is_nan_bits(a_bits, ctx.w);
        let b_nan = is_nan_bits(b_bits, ctx.w);
        let signaling = matches!(op, FpCmpOp::Flt | FpCmpOp::Fle | FpCmpOp::Fgt | FpCmpOp::Fge);
        if (signaling && (a_nan || b_nan))
            || is_snan_bits(a_bits, ctx.w)
            || is_snan_bits(b_bits, ctx.w)
        {
            raise(FFLAG_NV);
        }
        let bit = if a_nan || b_nan {
            // Unordered: only fne holds
            matches!(op, FpCmpOp::Fne)
        } else {
            let a = to_f64(a_bits, ctx.w);
            let b = to_f64(b_bits, ctx.w);
            match op {
                FpCmpOp::Feq => a == b,
                FpCmpOp::Fne => a != b,
                FpCmpOp::Flt => a < b,
                FpCmpOp::Fle => a <= b,
                FpCmpOp::Fgt => a > b,
                FpCmpOp::Fge => a >= b,
            }
        };
        hart.vregs.write_mask_bit(ctx.vd, ix, bit);
    }
    if ctx.tail == ElemPolicy::AgnosticOnes {
        hart.vregs.finalize_mask_tail(ctx.vd, ctx.vl);
    }
    Ok(())
}

/// vfmerge.vfm and vfmv.v.f.
pub fn exec_merge(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    let ctx = fp_ctx(hart, instr)?;
    check::require_aligned(ctx.vd, ctx.lmul)?;
    if instr.masked {
        if ctx.vd == 0 {
            return Err(Exception::IllegalInstruction);
        }
        check::require_aligned(ctx.vs2, ctx.lmul)?;
    }
    let scalar = fp_scalar(hart, instr, ctx.w);
    for ix in ctx.vstart..ctx.vl {
        let value = if !instr.masked || hart.vregs.read_mask_bit(0, ix) {
            scalar
        } else {
            hart.vregs.read_uint(ctx.vs2, ix, ctx.sew)
        };
        hart.vregs.write_uint(ctx.vd, ix, ctx.sew, value);
    }
    hart.vregs
        .fill_tail(ctx.vd, ctx.vl, current_vlmax(hart), ctx.sew, ctx.tail);
    Ok(())
}

/// Conversions between integer and FP, same width, widening and
/// narrowing, plus the bf16 pair.
pub fn exec_cvt(hart: &mut Hart, instr: &VecInstr, op: CvtOp) -> Result<(), Exception> {
    use CvtOp::*;
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let (inactive, tail) = policies(hart);

    let widening = matches!(op, WFToU | WFToI | WFToURtz | WFToIRtz | WUToF | WIToF | WFToF | WBf16ToF);
    let narrowing = matches!(
        op,
        NFToU | NFToI | NFToURtz | NFToIRtz | NUToF | NIToF | NFToF | NFToFRod | NFToBf16
    );

    let (src_eew, dst_eew) = if widening {
        if sew * 2 > 64 {
            return Err(Exception::IllegalInstruction);
        }
        (sew, sew * 2)
    } else if narrowing {
        if sew * 2 > 64 {
            return Err(Exception::IllegalInstruction);
        }
        (sew * 2, sew)
    } else {
        (sew, sew)
    };

    // The FP side of the conversion fixes which widths are legal
    let fp_src_w = match op {
        WBf16ToF => Some(FpWidth::Bf16),
        FToU | FToI | FToURtz | FToIRtz | WFToU | WFToI | WFToURtz | WFToIRtz | WFToF => {
            Some(FpWidth::from_sew(src_eew).ok_or(Exception::IllegalInstruction)?)
        }
        NFToU | NFToI | NFToURtz | NFToIRtz | NFToF | NFToFRod | NFToBf16 => {
            Some(FpWidth::from_sew(src_eew).ok_or(Exception::IllegalInstruction)?)
        }
        _ => None,
    };
    let fp_dst_w = match op {
        NFToBf16 => Some(FpWidth::Bf16),
        UToF | IToF | WUToF | WIToF | WFToF | NUToF | NIToF | NFToF | NFToFRod | WBf16ToF => {
            Some(FpWidth::from_sew(dst_eew).ok_or(Exception::IllegalInstruction)?)
        }
        _ => None,
    };

    let s_emul = lmul.emul(sew, src_eew).ok_or(Exception::IllegalInstruction)?;
    let d_emul = lmul.emul(sew, dst_eew).ok_or(Exception::IllegalInstruction)?;
    check::require_aligned(vd, d_emul)?;
    check::require_aligned(vs2, s_emul)?;
    check::check_masked_dest(vd, instr.masked)?;
    if widening {
        check::check_widen_overlap(vd, d_emul, vs2, s_emul)?;
    } else if narrowing {
        check::check_narrow_overlap(vd, d_emul, vs2, s_emul)?;
    }
    check::check_masked_sources(&[(vs2, src_eew)], instr.masked)?;

    let rtz = matches!(op, FToURtz | FToIRtz | WFToURtz | WFToIRtz | NFToURtz | NFToIRtz);
    let frm = if rtz { 1 } else { hart.csr.frm };
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);

    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, dst_eew, inactive);
            continue;
        }
        let before = peek_flags();
        let raw = hart.vregs.read_uint(vs2, ix, src_eew);
        let value = match op {
            FToU | FToURtz | WFToU | WFToURtz | NFToU | NFToURtz => {
                let w = fp_src_w.expect("fp source width");
                snan_flags(&[raw], w);
                f64_to_int(to_f64(raw, w), dst_eew, false, frm)
            }
            FToI | FToIRtz | WFToI | WFToIRtz | NFToI | NFToIRtz => {
                let w = fp_src_w.expect("fp source width");
                snan_flags(&[raw], w);
                f64_to_int(to_f64(raw, w), dst_eew, true, frm)
            }
            UToF | WUToF | NUToF => {
                let w = fp_dst_w.expect("fp destination width");
                let v = truncate(raw, src_eew) as f64;
                store_f64_checked(v, w)
            }
            IToF | WIToF | NIToF => {
                let w = fp_dst_w.expect("fp destination width");
                let v = to_signed(raw, src_eew) as f64;
                store_f64_checked(v, w)
            }
            WFToF | WBf16ToF => {
                let src_w = fp_src_w.expect("fp source width");
                let dst_w = fp_dst_w.expect("fp destination width");
                snan_flags(&[raw], src_w);
                if is_nan_bits(raw, src_w) {
                    dst_w.canonical_nan()
                } else {
                    store_f64_checked(to_f64(raw, src_w), dst_w)
                }
            }
            NFToF | NFToBf16 => {
                let src_w = fp_src_w.expect("fp source width");
                let dst_w = fp_dst_w.expect("fp destination width");
                snan_flags(&[raw], src_w);
                if is_nan_bits(raw, src_w) {
                    dst_w.canonical_nan()
                } else {
                    store_f64_checked(to_f64(raw, src_w), dst_w)
                }
            }
            NFToFRod => {
                let src_w = fp_src_w.expect("fp source width");
                snan_flags(&[raw], src_w);
                if is_nan_bits(raw, src_w) {
                    FpWidth::F32.canonical_nan()
                } else {
                    u64::from(f64_to_f32_rod(to_f64(raw, src_w)).to_bits())
                }
            }
            _ => unreachable!("conversion op"),
        };
        hart.vregs.write_uint(vd, ix, dst_eew, value);
        record_elem_flags(hart, ix, before);
    }
    hart.vregs
        .fill_tail(vd, vl, current_vlmax(hart), dst_eew, tail);
    Ok(())
}

/// Store an f64 at the given width, raising inexact when the value
/// does not round-trip.
fn store_f64_checked(value: f64, w: FpWidth) -> u64 {
    let out = match w {
        FpWidth::F64 => return value.to_bits(),
        FpWidth::F32 => {
            let narrowed = value as f32;
            if f64::from(narrowed) != value {
                raise(FFLAG_NX);
                if narrowed.is_infinite() && value.is_finite() {
                    raise(FFLAG_OF);
                }
            }
            u64::from(narrowed.to_bits())
        }
        FpWidth::F16 => u64::from(f32_to_f16(value as f32)),
        FpWidth::Bf16 => u64::from(f32_to_bf16(value as f32)),
    };
    out
}
