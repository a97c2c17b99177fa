//! Reduction engine
//!
//! Reductions scan the vector operand over the body, seeded by
//! element 0 of the scalar operand, and write element 0 of the
//! destination. Ordered FP sums fold strictly left to right;
//! unordered sums use the tree shape (adjacent pairs, then pairs
//! across register groups, the seed folded last). Integer reductions
//! are order-insensitive and fold sequentially. With no active
//! element, the unordered sums canonicalize to quiet NaN; every other
//! reduction returns the seed.

use crate::hart::{Exception, Hart};
use crate::instr::{ReduceOp, VecInstr};
use crate::utils::{to_signed, truncate};
use crate::vector::check;
use crate::vector::fp::{self, is_snan_bits, FpWidth, FFLAG_NV};
use crate::vector::policies;

fn fp_width(bits: u32) -> Result<FpWidth, Exception> {
    match bits {
        16 => Ok(FpWidth::F16),
        32 => Ok(FpWidth::F32),
        64 => Ok(FpWidth::F64),
        _ => Err(Exception::IllegalInstruction),
    }
}

fn fp_load(bits: u64, w: FpWidth) -> f64 {
    if is_snan_bits(bits, w) {
        fp::raise(FFLAG_NV);
    }
    match w {
        FpWidth::F16 => fp::f16_to_f32(bits as u16).into(),
        FpWidth::Bf16 => fp::bf16_to_f32(bits as u16).into(),
        FpWidth::F32 => f32::from_bits(bits as u32).into(),
        FpWidth::F64 => f64::from_bits(bits),
    }
}

fn fp_store(value: f64, w: FpWidth) -> u64 {
    if value.is_nan() {
        return w.canonical_nan();
    }
    match w {
        FpWidth::F16 => fp::f32_to_f16(value as f32).into(),
        FpWidth::Bf16 => fp::f32_to_bf16(value as f32).into(),
        FpWidth::F32 => u64::from((value as f32).to_bits()),
        FpWidth::F64 => value.to_bits(),
    }
}

/// Add at the element width: narrow sums round at each step.
fn fp_add(a: f64, b: f64, w: FpWidth) -> f64 {
    match w {
        FpWidth::F64 => a + b,
        _ => fp_load(fp_store(a + b, w), w),
    }
}

fn fp_min_max(a: f64, b: f64, is_min: bool) -> f64 {
    if a.is_nan() {
        return b;
    }
    if b.is_nan() {
        return a;
    }
    if a == 0.0 && b == 0.0 {
        let a_neg = a.is_sign_negative();
        return if is_min == a_neg { a } else { b };
    }
    if is_min {
        a.min(b)
    } else {
        a.max(b)
    }
}

pub fn exec(hart: &mut Hart, instr: &VecInstr, op: ReduceOp) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2(); // vector operand
    let vs1 = instr.vs1(); // seed operand, read at element 0

    check::check_vstart_zero(hart)?;
    check::require_aligned(vs2, lmul)?;

    let dest_eew = if op.widening() {
        if sew * 2 > 64 {
            return Err(Exception::IllegalInstruction);
        }
        sew * 2
    } else {
        sew
    };
    if op.is_fp() {
        fp_width(sew)?;
        if op.widening() {
            fp_width(dest_eew)?;
        }
    }

    let vl = hart.csr.vl;
    if vl == 0 {
        // Nothing to do; the destination is not updated
        return Ok(());
    }

    let seed = hart.vregs.read_uint(vs1, 0, dest_eew);
    let active: Vec<u64> = (0..vl)
        .filter(|&ix| hart.vregs.is_element_active(ix, instr.masked))
        .map(|ix| hart.vregs.read_uint(vs2, ix, sew))
        .collect();

    let result = if op.is_fp() {
        fp_reduce(op, seed, &active, sew, dest_eew)?
    } else {
        int_reduce(op, seed, &active, sew, dest_eew)
    };

    hart.vregs.write_uint(vd, 0, dest_eew, result);
    let (_, tail) = policies(hart);
    // The destination is a single element; everything above it in the
    // register is tail
    let dest_elems = u64::from(hart.config.vlen_bits / dest_eew);
    hart.vregs.fill_tail(vd, 1, dest_elems, dest_eew, tail);
    Ok(())
}

fn int_reduce(op: ReduceOp, seed: u64, active: &[u64], sew: u32, dest_eew: u32) -> u64 {
    let mut acc = seed;
    for &elem in active {
        acc = match op {
            ReduceOp::Sum => acc.wrapping_add(elem),
            ReduceOp::Maxu => truncate(acc, sew).max(truncate(elem, sew)),
            ReduceOp::Max => to_signed(acc, sew).max(to_signed(elem, sew)) as u64,
            ReduceOp::Minu => truncate(acc, sew).min(truncate(elem, sew)),
            ReduceOp::Min => to_signed(acc, sew).min(to_signed(elem, sew)) as u64,
            ReduceOp::And => acc & elem,
            ReduceOp::Or => acc | elem,
            ReduceOp::Xor => acc ^ elem,
            ReduceOp::Wsumu => truncate(acc, dest_eew).wrapping_add(truncate(elem, sew)),
            ReduceOp::Wsum => {
                (to_signed(acc, dest_eew).wrapping_add(to_signed(elem, sew))) as u64
            }
            _ => unreachable!("integer reduction"),
        };
    }
    acc
}

fn fp_reduce(
    op: ReduceOp,
    seed: u64,
    active: &[u64],
    sew: u32,
    dest_eew: u32,
) -> Result<u64, Exception> {
    let src_w = fp_width(sew)?;
    let dest_w = fp_width(dest_eew)?;
    let seed_v = fp_load(seed, dest_w);
    let result = match op {
        ReduceOp::FOsum | ReduceOp::FWOsum => {
            let mut acc = seed_v;
            for &bits in active {
                acc = fp_add(acc, fp_load(bits, src_w), dest_w);
            }
            acc
        }
        ReduceOp::FUsum | ReduceOp::FWUsum => {
            if active.is_empty() {
                // Tree-based unordered sum with no active element
                return Ok(dest_w.canonical_nan());
            }
            let mut level: Vec<f64> = active.iter().map(|&b| fp_load(b, src_w)).collect();
            while level.len() > 1 {
                let mut next = Vec::with_capacity(level.len() / 2 + 1);
                for pair in level.chunks(2) {
                    next.push(if pair.len() == 2 {
                        fp_add(pair[0], pair[1], dest_w)
                    } else {
                        pair[0]
                    });
                }
                level = next;
            }
            fp_add(level[0], seed_v, dest_w)
        }
        ReduceOp::FMin => {
            let mut acc = seed_v;
            for &bits in active {
                acc = fp_min_max(acc, fp_load(bits, src_w), true);
            }
            acc
        }
        ReduceOp::FMax => {
            let mut acc = seed_v;
            for &bits in active {
                acc = fp_min_max(acc, fp_load(bits, src_w), false);
            }
            acc
        }
        _ => unreachable!("fp reduction"),
    };
    Ok(fp_store(result, dest_w))
}
