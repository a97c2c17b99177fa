//! Mask-register operations
//!
//! The eight mask-logical forms over whole mask registers, and the
//! traversal helpers: population count, find-first, set-before/
//! including/only-first, iota prefix counts and element id. Mask
//! operands live one bit per element in a single register regardless
//! of LMUL.

use crate::hart::{Exception, Hart};
use crate::instr::{MaskBitOp, MaskScanOp, VecInstr};
use crate::vector::check;
use crate::vector::regs::ElemPolicy;
use crate::vector::{current_vlmax, policies};

/// vmand/vmnand/vmor/vmnor/vmxor/vmxnor/vmandn/vmorn. Always
/// unmasked; the element count comes from vl unless the hart is
/// configured to update the whole mask register.
pub fn exec_logical(hart: &mut Hart, instr: &VecInstr, op: MaskBitOp) -> Result<(), Exception> {
    if instr.masked {
        return Err(Exception::IllegalInstruction);
    }
    let vd = instr.vd();
    let vs1 = instr.vs1();
    let vs2 = instr.vs2();

    let bits = if hart.config.update_whole_mask {
        u64::from(hart.config.vlen_bits)
    } else {
        hart.csr.vl
    };
    let (_, tail) = policies(hart);
    for ix in hart.csr.vstart..bits {
        let a = hart.vregs.read_mask_bit(vs2, ix);
        let b = hart.vregs.read_mask_bit(vs1, ix);
        let bit = match op {
            MaskBitOp::And => a & b,
            MaskBitOp::Nand => !(a & b),
            MaskBitOp::Or => a | b,
            MaskBitOp::Nor => !(a | b),
            MaskBitOp::Xor => a ^ b,
            MaskBitOp::Xnor => !(a ^ b),
            MaskBitOp::Andn => a & !b,
            MaskBitOp::Orn => a | !b,
        };
        hart.vregs.write_mask_bit(vd, ix, bit);
    }
    if !hart.config.update_whole_mask && tail == ElemPolicy::AgnosticOnes {
        hart.vregs.finalize_mask_tail(vd, bits);
    }
    Ok(())
}

pub fn exec_scan(hart: &mut Hart, instr: &VecInstr, op: MaskScanOp) -> Result<(), Exception> {
    check::check_vstart_zero(hart)?;
    match op {
        MaskScanOp::Cpop => {
            let vs2 = instr.vs2();
            let count = (0..hart.csr.vl)
                .filter(|&ix| {
                    hart.vregs.is_element_active(ix, instr.masked)
                        && hart.vregs.read_mask_bit(vs2, ix)
                })
                .count() as u64;
            hart.set_x(instr.rd(), count);
            Ok(())
        }
        MaskScanOp::First => {
            let vs2 = instr.vs2();
            let first = (0..hart.csr.vl).find(|&ix| {
                hart.vregs.is_element_active(ix, instr.masked) && hart.vregs.read_mask_bit(vs2, ix)
            });
            let value = match first {
                Some(ix) => ix,
                None => -1i64 as u64,
            };
            hart.set_x(instr.rd(), value);
            Ok(())
        }
        MaskScanOp::Sbf | MaskScanOp::Sif | MaskScanOp::Sof => exec_set_first(hart, instr, op),
        MaskScanOp::Iota => exec_iota(hart, instr),
        MaskScanOp::Id => exec_id(hart, instr),
    }
}

/// vmsbf/vmsif/vmsof: walk the active bits of the source, flipping at
/// the first set bit.
fn exec_set_first(hart: &mut Hart, instr: &VecInstr, op: MaskScanOp) -> Result<(), Exception> {
    let vd = instr.vd();
    let vs2 = instr.vs2();
    check::check_masked_dest(vd, instr.masked)?;
    if vd == vs2 {
        return Err(Exception::IllegalInstruction);
    }

    let (inactive, tail) = policies(hart);
    let mut seen = false;
    for ix in 0..hart.csr.vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            if inactive == ElemPolicy::AgnosticOnes {
                hart.vregs.write_mask_bit(vd, ix, true);
            }
            continue;
        }
        let src = hart.vregs.read_mask_bit(vs2, ix);
        let bit = match op {
            MaskScanOp::Sbf => !seen && !src,
            MaskScanOp::Sif => !seen,
            MaskScanOp::Sof => !seen && src,
            _ => unreachable!("set-first op"),
        };
        if src {
            seen = true;
        }
        hart.vregs.write_mask_bit(vd, ix, bit);
    }
    if tail == ElemPolicy::AgnosticOnes {
        hart.vregs.finalize_mask_tail(vd, hart.csr.vl);
    }
    Ok(())
}

/// viota.m: prefix count of set source bits.
fn exec_iota(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    check::require_aligned(vd, lmul)?;
    check::check_masked_dest(vd, instr.masked)?;
    // The source is a mask register; the destination group may not
    // overlap it or the mask
    check::check_no_overlap(vd, lmul.reg_count(), vs2, 1)?;
    if instr.masked {
        check::check_no_overlap(vd, lmul.reg_count(), 0, 1)?;
    }

    let (inactive, tail) = policies(hart);
    let mut count: u64 = 0;
    let vl = hart.csr.vl;
    for ix in 0..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, sew, inactive);
            continue;
        }
        hart.vregs.write_uint(vd, ix, sew, count);
        if hart.vregs.read_mask_bit(vs2, ix) {
            count += 1;
        }
    }
    hart.vregs.fill_tail(vd, vl, current_vlmax(hart), sew, tail);
    Ok(())
}

/// vid.v: element indices.
fn exec_id(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    check::require_aligned(vd, lmul)?;
    check::check_masked_dest(vd, instr.masked)?;

    let (inactive, tail) = policies(hart);
    let vl = hart.csr.vl;
    for ix in 0..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, sew, inactive);
            continue;
        }
        hart.vregs.write_uint(vd, ix, sew, ix);
    }
    hart.vregs.fill_tail(vd, vl, current_vlmax(hart), sew, tail);
    Ok(())
}
