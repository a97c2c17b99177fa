//! Permutation engine
//!
//! Register gather, compress, the slide family, the single-element
//! moves between vector and scalar registers, and whole-register
//! moves.

use crate::hart::{Exception, Hart};
use crate::instr::{GatherKind, OperandKind, SlideKind, VecInstr};
use crate::utils::{to_signed, truncate};
use crate::vector::check;
use crate::vector::{current_vlmax, policies, scalar_operand};

/// vrgather: vd[i] = vs2[index(i)], zero when the index is out of
/// range. The index source is vs1, a scalar, an immediate, or a
/// 16-bit index vector with its own effective multiplier.
pub fn exec_gather(hart: &mut Hart, instr: &VecInstr, kind: GatherKind) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();

    check::require_aligned(vd, lmul)?;
    check::require_aligned(vs2, lmul)?;
    check::check_masked_dest(vd, instr.masked)?;
    // The destination may never overlap a gather source
    check::check_no_overlap(vd, lmul.reg_count(), vs2, lmul.reg_count())?;

    let idx_reg = match kind {
        GatherKind::VV | GatherKind::EI16 => Some(instr.vs1()),
        _ => None,
    };
    let idx_eew = match kind {
        GatherKind::EI16 => 16,
        _ => sew,
    };
    let idx_emul = match kind {
        GatherKind::EI16 => lmul.emul(sew, 16).ok_or(Exception::IllegalInstruction)?,
        _ => lmul,
    };
    if let Some(reg) = idx_reg {
        check::require_aligned(reg, idx_emul)?;
        check::check_no_overlap(vd, lmul.reg_count(), reg, idx_emul.reg_count())?;
        check::check_masked_sources(&[(vs2, sew), (reg, idx_eew)], instr.masked)?;
    } else {
        check::check_masked_sources(&[(vs2, sew)], instr.masked)?;
    }

    let scalar = scalar_operand(hart, instr);
    let vlmax = current_vlmax(hart);
    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, sew, inactive);
            continue;
        }
        let index = match idx_reg {
            Some(reg) => hart.vregs.read_index(reg, ix, idx_eew),
            None => scalar,
        };
        let value = if index < vlmax {
            hart.vregs.read_uint(vs2, index, sew)
        } else {
            0
        };
        hart.vregs.write_uint(vd, ix, sew, value);
    }
    hart.vregs.fill_tail(vd, vl, vlmax, sew, tail);
    Ok(())
}

/// vcompress.vm: pack the elements of vs2 selected by the vs1 mask
/// into the front of vd.
pub fn exec_compress(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let mask_reg = instr.vs1();

    if instr.masked {
        return Err(Exception::IllegalInstruction);
    }
    check::check_vstart_zero(hart)?;
    check::require_aligned(vd, lmul)?;
    check::require_aligned(vs2, lmul)?;
    check::check_no_overlap(vd, lmul.reg_count(), vs2, lmul.reg_count())?;
    check::check_no_overlap(vd, lmul.reg_count(), mask_reg, 1)?;

    let (_, tail) = policies(hart);
    let vl = hart.csr.vl;
    let mut out = 0u64;
    for ix in 0..vl {
        if hart.vregs.read_mask_bit(mask_reg, ix) {
            let value = hart.vregs.read_uint(vs2, ix, sew);
            hart.vregs.write_uint(vd, out, sew, value);
            out += 1;
        }
    }
    hart.vregs.fill_tail(vd, out, current_vlmax(hart), sew, tail);
    Ok(())
}

/// The slide family. Slide amounts come from the scalar operand
/// (unsigned); the single-element slides insert the scalar at the
/// vacated end.
pub fn exec_slide(hart: &mut Hart, instr: &VecInstr, kind: SlideKind) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();

    check::require_aligned(vd, lmul)?;
    check::require_aligned(vs2, lmul)?;
    check::check_masked_dest(vd, instr.masked)?;
    check::check_masked_sources(&[(vs2, sew)], instr.masked)?;
    if matches!(kind, SlideKind::Up | SlideKind::Up1 | SlideKind::FUp1) {
        // Slide-up reads backward; the destination may not overlap
        // the source
        check::check_no_overlap(vd, lmul.reg_count(), vs2, lmul.reg_count())?;
    }

    let scalar = match kind {
        SlideKind::FUp1 | SlideKind::FDown1 => {
            if instr.kinds[1] == OperandKind::FpReg {
                hart.fregs.read_boxed(instr.rs1(), sew)
            } else {
                0
            }
        }
        _ => scalar_operand(hart, instr),
    };
    let amount = match kind {
        SlideKind::Up | SlideKind::Down => scalar,
        _ => 1,
    };

    let vlmax = current_vlmax(hart);
    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    match kind {
        SlideKind::Up | SlideKind::Up1 | SlideKind::FUp1 => {
            let insert_scalar = kind != SlideKind::Up;
            for ix in vstart..vl {
                if ix < amount && !insert_scalar {
                    // Below the slide amount the destination is
                    // untouched
                    continue;
                }
                if !hart.vregs.is_element_active(ix, instr.masked) {
                    if ix >= amount || insert_scalar {
                        hart.vregs.write_inactive(vd, ix, sew, inactive);
                    }
                    continue;
                }
                let value = if ix < amount {
                    scalar
                } else {
                    hart.vregs.read_uint(vs2, ix - amount, sew)
                };
                hart.vregs.write_uint(vd, ix, sew, value);
            }
        }
        SlideKind::Down | SlideKind::Down1 | SlideKind::FDown1 => {
            let insert_scalar = kind != SlideKind::Down;
            for ix in vstart..vl {
                if !hart.vregs.is_element_active(ix, instr.masked) {
                    hart.vregs.write_inactive(vd, ix, sew, inactive);
                    continue;
                }
                let src = ix + amount;
                let value = if insert_scalar && ix == vl - 1 {
                    scalar
                } else if src < vlmax {
                    hart.vregs.read_uint(vs2, src, sew)
                } else {
                    0
                };
                hart.vregs.write_uint(vd, ix, sew, value);
            }
        }
    }
    hart.vregs.fill_tail(vd, vl, vlmax, sew, tail);
    Ok(())
}

/// vmv.x.s: element 0 sign-extended into the integer register,
/// regardless of vl.
pub fn exec_mv_xs(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let value = hart.vregs.read_uint(instr.vs2(), 0, sew);
    hart.set_x(instr.rd(), to_signed(value, sew) as u64);
    Ok(())
}

/// vmv.s.x: write element 0; a no-op when vl is zero.
pub fn exec_mv_sx(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    if hart.csr.vl == 0 {
        return Ok(());
    }
    let sew = hart.csr.vtype.sew.bits();
    let value = hart.x(instr.rs1());
    hart.vregs.write_uint(instr.vd(), 0, sew, value);
    let (_, tail) = policies(hart);
    let dest_elems = u64::from(hart.config.vlen_bits / sew);
    hart.vregs.fill_tail(instr.vd(), 1, dest_elems, sew, tail);
    Ok(())
}

/// vfmv.f.s: element 0 NaN-boxed into the FP register.
pub fn exec_fmv_fs(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    if !matches!(sew, 16 | 32 | 64) {
        return Err(Exception::IllegalInstruction);
    }
    let value = hart.vregs.read_uint(instr.vs2(), 0, sew);
    hart.fregs.write_boxed(instr.rd(), sew, value);
    Ok(())
}

/// vfmv.s.f: write element 0 from the FP register.
pub fn exec_fmv_sf(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    if !matches!(sew, 16 | 32 | 64) {
        return Err(Exception::IllegalInstruction);
    }
    if hart.csr.vl == 0 {
        return Ok(());
    }
    let value = hart.fregs.read_boxed(instr.rs1(), sew);
    hart.vregs.write_uint(instr.vd(), 0, sew, truncate(value, sew));
    let (_, tail) = policies(hart);
    let dest_elems = u64::from(hart.config.vlen_bits / sew);
    hart.vregs.fill_tail(instr.vd(), 1, dest_elems, sew, tail);
    Ok(())
}

/// vmv<n>r.v: verbatim copy of 1, 2, 4 or 8 registers.
pub fn exec_whole_move(hart: &mut Hart, instr: &VecInstr, nregs: u8) -> Result<(), Exception> {
    let n = u32::from(nregs);
    if !matches!(n, 1 | 2 | 4 | 8) {
        return Err(Exception::IllegalInstruction);
    }
    let vd = instr.vd();
    let vs2 = instr.vs2();
    if vd % n != 0 || vs2 % n != 0 || vd + n > 32 || vs2 + n > 32 {
        return Err(Exception::IllegalInstruction);
    }
    if vd != vs2 {
        hart.vregs.copy_regs(vd, vs2, n);
    }
    Ok(())
}
