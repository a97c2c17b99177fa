//! Operand legality checking
//!
//! The gatekeeper every vector instruction passes before touching
//! architectural state. Each function validates one rule group and
//! returns an illegal-instruction exception on violation; the engines
//! run all applicable checks before their element loops so that a
//! failing instruction leaves registers, memory and CSRs (other than
//! the preserved vstart) untouched.

use crate::hart::csr::VsMode;
use crate::hart::{Exception, Hart};
use crate::instr::{VecInstr, VecOp};
use crate::vector::vtype::{vlmax, Lmul};

/// Whole-register moves and whole-register loads/stores do not depend
/// on vtype and may be exempt from the vill check.
fn ignores_vtype(op: &VecOp) -> bool {
    use crate::instr::AddrPattern;
    match op {
        VecOp::WholeMove { .. } => true,
        VecOp::Load(access) | VecOp::Store(access) => {
            matches!(access.pattern, AddrPattern::WholeReg { .. })
        }
        _ => false,
    }
}

/// The checks common to every vector instruction: the extension must
/// be enabled, the type configuration legal, and vstart within the
/// configuration when strict checking is on.
pub fn check_common(hart: &Hart, instr: &VecInstr) -> Result<(), Exception> {
    if hart.csr.effective_vs() == VsMode::Off {
        return Err(Exception::IllegalInstruction);
    }
    if hart.csr.vtype.vill {
        let exempt = hart.config.vill_whole_reg_ops_ok && ignores_vtype(&instr.op);
        if !exempt {
            return Err(Exception::IllegalInstruction);
        }
    }
    if hart.config.strict_vstart && !ignores_vtype(&instr.op) {
        let vtype = hart.csr.vtype;
        if !vtype.vill {
            let max = vlmax(hart.config.vlen_bits, vtype.sew.bits(), vtype.lmul);
            if hart.csr.vstart > max {
                return Err(Exception::IllegalInstruction);
            }
        }
    }
    Ok(())
}

/// Operand register numbers must be multiples of the effective group
/// multiplier (1 when the multiplier is fractional), and the group
/// must fit in the register file.
pub fn require_aligned(reg: u32, emul: Lmul) -> Result<(), Exception> {
    if reg % emul.alignment() != 0 || reg + emul.reg_count() > 32 {
        return Err(Exception::IllegalInstruction);
    }
    Ok(())
}

/// A masked instruction may not write its result over the mask:
/// the destination of a masked instruction must not be v0.
pub fn check_masked_dest(vd: u32, masked: bool) -> Result<(), Exception> {
    if masked && vd == 0 {
        return Err(Exception::IllegalInstruction);
    }
    Ok(())
}

/// A masked instruction may not source v0 at a non-mask element
/// width. `eew_bits == 1` marks a mask-layout operand, which is
/// allowed.
pub fn check_masked_sources(sources: &[(u32, u32)], masked: bool) -> Result<(), Exception> {
    if masked {
        for &(reg, eew_bits) in sources {
            if reg == 0 && eew_bits != 1 {
                return Err(Exception::IllegalInstruction);
            }
        }
    }
    Ok(())
}

fn groups_overlap(a: u32, a_regs: u32, b: u32, b_regs: u32) -> bool {
    a < b + b_regs && b < a + a_regs
}

/// Destination/source overlap for a widening operand pair
/// (EEW_d > EEW_s): overlap is permitted only when the source sits at
/// the top of the destination group, i.e. src == dest + g_d - g_s.
pub fn check_widen_overlap(vd: u32, d_emul: Lmul, vs: u32, s_emul: Lmul) -> Result<(), Exception> {
    let g_d = d_emul.reg_count();
    let g_s = s_emul.reg_count();
    if groups_overlap(vd, g_d, vs, g_s) && vs != vd + g_d - g_s {
        return Err(Exception::IllegalInstruction);
    }
    Ok(())
}

/// Destination/source overlap for a narrowing operand pair
/// (EEW_d < EEW_s): overlap is permitted only at the first source
/// register, i.e. src == dest.
pub fn check_narrow_overlap(vd: u32, d_emul: Lmul, vs: u32, s_emul: Lmul) -> Result<(), Exception> {
    let g_d = d_emul.reg_count();
    let g_s = s_emul.reg_count();
    if groups_overlap(vd, g_d, vs, g_s) && vs != vd {
        return Err(Exception::IllegalInstruction);
    }
    Ok(())
}

/// No overlap at all between destination and source groups (gather,
/// slide-up, compress, indexed-load index operand at a different
/// width).
pub fn check_no_overlap(vd: u32, d_regs: u32, vs: u32, s_regs: u32) -> Result<(), Exception> {
    if groups_overlap(vd, d_regs, vs, s_regs) {
        return Err(Exception::IllegalInstruction);
    }
    Ok(())
}

/// Reductions require vstart == 0.
pub fn check_vstart_zero(hart: &Hart) -> Result<(), Exception> {
    if hart.csr.vstart != 0 {
        return Err(Exception::IllegalInstruction);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{IntOp, MemAccess, AddrPattern};
    use crate::vector::VecConfig;

    fn hart() -> Hart {
        Hart::new(VecConfig::default(), 0x10_0000)
    }

    #[test]
    fn check_vs_off_rejected() {
        let mut hart = hart();
        hart.csr.vs = VsMode::Off;
        let instr = VecInstr::vv(VecOp::Int(IntOp::Add), 2, 1, 3);
        assert_eq!(
            check_common(&hart, &instr),
            Err(Exception::IllegalInstruction)
        );
    }

    #[test]
    fn check_vill_rejected_except_whole_reg_ops() {
        let mut hart = hart();
        hart.csr.vtype.vill = true;
        let add = VecInstr::vv(VecOp::Int(IntOp::Add), 2, 1, 3);
        assert!(check_common(&hart, &add).is_err());
        let whole = VecInstr::v(VecOp::WholeMove { nregs: 1 }, 2, 1);
        assert!(check_common(&hart, &whole).is_ok());
        let wload = VecInstr::load(
            MemAccess {
                pattern: AddrPattern::WholeReg { nregs: 2 },
                eew_bits: 8,
            },
            2,
            10,
            0,
        );
        assert!(check_common(&hart, &wload).is_ok());
        hart.config.vill_whole_reg_ops_ok = false;
        assert!(check_common(&hart, &whole).is_err());
    }

    #[test]
    fn check_strict_vstart() {
        let mut hart = hart();
        hart.csr.vtype = crate::vector::vtype::VType::decode(2 << 3, 128); // e32 m1
        hart.csr.vstart = 5; // vlmax is 4
        let instr = VecInstr::vv(VecOp::Int(IntOp::Add), 2, 1, 3);
        assert!(check_common(&hart, &instr).is_ok());
        hart.config.strict_vstart = true;
        assert!(check_common(&hart, &instr).is_err());
    }

    #[test]
    fn check_register_alignment() {
        assert!(require_aligned(2, Lmul::M2).is_ok());
        assert!(require_aligned(3, Lmul::M2).is_err());
        assert!(require_aligned(4, Lmul::M4).is_ok());
        assert!(require_aligned(6, Lmul::M4).is_err());
        // Fractional multipliers require no alignment
        assert!(require_aligned(7, Lmul::F2).is_ok());
        // Group must fit in the file
        assert!(require_aligned(28, Lmul::M8).is_err());
        assert!(require_aligned(24, Lmul::M8).is_ok());
    }

    #[test]
    fn check_masked_rules() {
        assert!(check_masked_dest(0, true).is_err());
        assert!(check_masked_dest(0, false).is_ok());
        assert!(check_masked_dest(1, true).is_ok());
        assert!(check_masked_sources(&[(0, 32)], true).is_err());
        assert!(check_masked_sources(&[(0, 1)], true).is_ok());
        assert!(check_masked_sources(&[(0, 32)], false).is_ok());
        assert!(check_masked_sources(&[(4, 32)], true).is_ok());
    }

    #[test]
    fn check_widen_overlap_rule() {
        // dest group v4 (m2), source v5 (m1): top of the group, allowed
        assert!(check_widen_overlap(4, Lmul::M2, 5, Lmul::M1).is_ok());
        // source v4: bottom of the group, not allowed
        assert!(check_widen_overlap(4, Lmul::M2, 4, Lmul::M1).is_err());
        // disjoint, allowed
        assert!(check_widen_overlap(4, Lmul::M2, 8, Lmul::M1).is_ok());
    }

    #[test]
    fn check_narrow_overlap_rule() {
        // dest v4 (m1) over source group v4 (m2): first register, allowed
        assert!(check_narrow_overlap(4, Lmul::M1, 4, Lmul::M2).is_ok());
        // dest v5 over source group v4..v5: not the first register
        assert!(check_narrow_overlap(5, Lmul::M1, 4, Lmul::M2).is_err());
        assert!(check_narrow_overlap(8, Lmul::M1, 4, Lmul::M2).is_ok());
    }

    #[test]
    fn check_disjoint_rule() {
        assert!(check_no_overlap(4, 2, 5, 1).is_err());
        assert!(check_no_overlap(4, 2, 6, 2).is_ok());
        assert!(check_no_overlap(6, 2, 4, 2).is_ok());
        assert!(check_no_overlap(4, 1, 4, 1).is_err());
    }

    #[test]
    fn check_vstart_zero_rule() {
        let mut hart = hart();
        assert!(check_vstart_zero(&hart).is_ok());
        hart.csr.vstart = 1;
        assert!(check_vstart_zero(&hart).is_err());
    }
}
