//! Integer arithmetic engine
//!
//! Single-width binary and ternary operations, the widening and
//! narrowing families, integer extension, the carry/borrow family,
//! compares producing mask bits, and merge/broadcast. Every loop
//! follows the same shape: legality checks first, then one pass over
//! the body `[vstart, vl)` with the masked-off policy applied to
//! inactive lanes, then the tail policy over `[vl, vlmax)`.
//!
//! Element values travel as raw u64 lanes; signedness is applied at
//! the operation through [`crate::utils::to_signed`], and widening
//! intermediates use 128-bit arithmetic.

use crate::hart::{Exception, Hart};
use crate::instr::{CarryOp, CmpOp, ExtKind, IntOp, NarrowShiftOp, OperandKind, VecInstr, WidenOp};
use crate::utils::{to_signed, truncate};
use crate::vector::check;
use crate::vector::regs::ElemPolicy;
use crate::vector::vtype::Lmul;
use crate::vector::{current_vlmax, policies, scalar_operand};

/// The second source of a binary op: a vector register or a scalar
/// (register or immediate) broadcast.
pub(crate) enum Src1 {
    Vec(u32),
    Scalar(u64),
}

impl Src1 {
    pub(crate) fn of(hart: &Hart, instr: &VecInstr) -> Self {
        match instr.kinds[1] {
            OperandKind::VecReg => Src1::Vec(instr.vs1()),
            _ => Src1::Scalar(scalar_operand(hart, instr)),
        }
    }

    pub(crate) fn read(&self, hart: &Hart, ix: u64, eew_bits: u32) -> u64 {
        match self {
            Src1::Vec(reg) => hart.vregs.read_uint(*reg, ix, eew_bits),
            Src1::Scalar(value) => *value,
        }
    }

    fn emul(&self, emul: Lmul) -> Option<(u32, Lmul)> {
        match self {
            Src1::Vec(reg) => Some((*reg, emul)),
            Src1::Scalar(_) => None,
        }
    }
}

fn signed_min(sew: u32) -> i64 {
    -(1i64 << (sew - 1))
}

/// Single-width binary loop; `f(vs2_elem, src1_elem) -> result`.
fn binary_loop(
    hart: &mut Hart,
    instr: &VecInstr,
    f: impl Fn(u64, u64) -> u64,
) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let src1 = Src1::of(hart, instr);

    check::require_aligned(vd, lmul)?;
    check::require_aligned(vs2, lmul)?;
    check::check_masked_dest(vd, instr.masked)?;
    let mut sources = vec![(vs2, sew)];
    if let Some((reg, emul)) = src1.emul(lmul) {
        check::require_aligned(reg, emul)?;
        sources.push((reg, sew));
    }
    check::check_masked_sources(&sources, instr.masked)?;

    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, sew, inactive);
            continue;
        }
        let a = hart.vregs.read_uint(vs2, ix, sew);
        let b = src1.read(hart, ix, sew);
        hart.vregs.write_uint(vd, ix, sew, f(a, b));
    }
    hart.vregs.fill_tail(vd, vl, current_vlmax(hart), sew, tail);
    Ok(())
}

/// Multiply-add loop; `f(vs2_elem, src1_elem, vd_elem) -> result`.
fn ternary_loop(
    hart: &mut Hart,
    instr: &VecInstr,
    f: impl Fn(u64, u64, u64) -> u64,
) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let src1 = Src1::of(hart, instr);

    check::require_aligned(vd, lmul)?;
    check::require_aligned(vs2, lmul)?;
    check::check_masked_dest(vd, instr.masked)?;
    let mut sources = vec![(vs2, sew)];
    if let Some((reg, emul)) = src1.emul(lmul) {
        check::require_aligned(reg, emul)?;
        sources.push((reg, sew));
    }
    check::check_masked_sources(&sources, instr.masked)?;

    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, sew, inactive);
            continue;
        }
        let a = hart.vregs.read_uint(vs2, ix, sew);
        let b = src1.read(hart, ix, sew);
        let d = hart.vregs.read_uint(vd, ix, sew);
        hart.vregs.write_uint(vd, ix, sew, f(a, b, d));
    }
    hart.vregs.fill_tail(vd, vl, current_vlmax(hart), sew, tail);
    Ok(())
}

pub fn exec_int(hart: &mut Hart, instr: &VecInstr, op: IntOp) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let shamt_mask = u64::from(sew) - 1;
    match op {
        IntOp::Add => binary_loop(hart, instr, |a, b| a.wrapping_add(b)),
        IntOp::Sub => binary_loop(hart, instr, |a, b| a.wrapping_sub(b)),
        IntOp::Rsub => binary_loop(hart, instr, |a, b| b.wrapping_sub(a)),
        IntOp::And => binary_loop(hart, instr, |a, b| a & b),
        IntOp::Or => binary_loop(hart, instr, |a, b| a | b),
        IntOp::Xor => binary_loop(hart, instr, |a, b| a ^ b),
        IntOp::Sll => binary_loop(hart, instr, move |a, b| a << (b & shamt_mask)),
        IntOp::Srl => binary_loop(hart, instr, move |a, b| {
            truncate(a, sew) >> (b & shamt_mask)
        }),
        IntOp::Sra => binary_loop(hart, instr, move |a, b| {
            (to_signed(a, sew) >> (b & shamt_mask)) as u64
        }),
        IntOp::Minu => binary_loop(hart, instr, move |a, b| {
            truncate(a, sew).min(truncate(b, sew))
        }),
        IntOp::Min => binary_loop(hart, instr, move |a, b| {
            to_signed(a, sew).min(to_signed(b, sew)) as u64
        }),
        IntOp::Maxu => binary_loop(hart, instr, move |a, b| {
            truncate(a, sew).max(truncate(b, sew))
        }),
        IntOp::Max => binary_loop(hart, instr, move |a, b| {
            to_signed(a, sew).max(to_signed(b, sew)) as u64
        }),
        IntOp::Mul => binary_loop(hart, instr, |a, b| a.wrapping_mul(b)),
        IntOp::Mulh => binary_loop(hart, instr, move |a, b| {
            ((i128::from(to_signed(a, sew)) * i128::from(to_signed(b, sew))) >> sew) as u64
        }),
        IntOp::Mulhu => binary_loop(hart, instr, move |a, b| {
            ((u128::from(truncate(a, sew)) * u128::from(truncate(b, sew))) >> sew) as u64
        }),
        IntOp::Mulhsu => binary_loop(hart, instr, move |a, b| {
            // signed vs2 times unsigned vs1
            ((i128::from(to_signed(a, sew)) * i128::from(truncate(b, sew))) >> sew) as u64
        }),
        IntOp::Divu => binary_loop(hart, instr, move |a, b| {
            let (a, b) = (truncate(a, sew), truncate(b, sew));
            if b == 0 {
                !0
            } else {
                a / b
            }
        }),
        IntOp::Div => binary_loop(hart, instr, move |a, b| {
            let (a, b) = (to_signed(a, sew), to_signed(b, sew));
            if b == 0 {
                !0u64
            } else if a == signed_min(sew) && b == -1 {
                a as u64
            } else {
                (a / b) as u64
            }
        }),
        IntOp::Remu => binary_loop(hart, instr, move |a, b| {
            let (a, b) = (truncate(a, sew), truncate(b, sew));
            if b == 0 {
                a
            } else {
                a % b
            }
        }),
        IntOp::Rem => binary_loop(hart, instr, move |a, b| {
            let (a, b) = (to_signed(a, sew), to_signed(b, sew));
            if b == 0 {
                a as u64
            } else if a == signed_min(sew) && b == -1 {
                0
            } else {
                (a % b) as u64
            }
        }),
        IntOp::Macc => ternary_loop(hart, instr, |a, b, d| b.wrapping_mul(a).wrapping_add(d)),
        IntOp::Nmsac => ternary_loop(hart, instr, |a, b, d| d.wrapping_sub(b.wrapping_mul(a))),
        IntOp::Madd => ternary_loop(hart, instr, |a, b, d| b.wrapping_mul(d).wrapping_add(a)),
        IntOp::Nmsub => ternary_loop(hart, instr, |a, b, d| a.wrapping_sub(b.wrapping_mul(d))),
    }
}

/// Widening operations: the destination group is at 2x SEW and the
/// doubled group multiplier.
pub fn exec_widen(hart: &mut Hart, instr: &VecInstr, op: WidenOp) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let wide = sew * 2;
    if wide > 64 {
        return Err(Exception::IllegalInstruction);
    }
    let lmul = hart.csr.vtype.lmul;
    let d_emul = lmul.emul(sew, wide).ok_or(Exception::IllegalInstruction)?;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let src1 = Src1::of(hart, instr);

    // The W-suffixed variants read a wide first source.
    let wide_vs2 = matches!(
        op,
        WidenOp::WadduW | WidenOp::WaddW | WidenOp::WsubuW | WidenOp::WsubW
    );
    let vs2_eew = if wide_vs2 { wide } else { sew };
    let vs2_emul = if wide_vs2 { d_emul } else { lmul };

    check::require_aligned(vd, d_emul)?;
    check::require_aligned(vs2, vs2_emul)?;
    check::check_masked_dest(vd, instr.masked)?;
    let mut sources = vec![(vs2, vs2_eew)];
    if !wide_vs2 {
        check::check_widen_overlap(vd, d_emul, vs2, lmul)?;
    }
    if let Some((reg, emul)) = src1.emul(lmul) {
        check::require_aligned(reg, emul)?;
        check::check_widen_overlap(vd, d_emul, reg, lmul)?;
        sources.push((reg, sew));
    }
    check::check_masked_sources(&sources, instr.masked)?;

    let accumulate = matches!(
        op,
        WidenOp::Wmaccu | WidenOp::Wmacc | WidenOp::Wmaccsu | WidenOp::Wmaccus
    );

    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, wide, inactive);
            continue;
        }
        let a = hart.vregs.read_uint(vs2, ix, vs2_eew);
        let b = src1.read(hart, ix, sew);
        let a_s = i128::from(to_signed(a, vs2_eew));
        let a_u = i128::from(truncate(a, vs2_eew));
        let b_s = i128::from(to_signed(b, sew));
        let b_u = i128::from(truncate(b, sew));
        let value = match op {
            WidenOp::Waddu => a_u + b_u,
            WidenOp::Wadd => a_s + b_s,
            WidenOp::Wsubu => a_u - b_u,
            WidenOp::Wsub => a_s - b_s,
            WidenOp::WadduW => a_u + b_u,
            WidenOp::WaddW => a_s + b_s,
            WidenOp::WsubuW => a_u - b_u,
            WidenOp::WsubW => a_s - b_s,
            WidenOp::Wmul => a_s * b_s,
            WidenOp::Wmulu => a_u * b_u,
            WidenOp::Wmulsu => a_s * b_u,
            WidenOp::Wmaccu => a_u * b_u,
            WidenOp::Wmacc => a_s * b_s,
            WidenOp::Wmaccsu => b_s * a_u,
            WidenOp::Wmaccus => b_u * a_s,
        };
        let value = if accumulate {
            let d = hart.vregs.read_uint(vd, ix, wide);
            (value + i128::from(d)) as u64
        } else {
            value as u64
        };
        hart.vregs.write_uint(vd, ix, wide, value);
    }
    hart.vregs
        .fill_tail(vd, vl, current_vlmax(hart), wide, tail);
    Ok(())
}

/// Narrowing shifts: the source group is at 2x SEW.
pub fn exec_narrow_shift(
    hart: &mut Hart,
    instr: &VecInstr,
    op: NarrowShiftOp,
) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let wide = sew * 2;
    if wide > 64 {
        return Err(Exception::IllegalInstruction);
    }
    let lmul = hart.csr.vtype.lmul;
    let s_emul = lmul.emul(sew, wide).ok_or(Exception::IllegalInstruction)?;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let src1 = Src1::of(hart, instr);

    check::require_aligned(vd, lmul)?;
    check::require_aligned(vs2, s_emul)?;
    check::check_masked_dest(vd, instr.masked)?;
    check::check_narrow_overlap(vd, lmul, vs2, s_emul)?;
    let mut sources = vec![(vs2, wide)];
    if let Some((reg, emul)) = src1.emul(lmul) {
        check::require_aligned(reg, emul)?;
        sources.push((reg, sew));
    }
    check::check_masked_sources(&sources, instr.masked)?;

    let shamt_mask = u64::from(wide) - 1;
    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, sew, inactive);
            continue;
        }
        let a = hart.vregs.read_uint(vs2, ix, wide);
        let shamt = src1.read(hart, ix, sew) & shamt_mask;
        let value = match op {
            NarrowShiftOp::Nsrl => truncate(a, wide) >> shamt,
            NarrowShiftOp::Nsra => (to_signed(a, wide) >> shamt) as u64,
        };
        hart.vregs.write_uint(vd, ix, sew, value);
    }
    hart.vregs.fill_tail(vd, vl, current_vlmax(hart), sew, tail);
    Ok(())
}

/// vzext/vsext: the source is at SEW divided by the ratio.
pub fn exec_ext(hart: &mut Hart, instr: &VecInstr, kind: ExtKind) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    if sew / kind.ratio() < 8 {
        return Err(Exception::IllegalInstruction);
    }
    let src_eew = sew / kind.ratio();
    let lmul = hart.csr.vtype.lmul;
    let s_emul = lmul
        .emul(sew, src_eew)
        .ok_or(Exception::IllegalInstruction)?;
    let vd = instr.vd();
    let vs2 = instr.vs2();

    check::require_aligned(vd, lmul)?;
    check::require_aligned(vs2, s_emul)?;
    check::check_masked_dest(vd, instr.masked)?;
    check::check_widen_overlap(vd, lmul, vs2, s_emul)?;
    check::check_masked_sources(&[(vs2, src_eew)], instr.masked)?;

    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, sew, inactive);
            continue;
        }
        let a = hart.vregs.read_uint(vs2, ix, src_eew);
        let value = if kind.signed() {
            to_signed(a, src_eew) as u64
        } else {
            truncate(a, src_eew)
        };
        hart.vregs.write_uint(vd, ix, sew, value);
    }
    hart.vregs.fill_tail(vd, vl, current_vlmax(hart), sew, tail);
    Ok(())
}

/// vadc/vsbc/vmadc/vmsbc. The carry operand is always v0; the
/// value-producing forms are reserved unmasked and may not write v0.
pub fn exec_carry(hart: &mut Hart, instr: &VecInstr, op: CarryOp) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let src1 = Src1::of(hart, instr);

    let uses_carry = match op {
        CarryOp::Adc | CarryOp::Sbc => true,
        CarryOp::Madc { carry } => carry,
        CarryOp::Msbc { borrow } => borrow,
    };
    let mask_dest = matches!(op, CarryOp::Madc { .. } | CarryOp::Msbc { .. });

    if matches!(op, CarryOp::Adc | CarryOp::Sbc) {
        // Reserved unmasked, and the destination may not be the carry
        // source
        if !instr.masked || vd == 0 {
            return Err(Exception::IllegalInstruction);
        }
    }
    if uses_carry && vs2 == 0 {
        return Err(Exception::IllegalInstruction);
    }
    if !mask_dest {
        check::require_aligned(vd, lmul)?;
    }
    check::require_aligned(vs2, lmul)?;
    if let Some((reg, emul)) = src1.emul(lmul) {
        check::require_aligned(reg, emul)?;
        if uses_carry && reg == 0 {
            return Err(Exception::IllegalInstruction);
        }
    }

    let (_, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        let a = u128::from(truncate(hart.vregs.read_uint(vs2, ix, sew), sew));
        let b = u128::from(truncate(src1.read(hart, ix, sew), sew));
        let c = u128::from(uses_carry && hart.vregs.read_mask_bit(0, ix));
        match op {
            CarryOp::Adc => {
                hart.vregs.write_uint(vd, ix, sew, (a + b + c) as u64);
            }
            CarryOp::Sbc => {
                hart.vregs
                    .write_uint(vd, ix, sew, (a.wrapping_sub(b + c)) as u64);
            }
            CarryOp::Madc { .. } => {
                let carry_out = (a + b + c) >> sew != 0;
                hart.vregs.write_mask_bit(vd, ix, carry_out);
            }
            CarryOp::Msbc { .. } => {
                let borrow_out = a < b + c;
                hart.vregs.write_mask_bit(vd, ix, borrow_out);
            }
        }
    }
    if mask_dest {
        if tail == ElemPolicy::AgnosticOnes {
            hart.vregs.finalize_mask_tail(vd, vl);
        }
    } else {
        hart.vregs.fill_tail(vd, vl, current_vlmax(hart), sew, tail);
    }
    Ok(())
}

/// Integer compares producing mask bits.
pub fn exec_cmp(hart: &mut Hart, instr: &VecInstr, op: CmpOp) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let src1 = Src1::of(hart, instr);

    check::require_aligned(vs2, lmul)?;
    let mut sources = vec![(vs2, sew)];
    if let Some((reg, emul)) = src1.emul(lmul) {
        check::require_aligned(reg, emul)?;
        sources.push((reg, sew));
    }
    check::check_masked_sources(&sources, instr.masked)?;
    check::check_masked_dest(vd, instr.masked)?;

    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            if inactive == ElemPolicy::AgnosticOnes {
                hart.vregs.write_mask_bit(vd, ix, true);
            }
            continue;
        }
        let a = hart.vregs.read_uint(vs2, ix, sew);
        let b = src1.read(hart, ix, sew);
        let (au, bu) = (truncate(a, sew), truncate(b, sew));
        let (a_s, b_s) = (to_signed(a, sew), to_signed(b, sew));
        let bit = match op {
            CmpOp::Seq => au == bu,
            CmpOp::Sne => au != bu,
            CmpOp::Sltu => au < bu,
            CmpOp::Slt => a_s < b_s,
            CmpOp::Sleu => au <= bu,
            CmpOp::Sle => a_s <= b_s,
            CmpOp::Sgtu => au > bu,
            CmpOp::Sgt => a_s > b_s,
        };
        hart.vregs.write_mask_bit(vd, ix, bit);
    }
    if tail == ElemPolicy::AgnosticOnes {
        hart.vregs.finalize_mask_tail(vd, vl);
    }
    Ok(())
}

/// vmerge (masked) and vmv.v.* (unmasked broadcast/copy).
pub fn exec_merge(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let lmul = hart.csr.vtype.lmul;
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let src1 = Src1::of(hart, instr);

    check::require_aligned(vd, lmul)?;
    if instr.masked {
        // The merge destination may not be the mask register
        if vd == 0 {
            return Err(Exception::IllegalInstruction);
        }
        check::require_aligned(vs2, lmul)?;
    }
    if let Some((reg, emul)) = src1.emul(lmul) {
        check::require_aligned(reg, emul)?;
    }

    let (_, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    for ix in vstart..vl {
        let value = if !instr.masked || hart.vregs.read_mask_bit(0, ix) {
            src1.read(hart, ix, sew)
        } else {
            hart.vregs.read_uint(vs2, ix, sew)
        };
        hart.vregs.write_uint(vd, ix, sew, value);
    }
    hart.vregs.fill_tail(vd, vl, current_vlmax(hart), sew, tail);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::VecOp;
    use crate::vector::vtype::VType;
    use crate::vector::VecConfig;

    fn hart_e32(vl: u64) -> Hart {
        let mut hart = Hart::new(VecConfig::default(), 0x10_0000);
        hart.csr.vtype = VType::decode(2 << 3, 128); // e32 m1 tu mu
        hart.csr.vl = vl;
        hart
    }

    fn hart_e8(vl: u64) -> Hart {
        let mut hart = Hart::new(VecConfig::default(), 0x10_0000);
        hart.csr.vtype = VType::decode(0, 128); // e8 m1
        hart.csr.vl = vl;
        hart
    }

    fn set_v32(hart: &mut Hart, reg: u32, values: &[u32]) {
        for (i, v) in values.iter().enumerate() {
            hart.vregs.write_elem::<u32>(reg, i as u64, *v);
        }
    }

    fn get_v32(hart: &Hart, reg: u32, n: usize) -> Vec<u32> {
        (0..n)
            .map(|i| hart.vregs.read_elem::<u32>(reg, i as u64))
            .collect()
    }

    #[test]
    fn check_vadd_vv() {
        let mut hart = hart_e32(4);
        set_v32(&mut hart, 1, &[1, 2, 3, 4]);
        set_v32(&mut hart, 3, &[10, 20, 30, 40]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Add), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Add).unwrap();
        assert_eq!(get_v32(&hart, 2, 4), vec![11, 22, 33, 44]);
    }

    #[test]
    fn check_vrsub_vx() {
        let mut hart = hart_e32(2);
        set_v32(&mut hart, 1, &[5, 100]);
        hart.set_x(7, 10);
        let instr = VecInstr::vx(VecOp::Int(IntOp::Rsub), 2, 1, 7);
        exec_int(&mut hart, &instr, IntOp::Rsub).unwrap();
        assert_eq!(get_v32(&hart, 2, 2), vec![5, 10u32.wrapping_sub(100)]);
    }

    #[test]
    fn check_shifts_mask_shift_amount() {
        let mut hart = hart_e32(1);
        set_v32(&mut hart, 1, &[0x8000_0001]);
        hart.set_x(7, 33); // 33 & 31 == 1
        let instr = VecInstr::vx(VecOp::Int(IntOp::Srl), 2, 1, 7);
        exec_int(&mut hart, &instr, IntOp::Srl).unwrap();
        assert_eq!(get_v32(&hart, 2, 1), vec![0x4000_0000]);
        let instr = VecInstr::vx(VecOp::Int(IntOp::Sra), 3, 1, 7);
        exec_int(&mut hart, &instr, IntOp::Sra).unwrap();
        assert_eq!(get_v32(&hart, 3, 1), vec![0xc000_0000]);
    }

    #[test]
    fn check_min_max_signedness() {
        let mut hart = hart_e32(2);
        set_v32(&mut hart, 1, &[0xffff_ffff, 3]); // -1, 3
        set_v32(&mut hart, 3, &[1, 7]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Min), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Min).unwrap();
        assert_eq!(get_v32(&hart, 2, 2), vec![0xffff_ffff, 3]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Minu), 4, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Minu).unwrap();
        assert_eq!(get_v32(&hart, 4, 2), vec![1, 3]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Max), 5, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Max).unwrap();
        assert_eq!(get_v32(&hart, 5, 2), vec![1, 7]);
    }

    #[test]
    fn check_mulh_variants() {
        let mut hart = hart_e32(1);
        set_v32(&mut hart, 1, &[0xffff_ffff]); // -1 or max unsigned
        set_v32(&mut hart, 3, &[4]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Mulh), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Mulh).unwrap();
        assert_eq!(get_v32(&hart, 2, 1), vec![0xffff_ffff]); // -1*4 >> 32
        let instr = VecInstr::vv(VecOp::Int(IntOp::Mulhu), 4, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Mulhu).unwrap();
        assert_eq!(get_v32(&hart, 4, 1), vec![3]);
        // signed vs2 x unsigned vs1
        let instr = VecInstr::vv(VecOp::Int(IntOp::Mulhsu), 5, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Mulhsu).unwrap();
        assert_eq!(get_v32(&hart, 5, 1), vec![0xffff_ffff]);
    }

    #[test]
    fn check_division_special_cases() {
        let mut hart = hart_e32(3);
        set_v32(&mut hart, 1, &[6, 7, 0x8000_0000]); // 6, 7, INT_MIN
        set_v32(&mut hart, 3, &[0, 2, 0xffff_ffff]); // /0, /2, /-1
        let instr = VecInstr::vv(VecOp::Int(IntOp::Div), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Div).unwrap();
        assert_eq!(
            get_v32(&hart, 2, 3),
            vec![0xffff_ffff, 3, 0x8000_0000] // all-ones, 3, INT_MIN
        );
        let instr = VecInstr::vv(VecOp::Int(IntOp::Rem), 4, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Rem).unwrap();
        assert_eq!(get_v32(&hart, 4, 3), vec![6, 1, 0]);
    }

    #[test]
    fn check_multiply_add_family() {
        let mut hart = hart_e32(1);
        set_v32(&mut hart, 1, &[3]); // vs2
        set_v32(&mut hart, 3, &[5]); // vs1
        set_v32(&mut hart, 2, &[100]); // vd
        let instr = VecInstr::vv(VecOp::Int(IntOp::Macc), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Macc).unwrap();
        assert_eq!(get_v32(&hart, 2, 1), vec![115]); // 5*3 + 100

        set_v32(&mut hart, 2, &[100]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Nmsac), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Nmsac).unwrap();
        assert_eq!(get_v32(&hart, 2, 1), vec![85]); // 100 - 5*3

        set_v32(&mut hart, 2, &[7]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Madd), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Madd).unwrap();
        assert_eq!(get_v32(&hart, 2, 1), vec![38]); // 5*7 + 3

        set_v32(&mut hart, 2, &[7]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Nmsub), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Nmsub).unwrap();
        assert_eq!(get_v32(&hart, 2, 1), vec![3u32.wrapping_sub(35)]);
    }

    #[test]
    fn check_widening_add_unsigned_and_signed() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u8>(1, 0, 0xff);
        hart.vregs.write_elem::<u8>(1, 1, 0x7f);
        hart.vregs.write_elem::<u8>(3, 0, 1);
        hart.vregs.write_elem::<u8>(3, 1, 1);
        let instr = VecInstr::vv(VecOp::Widen(WidenOp::Waddu), 4, 1, 3);
        exec_widen(&mut hart, &instr, WidenOp::Waddu).unwrap();
        assert_eq!(hart.vregs.read_elem::<u16>(4, 0), 0x100); // 255 + 1
        let instr = VecInstr::vv(VecOp::Widen(WidenOp::Wadd), 6, 1, 3);
        exec_widen(&mut hart, &instr, WidenOp::Wadd).unwrap();
        assert_eq!(hart.vregs.read_elem::<u16>(6, 0), 0); // -1 + 1
        assert_eq!(hart.vregs.read_elem::<u16>(6, 1), 0x80); // 127 + 1
    }

    #[test]
    fn check_widening_not_available_at_e64() {
        let mut hart = hart_e32(1);
        hart.csr.vtype = VType::decode(3 << 3, 128); // e64
        hart.csr.vl = 1;
        let instr = VecInstr::vv(VecOp::Widen(WidenOp::Wadd), 4, 1, 3);
        assert_eq!(
            exec_widen(&mut hart, &instr, WidenOp::Wadd),
            Err(Exception::IllegalInstruction)
        );
    }

    #[test]
    fn check_widening_multiply_accumulate() {
        let mut hart = hart_e8(1);
        hart.vregs.write_elem::<u8>(1, 0, 0xff); // -1 signed, 255 unsigned
        hart.vregs.write_elem::<u8>(3, 0, 2);
        hart.vregs.write_elem::<u16>(4, 0, 1000);
        let instr = VecInstr::vv(VecOp::Widen(WidenOp::Wmacc), 4, 1, 3);
        exec_widen(&mut hart, &instr, WidenOp::Wmacc).unwrap();
        assert_eq!(hart.vregs.read_elem::<u16>(4, 0), 998); // 1000 + (-1*2)

        hart.vregs.write_elem::<u16>(6, 0, 1000);
        let instr = VecInstr::vv(VecOp::Widen(WidenOp::Wmaccu), 6, 1, 3);
        exec_widen(&mut hart, &instr, WidenOp::Wmaccu).unwrap();
        assert_eq!(hart.vregs.read_elem::<u16>(6, 0), 1510); // 1000 + 255*2
    }

    #[test]
    fn check_wadd_w_wide_first_source() {
        let mut hart = hart_e8(1);
        hart.vregs.write_elem::<u16>(2, 0, 300);
        hart.vregs.write_elem::<u8>(1, 0, 0xff); // -1 signed
        let instr = VecInstr::vv(VecOp::Widen(WidenOp::WaddW), 4, 2, 1);
        exec_widen(&mut hart, &instr, WidenOp::WaddW).unwrap();
        assert_eq!(hart.vregs.read_elem::<u16>(4, 0), 299);
    }

    #[test]
    fn check_widen_overlap_rejected_at_group_bottom() {
        let mut hart = hart_e8(1);
        hart.csr.vtype = VType::decode(1, 128); // e8 m2
        hart.csr.vl = 1;
        // dest v4 (emul 4 at 2xSEW), source v4 at the bottom: illegal
        let instr = VecInstr::vv(VecOp::Widen(WidenOp::Wadd), 4, 4, 8);
        assert_eq!(
            exec_widen(&mut hart, &instr, WidenOp::Wadd),
            Err(Exception::IllegalInstruction)
        );
    }

    #[test]
    fn check_narrowing_shift() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u16>(2, 0, 0x8180);
        hart.vregs.write_elem::<u16>(2, 1, 0x0040);
        hart.vregs.write_elem::<u8>(1, 0, 8);
        hart.vregs.write_elem::<u8>(1, 1, 0);
        let instr = VecInstr::vv(VecOp::NarrowShift(NarrowShiftOp::Nsrl), 4, 2, 1);
        exec_narrow_shift(&mut hart, &instr, NarrowShiftOp::Nsrl).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(4, 0), 0x81);
        assert_eq!(hart.vregs.read_elem::<u8>(4, 1), 0x40);
        let instr = VecInstr::vv(VecOp::NarrowShift(NarrowShiftOp::Nsra), 5, 2, 1);
        exec_narrow_shift(&mut hart, &instr, NarrowShiftOp::Nsra).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(5, 0), 0x81); // sign bits shifted in
    }

    #[test]
    fn check_extension_ops() {
        let mut hart = hart_e32(2);
        hart.vregs.write_elem::<u8>(1, 0, 0x80);
        hart.vregs.write_elem::<u8>(1, 1, 0x7f);
        let instr = VecInstr::v(VecOp::Ext(ExtKind::Zext4), 2, 1);
        exec_ext(&mut hart, &instr, ExtKind::Zext4).unwrap();
        assert_eq!(get_v32(&hart, 2, 2), vec![0x80, 0x7f]);
        let instr = VecInstr::v(VecOp::Ext(ExtKind::Sext4), 4, 1);
        exec_ext(&mut hart, &instr, ExtKind::Sext4).unwrap();
        assert_eq!(get_v32(&hart, 4, 2), vec![0xffff_ff80, 0x7f]);
        // e32 cannot sext8 (source would be 4 bits)
        let instr = VecInstr::v(VecOp::Ext(ExtKind::Sext8), 6, 1);
        assert_eq!(
            exec_ext(&mut hart, &instr, ExtKind::Sext8),
            Err(Exception::IllegalInstruction)
        );
    }

    #[test]
    fn check_adc_and_madc() {
        let mut hart = hart_e32(2);
        set_v32(&mut hart, 1, &[0xffff_ffff, 5]);
        set_v32(&mut hart, 3, &[0, 7]);
        // Carry into both lanes
        hart.vregs.write_elem::<u8>(0, 0, 0b11);
        let instr = VecInstr::vv(VecOp::Carry(CarryOp::Adc), 2, 1, 3).masked();
        exec_carry(&mut hart, &instr, CarryOp::Adc).unwrap();
        assert_eq!(get_v32(&hart, 2, 2), vec![0, 13]);
        let instr = VecInstr::vv(VecOp::Carry(CarryOp::Madc { carry: true }), 4, 1, 3).masked();
        exec_carry(&mut hart, &instr, CarryOp::Madc { carry: true }).unwrap();
        assert!(hart.vregs.read_mask_bit(4, 0)); // wrapped
        assert!(!hart.vregs.read_mask_bit(4, 1));
    }

    #[test]
    fn check_adc_reserved_unmasked_and_v0_dest() {
        let mut hart = hart_e32(1);
        let unmasked = VecInstr::vv(VecOp::Carry(CarryOp::Adc), 2, 1, 3);
        assert_eq!(
            exec_carry(&mut hart, &unmasked, CarryOp::Adc),
            Err(Exception::IllegalInstruction)
        );
        let v0_dest = VecInstr::vv(VecOp::Carry(CarryOp::Adc), 0, 1, 3).masked();
        assert_eq!(
            exec_carry(&mut hart, &v0_dest, CarryOp::Adc),
            Err(Exception::IllegalInstruction)
        );
    }

    #[test]
    fn check_msbc_borrow_out() {
        let mut hart = hart_e32(2);
        set_v32(&mut hart, 1, &[1, 9]);
        set_v32(&mut hart, 3, &[2, 4]);
        let instr = VecInstr::vv(VecOp::Carry(CarryOp::Msbc { borrow: false }), 4, 1, 3);
        exec_carry(&mut hart, &instr, CarryOp::Msbc { borrow: false }).unwrap();
        assert!(hart.vregs.read_mask_bit(4, 0)); // 1 - 2 borrows
        assert!(!hart.vregs.read_mask_bit(4, 1));
    }

    #[test]
    fn check_compare_produces_mask() {
        let mut hart = hart_e32(4);
        set_v32(&mut hart, 1, &[1, 5, 5, 0xffff_ffff]);
        set_v32(&mut hart, 3, &[5, 5, 1, 0]);
        let instr = VecInstr::vv(VecOp::Cmp(CmpOp::Slt), 4, 1, 3);
        exec_cmp(&mut hart, &instr, CmpOp::Slt).unwrap();
        // 1<5, !(5<5), !(5<1), -1<0
        assert_eq!(hart.vregs.read_elem::<u8>(4, 0) & 0xf, 0b1001);
        let instr = VecInstr::vv(VecOp::Cmp(CmpOp::Sltu), 5, 1, 3);
        exec_cmp(&mut hart, &instr, CmpOp::Sltu).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(5, 0) & 0xf, 0b0001);
    }

    #[test]
    fn check_merge_and_broadcast() {
        let mut hart = hart_e32(4);
        set_v32(&mut hart, 2, &[1, 2, 3, 4]);
        hart.set_x(7, 99);
        hart.vregs.write_elem::<u8>(0, 0, 0b0101);
        let instr = VecInstr::vx(VecOp::Merge, 4, 2, 7).masked();
        exec_merge(&mut hart, &instr).unwrap();
        assert_eq!(get_v32(&hart, 4, 4), vec![99, 2, 99, 4]);
        // Unmasked form is a broadcast
        let instr = VecInstr::vx(VecOp::Merge, 6, 0, 7);
        exec_merge(&mut hart, &instr).unwrap();
        assert_eq!(get_v32(&hart, 6, 4), vec![99, 99, 99, 99]);
    }

    #[test]
    fn check_masked_add_agnostic_ones() {
        let mut hart = hart_e32(2);
        hart.csr.vtype = VType::decode(0x80 | (2 << 3), 128); // e32 m1 ma
        hart.csr.vl = 2;
        set_v32(&mut hart, 1, &[1, 2]);
        set_v32(&mut hart, 3, &[10, 10]);
        set_v32(&mut hart, 2, &[5, 5]);
        hart.vregs.write_elem::<u8>(0, 0, 0b10);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Add), 2, 1, 3).masked();
        exec_int(&mut hart, &instr, IntOp::Add).unwrap();
        assert_eq!(get_v32(&hart, 2, 2), vec![0xffff_ffff, 12]);
    }

    #[test]
    fn check_tail_agnostic_fill() {
        let mut hart = hart_e32(2);
        hart.csr.vtype = VType::decode(0x40 | (2 << 3), 128); // e32 m1 ta
        hart.csr.vl = 2;
        set_v32(&mut hart, 1, &[1, 2, 0, 0]);
        set_v32(&mut hart, 3, &[1, 1, 0, 0]);
        set_v32(&mut hart, 2, &[9, 9, 9, 9]);
        let instr = VecInstr::vv(VecOp::Int(IntOp::Add), 2, 1, 3);
        exec_int(&mut hart, &instr, IntOp::Add).unwrap();
        assert_eq!(get_v32(&hart, 2, 4), vec![2, 3, 0xffff_ffff, 0xffff_ffff]);
    }

    #[test]
    fn check_misaligned_operand_rejected() {
        let mut hart = hart_e32(1);
        hart.csr.vtype = VType::decode((2 << 3) | 1, 128); // e32 m2
        hart.csr.vl = 1;
        let instr = VecInstr::vv(VecOp::Int(IntOp::Add), 3, 2, 4);
        assert_eq!(
            exec_int(&mut hart, &instr, IntOp::Add),
            Err(Exception::IllegalInstruction)
        );
    }
}
