//! Fixed-point arithmetic engine
//!
//! Saturating add/subtract, averaging add/subtract, the
//! high-half-rounding multiply, scaling shifts and the narrowing
//! clips. Results are computed in a doubled intermediate, rounded per
//! VXRM and optionally clamped; every saturating lane sets VXSAT and
//! is recorded in the per-element saturation trace.

use crate::hart::{Exception, Hart};
use crate::instr::FixedOp;
use crate::instr::VecInstr;
use crate::utils::{to_signed, truncate};
use crate::vector::arith::Src1;
use crate::vector::check;
use crate::vector::{current_vlmax, policies};

/// Round off the low `shift` bits of a two's-complement value per the
/// VXRM mode: round-to-nearest-up, round-to-nearest-even, truncate,
/// or round-to-odd.
fn round_off(value: i128, shift: u32, vxrm: u8) -> i128 {
    if shift == 0 {
        return value;
    }
    let shifted = value >> shift;
    let lost = value & ((1i128 << shift) - 1);
    match vxrm {
        // rnu: round up on the most significant lost bit
        0 => shifted + ((value >> (shift - 1)) & 1),
        // rne: ties to even
        1 => {
            let round_bit = (value >> (shift - 1)) & 1;
            let sticky = lost & !(1i128 << (shift - 1)) != 0;
            if round_bit == 1 && (sticky || shifted & 1 == 1) {
                shifted + 1
            } else {
                shifted
            }
        }
        // rdn: truncate
        2 => shifted,
        // rod: force the low bit when anything was lost
        _ => {
            if lost != 0 {
                shifted | 1
            } else {
                shifted
            }
        }
    }
}

fn umax(bits: u32) -> i128 {
    (1i128 << bits) - 1
}

fn smax(bits: u32) -> i128 {
    (1i128 << (bits - 1)) - 1
}

fn smin(bits: u32) -> i128 {
    -(1i128 << (bits - 1))
}

fn clamp(value: i128, low: i128, high: i128) -> (i128, bool) {
    if value < low {
        (low, true)
    } else if value > high {
        (high, true)
    } else {
        (value, false)
    }
}

/// One fixed-point element: `f(vs2, src1, vxrm) -> (result, saturated)`.
/// The source and destination element widths differ for the narrowing
/// clips.
fn fixed_loop(
    hart: &mut Hart,
    instr: &VecInstr,
    src_eew: u32,
    dest_eew: u32,
    f: impl Fn(u64, u64, u8) -> (u64, bool),
) -> Result<(), Exception> {
    let lmul = hart.csr.vtype.lmul;
    let sew = hart.csr.vtype.sew.bits();
    let vd = instr.vd();
    let vs2 = instr.vs2();
    let src1 = Src1::of(hart, instr);

    let s_emul = if src_eew == sew {
        lmul
    } else {
        lmul.emul(sew, src_eew).ok_or(Exception::IllegalInstruction)?
    };
    check::require_aligned(vd, lmul)?;
    check::require_aligned(vs2, s_emul)?;
    check::check_masked_dest(vd, instr.masked)?;
    if src_eew > sew {
        check::check_narrow_overlap(vd, lmul, vs2, s_emul)?;
    }
    let mut sources = vec![(vs2, src_eew)];
    if let Src1::Vec(reg) = &src1 {
        check::require_aligned(*reg, lmul)?;
        sources.push((*reg, sew));
    }
    check::check_masked_sources(&sources, instr.masked)?;

    let vxrm = hart.csr.vxrm;
    let (inactive, tail) = policies(hart);
    let (vstart, vl) = (hart.csr.vstart, hart.csr.vl);
    hart.elem_sat.resize(vl as usize, false);
    for ix in vstart..vl {
        if !hart.vregs.is_element_active(ix, instr.masked) {
            hart.vregs.write_inactive(vd, ix, dest_eew, inactive);
            continue;
        }
        let a = hart.vregs.read_uint(vs2, ix, src_eew);
        let b = src1.read(hart, ix, sew);
        let (value, sat) = f(a, b, vxrm);
        hart.vregs.write_uint(vd, ix, dest_eew, value);
        if sat {
            hart.csr.vxsat = true;
            hart.elem_sat[ix as usize] = true;
        }
    }
    hart.vregs
        .fill_tail(vd, vl, current_vlmax(hart), dest_eew, tail);
    Ok(())
}

pub fn exec(hart: &mut Hart, instr: &VecInstr, op: FixedOp) -> Result<(), Exception> {
    let sew = hart.csr.vtype.sew.bits();
    let wide = sew * 2;
    let shamt_mask = u64::from(sew) - 1;
    match op {
        FixedOp::Saddu => fixed_loop(hart, instr, sew, sew, move |a, b, _| {
            let sum = i128::from(truncate(a, sew)) + i128::from(truncate(b, sew));
            let (v, sat) = clamp(sum, 0, umax(sew));
            (v as u64, sat)
        }),
        FixedOp::Sadd => fixed_loop(hart, instr, sew, sew, move |a, b, _| {
            let sum = i128::from(to_signed(a, sew)) + i128::from(to_signed(b, sew));
            let (v, sat) = clamp(sum, smin(sew), smax(sew));
            (v as u64, sat)
        }),
        FixedOp::Ssubu => fixed_loop(hart, instr, sew, sew, move |a, b, _| {
            let diff = i128::from(truncate(a, sew)) - i128::from(truncate(b, sew));
            let (v, sat) = clamp(diff, 0, umax(sew));
            (v as u64, sat)
        }),
        FixedOp::Ssub => fixed_loop(hart, instr, sew, sew, move |a, b, _| {
            let diff = i128::from(to_signed(a, sew)) - i128::from(to_signed(b, sew));
            let (v, sat) = clamp(diff, smin(sew), smax(sew));
            (v as u64, sat)
        }),
        FixedOp::Aaddu => fixed_loop(hart, instr, sew, sew, move |a, b, vxrm| {
            let sum = i128::from(truncate(a, sew)) + i128::from(truncate(b, sew));
            (round_off(sum, 1, vxrm) as u64, false)
        }),
        FixedOp::Aadd => fixed_loop(hart, instr, sew, sew, move |a, b, vxrm| {
            let sum = i128::from(to_signed(a, sew)) + i128::from(to_signed(b, sew));
            (round_off(sum, 1, vxrm) as u64, false)
        }),
        FixedOp::Asubu => fixed_loop(hart, instr, sew, sew, move |a, b, vxrm| {
            let diff = i128::from(truncate(a, sew)) - i128::from(truncate(b, sew));
            (round_off(diff, 1, vxrm) as u64, false)
        }),
        FixedOp::Asub => fixed_loop(hart, instr, sew, sew, move |a, b, vxrm| {
            let diff = i128::from(to_signed(a, sew)) - i128::from(to_signed(b, sew));
            (round_off(diff, 1, vxrm) as u64, false)
        }),
        FixedOp::Smul => fixed_loop(hart, instr, sew, sew, move |a, b, vxrm| {
            let prod = i128::from(to_signed(a, sew)) * i128::from(to_signed(b, sew));
            let rounded = round_off(prod, sew - 1, vxrm);
            let (v, sat) = clamp(rounded, smin(sew), smax(sew));
            (v as u64, sat)
        }),
        FixedOp::Ssrl => fixed_loop(hart, instr, sew, sew, move |a, b, vxrm| {
            let shamt = (b & shamt_mask) as u32;
            (
                round_off(i128::from(truncate(a, sew)), shamt, vxrm) as u64,
                false,
            )
        }),
        FixedOp::Ssra => fixed_loop(hart, instr, sew, sew, move |a, b, vxrm| {
            let shamt = (b & shamt_mask) as u32;
            (
                round_off(i128::from(to_signed(a, sew)), shamt, vxrm) as u64,
                false,
            )
        }),
        FixedOp::Nclipu => {
            if wide > 64 {
                return Err(Exception::IllegalInstruction);
            }
            fixed_loop(hart, instr, wide, sew, move |a, b, vxrm| {
                let shamt = (b & (u64::from(wide) - 1)) as u32;
                let rounded = round_off(i128::from(truncate(a, wide)), shamt, vxrm);
                let (v, sat) = clamp(rounded, 0, umax(sew));
                (v as u64, sat)
            })
        }
        FixedOp::Nclip => {
            if wide > 64 {
                return Err(Exception::IllegalInstruction);
            }
            fixed_loop(hart, instr, wide, sew, move |a, b, vxrm| {
                let shamt = (b & (u64::from(wide) - 1)) as u32;
                let rounded = round_off(i128::from(to_signed(a, wide)), shamt, vxrm);
                let (v, sat) = clamp(rounded, smin(sew), smax(sew));
                (v as u64, sat)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::VecOp;
    use crate::vector::vtype::VType;
    use crate::vector::VecConfig;

    fn hart_e8(vl: u64) -> Hart {
        let mut hart = Hart::new(VecConfig::default(), 0x10_0000);
        hart.csr.vtype = VType::decode(0, 128);
        hart.csr.vl = vl;
        hart
    }

    #[test]
    fn check_round_off_modes() {
        // 0b1011 >> 1: rnu rounds up, rne ties, rdn truncates, rod odd
        assert_eq!(round_off(0b1011, 1, 0), 0b110);
        assert_eq!(round_off(0b1011, 1, 1), 0b110); // 5.5 -> 6
        assert_eq!(round_off(0b1010, 1, 1), 0b101); // 5.0 exact
        assert_eq!(round_off(0b1011, 1, 2), 0b101);
        assert_eq!(round_off(0b1011, 1, 3), 0b101);
        assert_eq!(round_off(0b1010, 1, 3), 0b101);
        assert_eq!(round_off(0b1100, 2, 3), 0b11); // exact: unchanged
        assert_eq!(round_off(0b1101, 2, 3), 0b11);
        // rne tie to even: 0b0110 >> 2 = 1.5 -> 2, 0b0010 >> 2 = 0.5 -> 0
        assert_eq!(round_off(0b0110, 2, 1), 2);
        assert_eq!(round_off(0b0010, 2, 1), 0);
    }

    #[test]
    fn check_saturating_add_unsigned() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u8>(1, 0, 250);
        hart.vregs.write_elem::<u8>(1, 1, 10);
        hart.vregs.write_elem::<u8>(3, 0, 10);
        hart.vregs.write_elem::<u8>(3, 1, 10);
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Saddu), 2, 1, 3);
        exec(&mut hart, &instr, FixedOp::Saddu).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(2, 0), 255);
        assert_eq!(hart.vregs.read_elem::<u8>(2, 1), 20);
        assert!(hart.csr.vxsat);
        assert_eq!(hart.elem_sat, vec![true, false]);
    }

    #[test]
    fn check_saturating_add_signed_both_directions() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u8>(1, 0, 0x7f); // 127
        hart.vregs.write_elem::<u8>(1, 1, 0x80); // -128
        hart.vregs.write_elem::<u8>(3, 0, 1);
        hart.vregs.write_elem::<u8>(3, 1, 0xff); // -1
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Sadd), 2, 1, 3);
        exec(&mut hart, &instr, FixedOp::Sadd).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(2, 0), 0x7f);
        assert_eq!(hart.vregs.read_elem::<u8>(2, 1), 0x80);
        assert!(hart.csr.vxsat);
    }

    #[test]
    fn check_saturating_sub_unsigned_floors_at_zero() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u8>(1, 0, 5);
        hart.vregs.write_elem::<u8>(1, 1, 20);
        hart.vregs.write_elem::<u8>(3, 0, 10);
        hart.vregs.write_elem::<u8>(3, 1, 10);
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Ssubu), 2, 1, 3);
        exec(&mut hart, &instr, FixedOp::Ssubu).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(2, 0), 0);
        assert_eq!(hart.vregs.read_elem::<u8>(2, 1), 10);
    }

    #[test]
    fn check_averaging_add() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u8>(1, 0, 5);
        hart.vregs.write_elem::<u8>(1, 1, 0xff); // -1 signed
        hart.vregs.write_elem::<u8>(3, 0, 6);
        hart.vregs.write_elem::<u8>(3, 1, 0xfd); // -3 signed
        hart.csr.vxrm = 2; // truncate
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Aadd), 2, 1, 3);
        exec(&mut hart, &instr, FixedOp::Aadd).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(2, 0), 5); // (5+6)>>1
        assert_eq!(hart.vregs.read_elem::<u8>(2, 1), 0xfe); // (-4)>>1
        assert!(!hart.csr.vxsat);
    }

    #[test]
    fn check_smul_saturates_min_times_min() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u8>(1, 0, 0x80); // -128
        hart.vregs.write_elem::<u8>(1, 1, 0x40); // 64
        hart.vregs.write_elem::<u8>(3, 0, 0x80);
        hart.vregs.write_elem::<u8>(3, 1, 0x40);
        hart.csr.vxrm = 2;
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Smul), 2, 1, 3);
        exec(&mut hart, &instr, FixedOp::Smul).unwrap();
        // (-128 * -128) >> 7 = 128: clamps to 127
        assert_eq!(hart.vregs.read_elem::<u8>(2, 0), 0x7f);
        // (64 * 64) >> 7 = 32
        assert_eq!(hart.vregs.read_elem::<u8>(2, 1), 32);
        assert!(hart.csr.vxsat);
    }

    #[test]
    fn check_scaling_shift_rounds() {
        let mut hart = hart_e8(1);
        hart.vregs.write_elem::<u8>(1, 0, 0b111);
        hart.vregs.write_elem::<u8>(3, 0, 1);
        hart.csr.vxrm = 0; // round-up
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Ssrl), 2, 1, 3);
        exec(&mut hart, &instr, FixedOp::Ssrl).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(2, 0), 0b100);
    }

    #[test]
    fn check_nclip_signed_saturation() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u16>(2, 0, 0x7fff);
        hart.vregs.write_elem::<u16>(2, 1, 0x0040);
        hart.vregs.write_elem::<u8>(1, 0, 0);
        hart.vregs.write_elem::<u8>(1, 1, 1);
        hart.csr.vxrm = 2;
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Nclip), 4, 2, 1);
        exec(&mut hart, &instr, FixedOp::Nclip).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(4, 0), 0x7f); // clamped
        assert_eq!(hart.vregs.read_elem::<u8>(4, 1), 0x20);
        assert!(hart.csr.vxsat);
    }

    #[test]
    fn check_nclipu_unsigned_saturation() {
        let mut hart = hart_e8(1);
        hart.vregs.write_elem::<u16>(2, 0, 0x1ff);
        hart.vregs.write_elem::<u8>(1, 0, 0);
        hart.csr.vxrm = 2;
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Nclipu), 4, 2, 1);
        exec(&mut hart, &instr, FixedOp::Nclipu).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(4, 0), 0xff);
        assert!(hart.csr.vxsat);
    }

    #[test]
    fn check_masked_lane_skips_saturation() {
        let mut hart = hart_e8(2);
        hart.vregs.write_elem::<u8>(1, 0, 255);
        hart.vregs.write_elem::<u8>(1, 1, 255);
        hart.vregs.write_elem::<u8>(3, 0, 255);
        hart.vregs.write_elem::<u8>(3, 1, 1);
        hart.vregs.write_elem::<u8>(0, 0, 0b10); // only lane 1 active
        let instr = VecInstr::vv(VecOp::Fixed(FixedOp::Saddu), 2, 1, 3).masked();
        exec(&mut hart, &instr, FixedOp::Saddu).unwrap();
        // Lane 0 inactive: no saturation recorded for it
        assert_eq!(hart.elem_sat, vec![false, true]);
    }
}
