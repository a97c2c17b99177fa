//! Vector memory engine
//!
//! Unit-stride, strided, indexed, segment, whole-register and mask
//! loads and stores. Every element walks the same path the scalar
//! side uses: translate, consult the PMA map, then dispatch to a
//! device, memory-mapped register or flat memory. A fault persists
//! vstart at the faulting element and raises the exception with the
//! faulting address; fault-only-first loads instead truncate vl when
//! the fault is past element zero. Each element access appends to the
//! hart's descriptor list for the trace/commit step.

use crate::hart::{Exception, Hart, MemAccessKind};
use crate::instr::{AddrPattern, MemAccess, VecInstr};
use crate::vector::check;
use crate::vector::policies;
use crate::vector::vtype::Lmul;

/// Per-element record of a vector load or store.
#[derive(Debug, Clone, Default)]
pub struct ElemDescriptor {
    pub virt_addr: u64,
    pub phys_addr1: u64,
    /// Differs from phys_addr1 only when the element crosses a page
    /// boundary
    pub phys_addr2: u64,
    pub data: u64,
    pub element_index: u64,
    pub skipped: bool,
    pub field_index: u8,
}

struct MemPlan {
    pattern: AddrPattern,
    data_eew: u32,
    idx_eew: u32,
    idx_reg: u32,
    nf: u32,
    /// Registers per field group
    group_regs: u32,
    elems: u64,
    base: u64,
    stride: i64,
    /// Element capacity of one field group, for the tail fill
    data_elems_cap: u64,
    masked: bool,
}

fn plan(hart: &Hart, instr: &VecInstr, access: MemAccess, is_load: bool) -> Result<MemPlan, Exception> {
    let vtype = hart.csr.vtype;
    let lmul = vtype.lmul;
    let sew = vtype.sew.bits();
    let vd = instr.vd();
    let nf = u32::from(instr.field_count.max(1));

    let indexed = matches!(
        access.pattern,
        AddrPattern::IndexedOrdered | AddrPattern::IndexedUnordered
    );

    match access.pattern {
        AddrPattern::FaultFirst if !is_load => return Err(Exception::IllegalInstruction),
        AddrPattern::WholeReg { nregs } => {
            let n = u32::from(nregs);
            if !matches!(n, 1 | 2 | 4 | 8) || vd % n != 0 || instr.masked || nf != 1 {
                return Err(Exception::IllegalInstruction);
            }
            let eew = access.eew_bits;
            return Ok(MemPlan {
                pattern: access.pattern,
                data_eew: eew,
                idx_eew: 0,
                idx_reg: 0,
                nf: 1,
                group_regs: n,
                elems: u64::from(n * hart.config.vlen_bits / eew),
                base: hart.x(instr.rs1()),
                stride: 0,
                data_elems_cap: 0,
                masked: false,
            });
        }
        AddrPattern::MaskBytes => {
            if instr.masked || nf != 1 {
                return Err(Exception::IllegalInstruction);
            }
            return Ok(MemPlan {
                pattern: access.pattern,
                data_eew: 8,
                idx_eew: 0,
                idx_reg: 0,
                nf: 1,
                group_regs: 1,
                elems: hart.csr.vl.div_ceil(8),
                base: hart.x(instr.rs1()),
                stride: 0,
                data_elems_cap: 0,
                masked: false,
            });
        }
        _ => (),
    }

    // Indexed accesses keep the data at SEW; the encoded width is the
    // index width. Everything else transfers at the encoded width.
    let data_eew = if indexed { sew } else { access.eew_bits };
    let d_emul = lmul
        .emul(sew, data_eew)
        .ok_or(Exception::IllegalInstruction)?;
    let group_regs = d_emul.reg_count();

    // Segment limits: the register tally may not exceed 8 groups or
    // run off the register file
    if nf > 8 || nf * group_regs > 8 || vd + nf * group_regs > 32 {
        return Err(Exception::IllegalInstruction);
    }
    check::require_aligned(vd, d_emul)?;
    if is_load {
        check::check_masked_dest(vd, instr.masked)?;
    }

    let mut idx_eew = 0;
    let mut idx_reg = 0;
    if indexed {
        idx_eew = access.eew_bits;
        idx_reg = instr.vs2();
        let idx_emul = lmul
            .emul(sew, idx_eew)
            .ok_or(Exception::IllegalInstruction)?;
        check::require_aligned(idx_reg, idx_emul)?;
        if is_load {
            // Index and destination widths differ: the widening or
            // narrowing overlap rule applies between them
            if idx_eew < data_eew {
                check::check_widen_overlap(vd, group_mul(d_emul, nf), idx_reg, idx_emul)?;
            } else if idx_eew > data_eew {
                check::check_narrow_overlap(vd, group_mul(d_emul, nf), idx_reg, idx_emul)?;
            }
            if nf > 1 {
                check::check_no_overlap(vd, nf * group_regs, idx_reg, idx_emul.reg_count())?;
            }
        }
    }

    let stride = match access.pattern {
        AddrPattern::Strided => hart.x(instr.rs2()) as i64,
        _ => 0,
    };

    Ok(MemPlan {
        pattern: access.pattern,
        data_eew,
        idx_eew,
        idx_reg,
        nf,
        group_regs,
        elems: hart.csr.vl,
        base: hart.x(instr.rs1()),
        stride,
        data_elems_cap: u64::from(hart.config.vlen_bits * d_emul.num() / (d_emul.den() * data_eew)),
        masked: instr.masked,
    })
}

/// Widen a group multiplier by the field count for overlap purposes.
fn group_mul(emul: Lmul, nf: u32) -> Lmul {
    match emul.reg_count() * nf {
        2 => Lmul::M2,
        4 => Lmul::M4,
        8 => Lmul::M8,
        _ => emul,
    }
}

impl MemPlan {
    /// The address of one field of one element.
    fn elem_addr(&self, hart: &Hart, ix: u64, field: u32) -> u64 {
        let eew_bytes = u64::from(self.data_eew / 8);
        let field_off = u64::from(field) * eew_bytes;
        match self.pattern {
            AddrPattern::UnitStride | AddrPattern::FaultFirst => {
                // Segment fields interleave: the element stride is
                // nf * eew/8
                self.base + ix * u64::from(self.nf) * eew_bytes + field_off
            }
            AddrPattern::Strided => {
                self.base
                    .wrapping_add(self.stride.wrapping_mul(ix as i64) as u64)
                    + field_off
            }
            AddrPattern::IndexedOrdered | AddrPattern::IndexedUnordered => {
                self.base
                    .wrapping_add(hart.vregs.read_index(self.idx_reg, ix, self.idx_eew))
                    + field_off
            }
            AddrPattern::WholeReg { .. } | AddrPattern::MaskBytes => self.base + ix * eew_bytes,
        }
    }

    fn dest_reg(&self, vd: u32, field: u32) -> u32 {
        vd + field * self.group_regs
    }
}

fn record(hart: &mut Hart, desc: ElemDescriptor) {
    hart.descriptors.push(desc);
}

/// A fault mid-loop persists vstart at the faulting element and marks
/// the vector state dirty.
fn persist_fault(hart: &mut Hart, ix: u64, ex: Exception) -> Exception {
    hart.csr.vstart = ix;
    hart.csr.mark_vs_dirty();
    ex
}

pub fn exec_load(hart: &mut Hart, instr: &VecInstr, access: MemAccess) -> Result<(), Exception> {
    let plan = plan(hart, instr, access, true)?;
    let vd = instr.vd();
    let size = u64::from(plan.data_eew / 8);
    let fault_first = plan.pattern == AddrPattern::FaultFirst;
    let (inactive, tail) = policies(hart);
    let vstart = hart.csr.vstart;
    let atomic = hart.config.atomic_segment && plan.nf > 1;

    let mut new_vl = None;
    'elems: for ix in vstart..plan.elems {
        let skip = plan.masked && !hart.vregs.is_element_active(ix, true);
        if skip {
            for field in 0..plan.nf {
                let addr = plan.elem_addr(hart, ix, field);
                record(
                    hart,
                    ElemDescriptor {
                        virt_addr: addr,
                        phys_addr1: addr,
                        phys_addr2: addr,
                        data: 0,
                        element_index: ix,
                        skipped: true,
                        field_index: field as u8,
                    },
                );
                let reg = plan.dest_reg(vd, field);
                hart.vregs.write_inactive(reg, ix, plan.data_eew, inactive);
            }
            continue;
        }
        // Staged field values, committed together in atomic-segment
        // mode
        let mut staged: Vec<(u32, u64)> = Vec::with_capacity(plan.nf as usize);
        for field in 0..plan.nf {
            let addr = plan.elem_addr(hart, ix, field);
            if hart.trigger_hit(addr, size) {
                hart.csr.vstart = ix;
                return Err(Exception::Breakpoint(addr));
            }
            let faulted = hart
                .translate(addr, size, MemAccessKind::Load)
                .and_then(|(pa1, pa2)| {
                    hart.check_pma(addr, size, MemAccessKind::Load)?;
                    Ok((pa1, pa2))
                });
            let (pa1, pa2) = match faulted {
                Ok(pa) => pa,
                Err(ex) => {
                    if fault_first && ix > 0 {
                        // Downgrade to a completion at the truncated
                        // length
                        new_vl = Some(ix);
                        break 'elems;
                    }
                    return Err(persist_fault(hart, ix, ex));
                }
            };
            let data = match hart.read_phys(pa1, size) {
                Ok(data) => data,
                Err(ex) => {
                    if fault_first && ix > 0 {
                        new_vl = Some(ix);
                        break 'elems;
                    }
                    return Err(persist_fault(hart, ix, ex));
                }
            };
            record(
                hart,
                ElemDescriptor {
                    virt_addr: addr,
                    phys_addr1: pa1,
                    phys_addr2: pa2,
                    data,
                    element_index: ix,
                    skipped: false,
                    field_index: field as u8,
                },
            );
            if atomic {
                staged.push((plan.dest_reg(vd, field), data));
            } else {
                hart.vregs
                    .write_uint(plan.dest_reg(vd, field), ix, plan.data_eew, data);
            }
        }
        for (reg, data) in staged {
            hart.vregs.write_uint(reg, ix, plan.data_eew, data);
        }
    }

    if let Some(vl) = new_vl {
        hart.csr.vl = vl;
        if hart.config.fault_first_tail_ones {
            for field in 0..plan.nf {
                let reg = plan.dest_reg(vd, field);
                hart.vregs.fill_tail(
                    reg,
                    vl,
                    plan.data_elems_cap,
                    plan.data_eew,
                    crate::vector::regs::ElemPolicy::AgnosticOnes,
                );
            }
        }
        return Ok(());
    }

    // Tail policy per field group; whole-register and mask loads have
    // no tail
    if !matches!(
        plan.pattern,
        AddrPattern::WholeReg { .. } | AddrPattern::MaskBytes
    ) {
        for field in 0..plan.nf {
            let reg = plan.dest_reg(vd, field);
            hart.vregs
                .fill_tail(reg, plan.elems, plan.data_elems_cap, plan.data_eew, tail);
        }
    }
    Ok(())
}

pub fn exec_store(hart: &mut Hart, instr: &VecInstr, access: MemAccess) -> Result<(), Exception> {
    let plan = plan(hart, instr, access, false)?;
    let vs3 = instr.vd(); // data source occupies the destination slot
    let size = u64::from(plan.data_eew / 8);
    let vstart = hart.csr.vstart;
    let atomic = hart.config.atomic_segment && plan.nf > 1;

    for ix in vstart..plan.elems {
        let skip = plan.masked && !hart.vregs.is_element_active(ix, true);
        if skip {
            for field in 0..plan.nf {
                let addr = plan.elem_addr(hart, ix, field);
                record(
                    hart,
                    ElemDescriptor {
                        virt_addr: addr,
                        phys_addr1: addr,
                        phys_addr2: addr,
                        data: 0,
                        element_index: ix,
                        skipped: true,
                        field_index: field as u8,
                    },
                );
            }
            continue;
        }
        if atomic {
            // Validate every field of the element before any write
            // becomes visible
            for field in 0..plan.nf {
                let addr = plan.elem_addr(hart, ix, field);
                if hart.trigger_hit(addr, size) {
                    hart.csr.vstart = ix;
                    return Err(Exception::Breakpoint(addr));
                }
                if let Err(ex) = hart
                    .translate(addr, size, MemAccessKind::Store)
                    .and_then(|_| hart.check_pma(addr, size, MemAccessKind::Store))
                {
                    return Err(persist_fault(hart, ix, ex));
                }
            }
        }
        for field in 0..plan.nf {
            let addr = plan.elem_addr(hart, ix, field);
            if !atomic {
                if hart.trigger_hit(addr, size) {
                    hart.csr.vstart = ix;
                    return Err(Exception::Breakpoint(addr));
                }
            }
            let faulted = hart
                .translate(addr, size, MemAccessKind::Store)
                .and_then(|(pa1, pa2)| {
                    hart.check_pma(addr, size, MemAccessKind::Store)?;
                    Ok((pa1, pa2))
                });
            let (pa1, pa2) = match faulted {
                Ok(pa) => pa,
                Err(ex) => return Err(persist_fault(hart, ix, ex)),
            };
            let data = hart
                .vregs
                .read_uint(vs3 + field * plan.group_regs, ix, plan.data_eew);
            if let Err(ex) = hart.write_phys(pa1, size, data) {
                return Err(persist_fault(hart, ix, ex));
            }
            record(
                hart,
                ElemDescriptor {
                    virt_addr: addr,
                    phys_addr1: pa1,
                    phys_addr2: pa2,
                    data,
                    element_index: ix,
                    skipped: false,
                    field_index: field as u8,
                },
            );
        }
    }
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
        hart.csr.vtype = VType::decode(2 << 3, 128);
        hart.csr.vl = vl;
        hart
    }

    fn unit(eew: u32) -> MemAccess {
        MemAccess {
            pattern: AddrPattern::UnitStride,
            eew_bits: eew,
        }
    }

    fn write_words(hart: &mut Hart, base: u64, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            hart.memory
                .write_bytes(base + 4 * i as u64, (*w).into(), 4)
                .unwrap();
        }
    }

    fn get_v32(hart: &Hart, reg: u32, n: usize) -> Vec<u32> {
        (0..n)
            .map(|i| hart.vregs.read_elem::<u32>(reg, i as u64))
            .collect()
    }

    #[test]
    fn check_unit_stride_load_store_round_trip() {
        let mut hart = hart_e32(4);
        write_words(&mut hart, 0x1000, &[0x11, 0x22, 0x33, 0x44]);
        hart.set_x(10, 0x1000);
        let load = VecInstr::load(unit(32), 4, 10, 0);
        exec_load(&mut hart, &load, unit(32)).unwrap();
        assert_eq!(get_v32(&hart, 4, 4), vec![0x11, 0x22, 0x33, 0x44]);

        hart.set_x(11, 0x2000);
        let store = VecInstr::store(unit(32), 4, 11, 0);
        exec_store(&mut hart, &store, unit(32)).unwrap();
        for i in 0..4u64 {
            assert_eq!(
                hart.memory.read_bytes(0x2000 + 4 * i, 4).unwrap(),
                [0x11u64, 0x22, 0x33, 0x44][i as usize]
            );
        }
    }

    /// S3: unmapped fourth word raises with vstart at the faulting
    /// element and the earlier elements committed.
    #[test]
    fn scenario_load_fault_persists_vstart() {
        let mut hart = hart_e32(4);
        write_words(&mut hart, 0xff4, &[0x11, 0x22, 0x33]);
        hart.add_page_fault_range(0x1000, 0x1fff);
        hart.set_x(10, 0xff4);
        hart.vregs.write_elem::<u32>(4, 3, 0xdead);
        let load = VecInstr::load(unit(32), 4, 10, 0);
        let err = exec_load(&mut hart, &load, unit(32)).unwrap_err();
        assert_eq!(err, Exception::LoadPageFault(0x1000));
        assert_eq!(hart.csr.vstart, 3);
        assert_eq!(get_v32(&hart, 4, 3), vec![0x11, 0x22, 0x33]);
        // The faulting element is unchanged
        assert_eq!(hart.vregs.read_elem::<u32>(4, 3), 0xdead);
    }

    /// S4: the fault-first form truncates vl instead of trapping.
    #[test]
    fn scenario_fault_first_truncates_vl() {
        let mut hart = hart_e32(4);
        write_words(&mut hart, 0xff4, &[0x11, 0x22, 0x33]);
        hart.add_page_fault_range(0x1000, 0x1fff);
        hart.set_x(10, 0xff4);
        let access = MemAccess {
            pattern: AddrPattern::FaultFirst,
            eew_bits: 32,
        };
        let load = VecInstr::load(access, 4, 10, 0);
        exec_load(&mut hart, &load, access).unwrap();
        assert_eq!(hart.csr.vl, 3);
        assert_eq!(get_v32(&hart, 4, 3), vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn check_fault_first_element_zero_still_traps() {
        let mut hart = hart_e32(4);
        hart.add_page_fault_range(0x1000, 0x1fff);
        hart.set_x(10, 0x1000);
        let access = MemAccess {
            pattern: AddrPattern::FaultFirst,
            eew_bits: 32,
        };
        let load = VecInstr::load(access, 4, 10, 0);
        assert_eq!(
            exec_load(&mut hart, &load, access),
            Err(Exception::LoadPageFault(0x1000))
        );
        assert_eq!(hart.csr.vl, 4);
    }

    #[test]
    fn check_fault_first_tail_ones_when_configured() {
        let mut hart = hart_e32(4);
        hart.config.fault_first_tail_ones = true;
        write_words(&mut hart, 0xffc, &[0x11]);
        hart.add_page_fault_range(0x1000, 0x1fff);
        hart.set_x(10, 0xffc);
        let access = MemAccess {
            pattern: AddrPattern::FaultFirst,
            eew_bits: 32,
        };
        let load = VecInstr::load(access, 4, 10, 0);
        exec_load(&mut hart, &load, access).unwrap();
        assert_eq!(hart.csr.vl, 1);
        assert_eq!(hart.vregs.read_elem::<u32>(4, 1), 0xffff_ffff);
        assert_eq!(hart.vregs.read_elem::<u32>(4, 3), 0xffff_ffff);
    }

    #[test]
    fn check_masked_elements_never_fault() {
        let mut hart = hart_e32(4);
        write_words(&mut hart, 0xff4, &[0x11, 0x22, 0x33]);
        hart.add_page_fault_range(0x1000, 0x1fff);
        hart.set_x(10, 0xff4);
        // Mask off the faulting element 3
        hart.vregs.write_elem::<u8>(0, 0, 0b0111);
        let load = VecInstr::load(unit(32), 4, 10, 0).masked();
        exec_load(&mut hart, &load, unit(32)).unwrap();
        assert_eq!(get_v32(&hart, 4, 3), vec![0x11, 0x22, 0x33]);
        let skipped: Vec<bool> = hart.descriptors.iter().map(|d| d.skipped).collect();
        assert_eq!(skipped, vec![false, false, false, true]);
    }

    #[test]
    fn check_strided_load_with_negative_and_zero_stride() {
        let mut hart = hart_e32(3);
        write_words(&mut hart, 0x1000, &[0xa0, 0xa1, 0xa2, 0xa3]);
        hart.set_x(10, 0x1008);
        hart.set_x(11, -4i64 as u64);
        let access = MemAccess {
            pattern: AddrPattern::Strided,
            eew_bits: 32,
        };
        let load = VecInstr::load(access, 4, 10, 11);
        exec_load(&mut hart, &load, access).unwrap();
        assert_eq!(get_v32(&hart, 4, 3), vec![0xa2, 0xa1, 0xa0]);

        // Zero stride broadcasts one word
        hart.set_x(11, 0);
        let load = VecInstr::load(access, 8, 10, 11);
        exec_load(&mut hart, &load, access).unwrap();
        assert_eq!(get_v32(&hart, 8, 3), vec![0xa2, 0xa2, 0xa2]);
    }

    #[test]
    fn check_indexed_load() {
        let mut hart = hart_e32(3);
        write_words(&mut hart, 0x1000, &[0xa0, 0xa1, 0xa2, 0xa3]);
        hart.set_x(10, 0x1000);
        // Byte offsets as u32 indices
        for (i, off) in [12u32, 0, 4].iter().enumerate() {
            hart.vregs.write_elem::<u32>(2, i as u64, *off);
        }
        let access = MemAccess {
            pattern: AddrPattern::IndexedOrdered,
            eew_bits: 32,
        };
        let load = VecInstr::load(access, 4, 10, 2);
        exec_load(&mut hart, &load, access).unwrap();
        assert_eq!(get_v32(&hart, 4, 3), vec![0xa3, 0xa0, 0xa1]);
    }

    #[test]
    fn check_indexed_store_scatter() {
        let mut hart = hart_e32(2);
        hart.set_x(10, 0x3000);
        for (i, off) in [8u32, 0].iter().enumerate() {
            hart.vregs.write_elem::<u32>(2, i as u64, *off);
        }
        hart.vregs.write_elem::<u32>(4, 0, 0x111);
        hart.vregs.write_elem::<u32>(4, 1, 0x222);
        let access = MemAccess {
            pattern: AddrPattern::IndexedUnordered,
            eew_bits: 32,
        };
        let store = VecInstr::store(access, 4, 10, 2);
        exec_store(&mut hart, &store, access).unwrap();
        assert_eq!(hart.memory.read_bytes(0x3008, 4).unwrap(), 0x111);
        assert_eq!(hart.memory.read_bytes(0x3000, 4).unwrap(), 0x222);
    }

    #[test]
    fn check_segment_load_interleaves_fields() {
        let mut hart = hart_e32(2);
        // Two elements of {x, y, z} word triples
        write_words(&mut hart, 0x1000, &[1, 2, 3, 4, 5, 6]);
        hart.set_x(10, 0x1000);
        let load = VecInstr::load(unit(32), 4, 10, 0).fields(3);
        exec_load(&mut hart, &load, unit(32)).unwrap();
        assert_eq!(get_v32(&hart, 4, 2), vec![1, 4]); // field 0
        assert_eq!(get_v32(&hart, 5, 2), vec![2, 5]); // field 1
        assert_eq!(get_v32(&hart, 6, 2), vec![3, 6]); // field 2
    }

    #[test]
    fn check_segment_store_interleaves_fields() {
        let mut hart = hart_e32(2);
        hart.set_x(10, 0x2000);
        for (reg, vals) in [(4u32, [1u32, 4]), (5, [2, 5]), (6, [3, 6])] {
            for (i, v) in vals.iter().enumerate() {
                hart.vregs.write_elem::<u32>(reg, i as u64, *v);
            }
        }
        let store = VecInstr::store(unit(32), 4, 10, 0).fields(3);
        exec_store(&mut hart, &store, unit(32)).unwrap();
        let got: Vec<u64> = (0..6)
            .map(|i| hart.memory.read_bytes(0x2000 + 4 * i, 4).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5, 6]);
    }

    /// Property 7: in atomic-segment mode a faulting element leaves
    /// its earlier fields unwritten.
    #[test]
    fn check_segment_atomic_rollback() {
        let mut hart = hart_e32(2);
        hart.config.atomic_segment = true;
        // Element 0 fully mapped; element 1's second field faults
        write_words(&mut hart, 0xff0, &[1, 2, 3]);
        hart.add_page_fault_range(0xffc, 0xfff);
        hart.set_x(10, 0xff0);
        hart.vregs.write_elem::<u32>(4, 1, 0xaaaa);
        hart.vregs.write_elem::<u32>(5, 1, 0xbbbb);
        let load = VecInstr::load(unit(32), 4, 10, 0).fields(2);
        let err = exec_load(&mut hart, &load, unit(32)).unwrap_err();
        assert_eq!(err, Exception::LoadPageFault(0xffc));
        assert_eq!(hart.csr.vstart, 1);
        // Element 0 committed both fields
        assert_eq!(hart.vregs.read_elem::<u32>(4, 0), 1);
        assert_eq!(hart.vregs.read_elem::<u32>(5, 0), 2);
        // Element 1 rolled back entirely, including the field that
        // had already been read
        assert_eq!(hart.vregs.read_elem::<u32>(4, 1), 0xaaaa);
        assert_eq!(hart.vregs.read_elem::<u32>(5, 1), 0xbbbb);
    }

    #[test]
    fn check_segment_nonatomic_partial_element() {
        let mut hart = hart_e32(2);
        write_words(&mut hart, 0xff0, &[1, 2, 3]);
        hart.add_page_fault_range(0xffc, 0xfff);
        hart.set_x(10, 0xff0);
        hart.vregs.write_elem::<u32>(4, 1, 0xaaaa);
        let load = VecInstr::load(unit(32), 4, 10, 0).fields(2);
        exec_load(&mut hart, &load, unit(32)).unwrap_err();
        // Without atomic mode the first field of the faulting element
        // was already written
        assert_eq!(hart.vregs.read_elem::<u32>(4, 1), 3);
    }

    #[test]
    fn check_segment_register_limit() {
        let mut hart = hart_e32(2);
        hart.csr.vtype = VType::decode((2 << 3) | 1, 128); // e32 m2
        hart.csr.vl = 2;
        hart.set_x(10, 0x1000);
        // nf=5 at emul 2 needs 10 registers: illegal
        let load = VecInstr::load(unit(32), 4, 10, 0).fields(5);
        assert_eq!(
            exec_load(&mut hart, &load, unit(32)),
            Err(Exception::IllegalInstruction)
        );
    }

    #[test]
    fn check_whole_register_load_and_store() {
        let mut hart = hart_e32(0); // vl ignored
        for i in 0..8u64 {
            hart.memory
                .write_bytes(0x1000 + 4 * i, 0x100 + i, 4)
                .unwrap();
        }
        hart.set_x(10, 0x1000);
        let access = MemAccess {
            pattern: AddrPattern::WholeReg { nregs: 2 },
            eew_bits: 32,
        };
        let load = VecInstr::load(access, 8, 10, 0);
        exec_load(&mut hart, &load, access).unwrap();
        assert_eq!(get_v32(&hart, 8, 4), vec![0x100, 0x101, 0x102, 0x103]);
        assert_eq!(get_v32(&hart, 9, 4), vec![0x104, 0x105, 0x106, 0x107]);

        hart.set_x(11, 0x4000);
        let store = VecInstr::store(access, 8, 11, 0);
        exec_store(&mut hart, &store, access).unwrap();
        assert_eq!(hart.memory.read_bytes(0x4000 + 28, 4).unwrap(), 0x107);
    }

    #[test]
    fn check_whole_register_alignment() {
        let mut hart = hart_e32(0);
        hart.set_x(10, 0x1000);
        let access = MemAccess {
            pattern: AddrPattern::WholeReg { nregs: 4 },
            eew_bits: 32,
        };
        let load = VecInstr::load(access, 6, 10, 0);
        assert_eq!(
            exec_load(&mut hart, &load, access),
            Err(Exception::IllegalInstruction)
        );
    }

    #[test]
    fn check_mask_load_store_byte_count() {
        let mut hart = hart_e32(12); // ceil(12/8) = 2 bytes
        hart.memory.write_bytes(0x1000, 0xabcd, 2).unwrap();
        hart.set_x(10, 0x1000);
        let access = MemAccess {
            pattern: AddrPattern::MaskBytes,
            eew_bits: 8,
        };
        let load = VecInstr::load(access, 4, 10, 0);
        exec_load(&mut hart, &load, access).unwrap();
        assert_eq!(hart.vregs.read_elem::<u8>(4, 0), 0xcd);
        assert_eq!(hart.vregs.read_elem::<u8>(4, 1), 0xab);
        assert_eq!(hart.vregs.read_elem::<u8>(4, 2), 0);

        hart.set_x(11, 0x2000);
        let store = VecInstr::store(access, 4, 11, 0);
        exec_store(&mut hart, &store, access).unwrap();
        assert_eq!(hart.memory.read_bytes(0x2000, 2).unwrap(), 0xabcd);
        assert_eq!(hart.memory.read_bytes(0x2002, 1).unwrap(), 0);
    }

    #[test]
    fn check_trigger_halts_before_access() {
        let mut hart = hart_e32(4);
        write_words(&mut hart, 0x1000, &[1, 2, 3, 4]);
        hart.add_trigger_range(0x1008, 0x100b);
        hart.set_x(10, 0x1000);
        hart.vregs.write_elem::<u32>(4, 2, 0x5555);
        let load = VecInstr::load(unit(32), 4, 10, 0);
        let err = exec_load(&mut hart, &load, unit(32)).unwrap_err();
        assert_eq!(err, Exception::Breakpoint(0x1008));
        assert_eq!(hart.csr.vstart, 2);
        // No side effect for the triggering element
        assert_eq!(hart.vregs.read_elem::<u32>(4, 2), 0x5555);
    }

    #[test]
    fn check_store_fault_persists_vstart() {
        let mut hart = hart_e32(4);
        hart.add_page_fault_range(0x1008, 0x1fff);
        hart.set_x(10, 0x1000);
        let store = VecInstr::store(unit(32), 4, 10, 0);
        let err = exec_store(&mut hart, &store, unit(32)).unwrap_err();
        assert_eq!(err, Exception::StorePageFault(0x1008));
        assert_eq!(hart.csr.vstart, 2);
        // Earlier elements were written
        assert_eq!(hart.memory.read_bytes(0x1000, 4).unwrap(), 0);
    }

    #[test]
    fn check_vstart_resume_skips_completed_elements() {
        let mut hart = hart_e32(4);
        write_words(&mut hart, 0x1000, &[9, 9, 9, 9]);
        hart.csr.vstart = 2;
        hart.set_x(10, 0x1000);
        hart.vregs.write_elem::<u32>(4, 0, 0x77);
        let load = VecInstr::load(unit(32), 4, 10, 0);
        exec_load(&mut hart, &load, unit(32)).unwrap();
        // Prestart element untouched
        assert_eq!(hart.vregs.read_elem::<u32>(4, 0), 0x77);
        assert_eq!(hart.vregs.read_elem::<u32>(4, 2), 9);
    }

    #[test]
    fn check_descriptor_page_cross() {
        let mut hart = hart_e32(1);
        hart.set_x(10, 0xffe);
        let load = VecInstr::load(unit(32), 4, 10, 0);
        exec_load(&mut hart, &load, unit(32)).unwrap();
        assert_eq!(hart.descriptors.len(), 1);
        assert_eq!(hart.descriptors[0].phys_addr1, 0xffe);
        assert_eq!(hart.descriptors[0].phys_addr2, 0x1000);
    }

    #[test]
    fn check_fault_first_store_rejected() {
        let mut hart = hart_e32(4);
        let access = MemAccess {
            pattern: AddrPattern::FaultFirst,
            eew_bits: 32,
        };
        let store = VecInstr::store(access, 4, 10, 0);
        assert_eq!(
            exec_store(&mut hart, &store, access),
            Err(Exception::IllegalInstruction)
        );
    }

    #[test]
    fn check_load_from_mmr_applies_write_semantics() {
        use crate::pma::Pma;
        let mut hart = hart_e32(1);
        hart.pma.define_region(
            0,
            0x8000,
            0x8fff,
            Pma::new(Pma::READ | Pma::WRITE | Pma::MEM_MAPPED),
        );
        assert!(hart
            .pma
            .define_mmr(0x8000, !0, 4, Pma::new(Pma::READ | Pma::WRITE)));
        hart.pma.write_mmr(0x8000, crate::memory::Wordsize::Word, 0x1234_5678);
        hart.set_x(10, 0x8000);
        let load = VecInstr::load(unit(32), 4, 10, 0);
        exec_load(&mut hart, &load, unit(32)).unwrap();
        assert_eq!(hart.vregs.read_elem::<u32>(4, 0), 0x1234_5678);
    }
}
