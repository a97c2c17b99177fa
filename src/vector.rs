//! Vector execution core
//!
//! The entry point is [`execute`], which takes the hart and one
//! decoded vector instruction, runs the legality checks, and
//! dispatches to the engine for the opcode family. Engines iterate
//! over the body `[vstart, vl)`, reading and writing the vector
//! register file, then apply the tail policy; the memory engine
//! additionally walks the PMA map for every element.

use crate::hart::{Exception, Hart};
use crate::instr::{OperandKind, SetVlKind, VecInstr, VecOp};
use crate::vector::regs::ElemPolicy;
use crate::vector::vtype::{compute_vl, AvlRequest, VType};

pub mod arith;
pub mod check;
pub mod fixed;
pub mod fp;
pub mod mask_ops;
pub mod mem;
pub mod permute;
pub mod reduce;
pub mod regs;
pub mod vtype;

/// Per-hart configuration of the vector core.
#[derive(Debug, Clone)]
pub struct VecConfig {
    /// VLEN in bits; a power of two
    pub vlen_bits: u32,
    /// On an illegal vset* configuration: trap (true) or set vill,
    /// zero the type fields and continue (false)
    pub trap_on_vill: bool,
    /// vset* with rd == 0 and rs1 == 0 when vlmax changes: legalize
    /// vl to the new vlmax (true) or raise illegal instruction
    /// (false)
    pub keep_vl_on_config_change: bool,
    /// Trap when vstart exceeds vlmax for the configuration in use
    pub strict_vstart: bool,
    /// Whether mask-agnostic lanes are overwritten with ones (the
    /// alternative leaves them undisturbed, which agnostic permits)
    pub mask_agnostic_ones: bool,
    /// Whether tail-agnostic lanes are overwritten with ones
    pub tail_agnostic_ones: bool,
    /// Whole-register moves and loads/stores remain legal under vill
    pub vill_whole_reg_ops_ok: bool,
    /// All fields of a segment element commit together or not at all
    pub atomic_segment: bool,
    /// Mask-logical operations write all VLEN bits instead of vl bits
    pub update_whole_mask: bool,
    /// Fill the truncated tail with ones after a fault-first load
    pub fault_first_tail_ones: bool,
}

impl Default for VecConfig {
    fn default() -> Self {
        Self {
            vlen_bits: 128,
            trap_on_vill: false,
            keep_vl_on_config_change: true,
            strict_vstart: false,
            mask_agnostic_ones: true,
            tail_agnostic_ones: true,
            vill_whole_reg_ops_ok: true,
            atomic_segment: false,
            update_whole_mask: false,
            fault_first_tail_ones: false,
        }
    }
}

/// The masked-off and tail lane policies in force for one
/// instruction, resolved once at entry.
pub(crate) fn policies(hart: &Hart) -> (ElemPolicy, ElemPolicy) {
    let vtype = hart.csr.vtype;
    let inactive = if vtype.ma && hart.config.mask_agnostic_ones {
        ElemPolicy::AgnosticOnes
    } else {
        ElemPolicy::Undisturbed
    };
    let tail = if vtype.ta && hart.config.tail_agnostic_ones {
        ElemPolicy::AgnosticOnes
    } else {
        ElemPolicy::Undisturbed
    };
    (inactive, tail)
}

/// The scalar operand of a .vx/.vi form, raw (engines truncate or
/// sign-interpret at their element width).
pub(crate) fn scalar_operand(hart: &Hart, instr: &VecInstr) -> u64 {
    match instr.kinds[1] {
        OperandKind::IntReg => hart.x(instr.rs1()),
        OperandKind::Imm => instr.imm as u64,
        OperandKind::FpReg => hart
            .fregs
            .read_boxed(instr.rs1(), hart.csr.vtype.sew.bits()),
        _ => 0,
    }
}

/// vlmax of the configuration currently in vtype.
pub(crate) fn current_vlmax(hart: &Hart) -> u64 {
    hart.csr.vtype.vlmax(hart.config.vlen_bits)
}

/// Execute one decoded vector instruction against the hart.
pub fn execute(hart: &mut Hart, instr: &VecInstr) -> Result<(), Exception> {
    hart.begin_instruction();
    fp::clear_flags();

    if hart.trace {
        println!("vector: executing {:?}", instr.op);
    }

    if let VecOp::SetVl(kind) = instr.op {
        return exec_setvl(hart, instr, kind);
    }

    check::check_common(hart, instr)?;

    let result = match instr.op {
        VecOp::SetVl(_) => unreachable!("handled above"),
        VecOp::Int(op) => arith::exec_int(hart, instr, op),
        VecOp::Widen(op) => arith::exec_widen(hart, instr, op),
        VecOp::NarrowShift(op) => arith::exec_narrow_shift(hart, instr, op),
        VecOp::Ext(kind) => arith::exec_ext(hart, instr, kind),
        VecOp::Carry(op) => arith::exec_carry(hart, instr, op),
        VecOp::Cmp(op) => arith::exec_cmp(hart, instr, op),
        VecOp::Merge => arith::exec_merge(hart, instr),
        VecOp::Fixed(op) => fixed::exec(hart, instr, op),
        VecOp::Fp(op) => fp::exec(hart, instr, op),
        VecOp::FpCmp(op) => fp::exec_cmp(hart, instr, op),
        VecOp::FpCvt(op) => fp::exec_cvt(hart, instr, op),
        VecOp::FpMerge => fp::exec_merge(hart, instr),
        VecOp::Reduce(op) => reduce::exec(hart, instr, op),
        VecOp::MaskLogical(op) => mask_ops::exec_logical(hart, instr, op),
        VecOp::MaskScan(op) => mask_ops::exec_scan(hart, instr, op),
        VecOp::Gather(kind) => permute::exec_gather(hart, instr, kind),
        VecOp::Compress => permute::exec_compress(hart, instr),
        VecOp::Slide(kind) => permute::exec_slide(hart, instr, kind),
        VecOp::MvXs => permute::exec_mv_xs(hart, instr),
        VecOp::MvSx => permute::exec_mv_sx(hart, instr),
        VecOp::FmvFs => permute::exec_fmv_fs(hart, instr),
        VecOp::FmvSf => permute::exec_fmv_sf(hart, instr),
        VecOp::WholeMove { nregs } => permute::exec_whole_move(hart, instr, nregs),
        VecOp::Load(access) => mem::exec_load(hart, instr, access),
        VecOp::Store(access) => mem::exec_store(hart, instr, access),
    };

    match result {
        Ok(()) => {
            // Successful completion clears vstart and accrues the FP
            // flags collected over the element loop.
            hart.csr.vstart = 0;
            let flags = fp::take_flags();
            hart.csr.accrue_fflags(flags);
            hart.csr.mark_vs_dirty();
            Ok(())
        }
        Err(ex) => {
            // Fault paths have already persisted vstart where the
            // architecture requires it; legality failures left all
            // state untouched.
            if hart.trace {
                println!("vector: raised {ex}");
            }
            Err(ex)
        }
    }
}

/// vsetvli / vsetivli / vsetvl.
fn exec_setvl(hart: &mut Hart, instr: &VecInstr, kind: SetVlKind) -> Result<(), Exception> {
    let vtype_value = match kind {
        SetVlKind::Vsetvli | SetVlKind::Vsetivli => instr.imm as u64,
        SetVlKind::Vsetvl => hart.x(instr.rs2()),
    };
    let new_vtype = VType::decode(vtype_value, hart.config.vlen_bits);

    if new_vtype.vill {
        if hart.config.trap_on_vill {
            return Err(Exception::IllegalInstruction);
        }
        // Zero the type fields, set vill, zero vl, and continue
        hart.csr.vtype = new_vtype;
        hart.csr.vl = 0;
        hart.csr.vstart = 0;
        hart.set_x(instr.rd(), 0);
        hart.csr.mark_vs_dirty();
        return Ok(());
    }

    let new_vlmax = new_vtype.vlmax(hart.config.vlen_bits);
    let request = match kind {
        SetVlKind::Vsetivli => AvlRequest::Value(instr.rs1().into()),
        _ => {
            let rd = instr.rd();
            let rs1 = instr.rs1();
            if rs1 != 0 {
                AvlRequest::Value(hart.x(rs1))
            } else if rd != 0 {
                AvlRequest::SetMax
            } else {
                AvlRequest::KeepVl
            }
        }
    };

    if request == AvlRequest::KeepVl {
        let old_vlmax = current_vlmax(hart);
        if old_vlmax != new_vlmax && !hart.config.keep_vl_on_config_change {
            return Err(Exception::IllegalInstruction);
        }
    }

    let mut vl = compute_vl(request, hart.csr.vl, new_vlmax);
    if request == AvlRequest::KeepVl {
        vl = vl.min(new_vlmax);
    }

    hart.csr.vtype = new_vtype;
    hart.csr.vl = vl;
    hart.csr.vstart = 0;
    hart.set_x(instr.rd(), vl);
    hart.csr.mark_vs_dirty();
    Ok(())
}
