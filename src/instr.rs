//! Decoded vector instructions
//!
//! Decoding proper happens upstream; the engines receive the decoded
//! record defined here. The record carries up to four operands with
//! their kinds, the mask flag, the segment field count and the
//! immediate. Which operand slot means what is fixed by convention:
//!
//! * slot 0 — destination (vector or integer/FP register)
//! * slot 1 — vs1 / rs1 / fs1, or the immediate for `.vi` forms
//! * slot 2 — vs2 / rs2 (for memory ops: the stride or index register)
//! * slot 3 — extra source (store data register, FMA addend)
//!
//! For loads and stores slot 0 is the data register group, slot 1 the
//! base-address register.

/// What an operand slot holds.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum OperandKind {
    #[default]
    None,
    IntReg,
    FpReg,
    VecReg,
    MaskReg,
    Imm,
}

/// vsetvli / vsetivli / vsetvl
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetVlKind {
    Vsetvli,
    Vsetivli,
    Vsetvl,
}

/// Single-width integer element operations
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Rsub,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sra,
    Minu,
    Min,
    Maxu,
    Max,
    Mul,
    Mulh,
    Mulhu,
    Mulhsu,
    Macc,
    Nmsac,
    Madd,
    Nmsub,
    Divu,
    Div,
    Remu,
    Rem,
}

/// Widening integer operations (destination EEW is 2x SEW). The `W`
/// suffixed variants read a wide first source.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WidenOp {
    Waddu,
    Wadd,
    Wsubu,
    Wsub,
    WadduW,
    WaddW,
    WsubuW,
    WsubW,
    Wmul,
    Wmulu,
    Wmulsu,
    Wmaccu,
    Wmacc,
    Wmaccsu,
    Wmaccus,
}

/// Narrowing shifts (source EEW is 2x SEW)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NarrowShiftOp {
    Nsrl,
    Nsra,
}

/// Integer extension ratios for vzext/vsext
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExtKind {
    Zext2,
    Sext2,
    Zext4,
    Sext4,
    Zext8,
    Sext8,
}

impl ExtKind {
    pub fn ratio(&self) -> u32 {
        match self {
            ExtKind::Zext2 | ExtKind::Sext2 => 2,
            ExtKind::Zext4 | ExtKind::Sext4 => 4,
            ExtKind::Zext8 | ExtKind::Sext8 => 8,
        }
    }

    pub fn signed(&self) -> bool {
        matches!(self, ExtKind::Sext2 | ExtKind::Sext4 | ExtKind::Sext8)
    }
}

/// Carry/borrow family. `vadc`/`vsbc` always consume the carry in v0;
/// the mask-producing `vmadc`/`vmsbc` may or may not.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CarryOp {
    Adc,
    Sbc,
    Madc { carry: bool },
    Msbc { borrow: bool },
}

/// Integer compares producing mask bits
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CmpOp {
    Seq,
    Sne,
    Sltu,
    Slt,
    Sleu,
    Sle,
    Sgtu,
    Sgt,
}

/// Fixed-point operations (saturating, averaging, scaling)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FixedOp {
    Saddu,
    Sadd,
    Ssubu,
    Ssub,
    Aaddu,
    Aadd,
    Asubu,
    Asub,
    Smul,
    Ssrl,
    Ssra,
    Nclipu,
    Nclip,
}

/// Floating-point arithmetic
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FpOp {
    Add,
    Sub,
    Rsub,
    Mul,
    Div,
    Rdiv,
    Min,
    Max,
    Macc,
    Nmacc,
    Msac,
    Nmsac,
    Madd,
    Nmadd,
    Msub,
    Nmsub,
    Wadd,
    Wsub,
    WaddW,
    WsubW,
    Wmul,
    Wmacc,
    Wnmacc,
    Wmsac,
    Wnmsac,
    WmaccBf16,
    Sqrt,
    Rsqrt7,
    Rec7,
    Class,
    Sgnj,
    Sgnjn,
    Sgnjx,
}

/// Floating-point compares producing mask bits
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FpCmpOp {
    Feq,
    Fne,
    Flt,
    Fle,
    Fgt,
    Fge,
}

/// Conversions. `W`-prefixed write 2x-SEW results, `N`-prefixed read
/// 2x-SEW sources.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CvtOp {
    FToU,
    FToI,
    FToURtz,
    FToIRtz,
    UToF,
    IToF,
    WFToU,
    WFToI,
    WFToURtz,
    WFToIRtz,
    WUToF,
    WIToF,
    WFToF,
    NFToU,
    NFToI,
    NFToURtz,
    NFToIRtz,
    NUToF,
    NIToF,
    NFToF,
    NFToFRod,
    WBf16ToF,
    NFToBf16,
}

/// Reductions: vd[0] = op(vs1[0], elements of vs2 over the body)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Maxu,
    Max,
    Minu,
    Min,
    And,
    Or,
    Xor,
    Wsumu,
    Wsum,
    FOsum,
    FUsum,
    FMin,
    FMax,
    FWOsum,
    FWUsum,
}

impl ReduceOp {
    pub fn is_fp(&self) -> bool {
        matches!(
            self,
            ReduceOp::FOsum
                | ReduceOp::FUsum
                | ReduceOp::FMin
                | ReduceOp::FMax
                | ReduceOp::FWOsum
                | ReduceOp::FWUsum
        )
    }

    pub fn widening(&self) -> bool {
        matches!(
            self,
            ReduceOp::Wsumu | ReduceOp::Wsum | ReduceOp::FWOsum | ReduceOp::FWUsum
        )
    }
}

/// Mask-register logical operations (mm forms)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MaskBitOp {
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Xnor,
    Andn,
    Orn,
}

/// Mask traversal operations
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MaskScanOp {
    Cpop,
    First,
    Sbf,
    Sif,
    Sof,
    Iota,
    Id,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GatherKind {
    VV,
    VX,
    VI,
    EI16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlideKind {
    Up,
    Down,
    Up1,
    Down1,
    FUp1,
    FDown1,
}

/// Addressing pattern of a vector load or store
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddrPattern {
    UnitStride,
    /// Unit-stride fault-only-first (loads only)
    FaultFirst,
    Strided,
    IndexedOrdered,
    IndexedUnordered,
    WholeReg { nregs: u8 },
    /// vlm.v / vsm.v: ceil(vl/8) bytes
    MaskBytes,
}

/// A vector memory access: the addressing pattern plus the encoded
/// element width. For indexed patterns `eew_bits` is the width of the
/// index elements; the data elements use SEW.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemAccess {
    pub pattern: AddrPattern,
    pub eew_bits: u32,
}

/// Operation selector for the vector engines
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VecOp {
    SetVl(SetVlKind),
    Int(IntOp),
    Widen(WidenOp),
    NarrowShift(NarrowShiftOp),
    Ext(ExtKind),
    Carry(CarryOp),
    Cmp(CmpOp),
    /// vmerge.vvm/vxm/vim and the unmasked vmv.v.v/x/i
    Merge,
    Fixed(FixedOp),
    Fp(FpOp),
    FpCmp(FpCmpOp),
    FpCvt(CvtOp),
    /// vfmerge.vfm and the unmasked vfmv.v.f
    FpMerge,
    Reduce(ReduceOp),
    MaskLogical(MaskBitOp),
    MaskScan(MaskScanOp),
    Gather(GatherKind),
    Compress,
    Slide(SlideKind),
    MvXs,
    MvSx,
    FmvFs,
    FmvSf,
    WholeMove { nregs: u8 },
    Load(MemAccess),
    Store(MemAccess),
}

/// The decoded-instruction record handed to the engines.
#[derive(Debug, Clone)]
pub struct VecInstr {
    pub op: VecOp,
    pub operands: [u32; 4],
    pub kinds: [OperandKind; 4],
    pub masked: bool,
    /// Segment field count; 1 for non-segment accesses
    pub field_count: u8,
    pub imm: i64,
}

impl VecInstr {
    fn base(op: VecOp) -> Self {
        Self {
            op,
            operands: [0; 4],
            kinds: [OperandKind::None; 4],
            masked: false,
            field_count: 1,
            imm: 0,
        }
    }

    /// vector-vector form: op vd, vs2, vs1
    pub fn vv(op: VecOp, vd: u32, vs2: u32, vs1: u32) -> Self {
        let mut instr = Self::base(op);
        instr.operands = [vd, vs1, vs2, 0];
        instr.kinds = [
            OperandKind::VecReg,
            OperandKind::VecReg,
            OperandKind::VecReg,
            OperandKind::None,
        ];
        instr
    }

    /// vector-scalar form: op vd, vs2, rs1
    pub fn vx(op: VecOp, vd: u32, vs2: u32, rs1: u32) -> Self {
        let mut instr = Self::base(op);
        instr.operands = [vd, rs1, vs2, 0];
        instr.kinds = [
            OperandKind::VecReg,
            OperandKind::IntReg,
            OperandKind::VecReg,
            OperandKind::None,
        ];
        instr
    }

    /// vector-immediate form: op vd, vs2, imm
    pub fn vi(op: VecOp, vd: u32, vs2: u32, imm: i64) -> Self {
        let mut instr = Self::base(op);
        instr.operands = [vd, 0, vs2, 0];
        instr.kinds = [
            OperandKind::VecReg,
            OperandKind::Imm,
            OperandKind::VecReg,
            OperandKind::None,
        ];
        instr.imm = imm;
        instr
    }

    /// vector-fp-scalar form: op vd, vs2, fs1
    pub fn vf(op: VecOp, vd: u32, vs2: u32, fs1: u32) -> Self {
        let mut instr = Self::base(op);
        instr.operands = [vd, fs1, vs2, 0];
        instr.kinds = [
            OperandKind::VecReg,
            OperandKind::FpReg,
            OperandKind::VecReg,
            OperandKind::None,
        ];
        instr
    }

    /// Single-vector-source form (conversions, extensions, sqrt...)
    pub fn v(op: VecOp, vd: u32, vs2: u32) -> Self {
        let mut instr = Self::base(op);
        instr.operands = [vd, 0, vs2, 0];
        instr.kinds = [
            OperandKind::VecReg,
            OperandKind::None,
            OperandKind::VecReg,
            OperandKind::None,
        ];
        instr
    }

    /// vsetvli rd, rs1, vtypei / vsetivli rd, uimm, vtypei /
    /// vsetvl rd, rs1, rs2. The vtype immediate goes in imm for the
    /// immediate forms; vsetvl reads it from the register in slot 2.
    /// For vsetivli, slot 1 holds the AVL immediate.
    pub fn setvl(kind: SetVlKind, rd: u32, rs1: u32, arg: i64) -> Self {
        let mut instr = Self::base(VecOp::SetVl(kind));
        let rs2 = if kind == SetVlKind::Vsetvl {
            arg as u32
        } else {
            0
        };
        instr.operands = [rd, rs1, rs2, 0];
        instr.kinds = [
            OperandKind::IntReg,
            if kind == SetVlKind::Vsetivli {
                OperandKind::Imm
            } else {
                OperandKind::IntReg
            },
            if kind == SetVlKind::Vsetvl {
                OperandKind::IntReg
            } else {
                OperandKind::Imm
            },
            OperandKind::None,
        ];
        if kind != SetVlKind::Vsetvl {
            instr.imm = arg;
        }
        instr
    }

    /// Load: pattern-specific; vd data group, rs1 base, slot 2 the
    /// stride register or index vector where applicable.
    pub fn load(access: MemAccess, vd: u32, rs1: u32, op2: u32) -> Self {
        let mut instr = Self::base(VecOp::Load(access));
        instr.operands = [vd, rs1, op2, 0];
        instr.kinds = [
            OperandKind::VecReg,
            OperandKind::IntReg,
            match access.pattern {
                AddrPattern::Strided => OperandKind::IntReg,
                AddrPattern::IndexedOrdered | AddrPattern::IndexedUnordered => OperandKind::VecReg,
                _ => OperandKind::None,
            },
            OperandKind::None,
        ];
        instr
    }

    /// Store: vs3 data group in slot 0 by the destination-slot
    /// convention, rs1 base, slot 2 as for loads.
    pub fn store(access: MemAccess, vs3: u32, rs1: u32, op2: u32) -> Self {
        let mut instr = Self::load(access, vs3, rs1, op2);
        instr.op = VecOp::Store(access);
        instr
    }

    pub fn masked(mut self) -> Self {
        self.masked = true;
        self
    }

    pub fn fields(mut self, n: u8) -> Self {
        self.field_count = n;
        self
    }

    pub fn vd(&self) -> u32 {
        self.operands[0]
    }

    pub fn rd(&self) -> u32 {
        self.operands[0]
    }

    pub fn vs1(&self) -> u32 {
        self.operands[1]
    }

    pub fn rs1(&self) -> u32 {
        self.operands[1]
    }

    pub fn vs2(&self) -> u32 {
        self.operands[2]
    }

    pub fn rs2(&self) -> u32 {
        self.operands[2]
    }

    pub fn vs3(&self) -> u32 {
        self.operands[3]
    }
}
