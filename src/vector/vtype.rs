//! Vector type state
//!
//! The decoded `vtype` register: selected element width, group
//! multiplier, tail/mask policies and the illegal-configuration flag,
//! together with the `vlmax` derivation every configuration and
//! legality question reduces to.
//!
//! The `vtype` CSR layout (both XLENs): bits 2:0 `vlmul`, bits 5:3
//! `vsew`, bit 6 `vta`, bit 7 `vma`, reserved bits above, `vill` in
//! the top bit.

use crate::utils::extract_field;

/// Selected element width
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Sew {
    #[default]
    E8,
    E16,
    E32,
    E64,
}

impl Sew {
    pub fn bits(&self) -> u32 {
        match self {
            Sew::E8 => 8,
            Sew::E16 => 16,
            Sew::E32 => 32,
            Sew::E64 => 64,
        }
    }

    pub fn bytes(&self) -> u32 {
        self.bits() / 8
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Sew::E8),
            16 => Some(Sew::E16),
            32 => Some(Sew::E32),
            64 => Some(Sew::E64),
            _ => None,
        }
    }

    /// The vsew field encoding (0..3); encodings 4..7 are reserved.
    fn from_encoding(enc: u64) -> Option<Self> {
        match enc {
            0 => Some(Sew::E8),
            1 => Some(Sew::E16),
            2 => Some(Sew::E32),
            3 => Some(Sew::E64),
            _ => None,
        }
    }

    fn encoding(&self) -> u64 {
        match self {
            Sew::E8 => 0,
            Sew::E16 => 1,
            Sew::E32 => 2,
            Sew::E64 => 3,
        }
    }
}

/// Group multiplier, including the fractional settings
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Lmul {
    F8,
    F4,
    F2,
    #[default]
    M1,
    M2,
    M4,
    M8,
}

impl Lmul {
    /// Numerator of the multiplier as a fraction
    pub fn num(&self) -> u32 {
        match self {
            Lmul::F8 | Lmul::F4 | Lmul::F2 | Lmul::M1 => 1,
            Lmul::M2 => 2,
            Lmul::M4 => 4,
            Lmul::M8 => 8,
        }
    }

    /// Denominator of the multiplier as a fraction
    pub fn den(&self) -> u32 {
        match self {
            Lmul::F8 => 8,
            Lmul::F4 => 4,
            Lmul::F2 => 2,
            _ => 1,
        }
    }

    /// Number of registers in a group (1 for fractional settings)
    pub fn reg_count(&self) -> u32 {
        self.num()
    }

    /// Register-number alignment required of operands at this
    /// multiplier (1 for fractional settings).
    pub fn alignment(&self) -> u32 {
        self.num()
    }

    /// The vlmul field encoding; 0b100 is reserved.
    fn from_encoding(enc: u64) -> Option<Self> {
        match enc {
            0b000 => Some(Lmul::M1),
            0b001 => Some(Lmul::M2),
            0b010 => Some(Lmul::M4),
            0b011 => Some(Lmul::M8),
            0b101 => Some(Lmul::F8),
            0b110 => Some(Lmul::F4),
            0b111 => Some(Lmul::F2),
            _ => None,
        }
    }

    fn encoding(&self) -> u64 {
        match self {
            Lmul::M1 => 0b000,
            Lmul::M2 => 0b001,
            Lmul::M4 => 0b010,
            Lmul::M8 => 0b011,
            Lmul::F8 => 0b101,
            Lmul::F4 => 0b110,
            Lmul::F2 => 0b111,
        }
    }

    /// The effective multiplier for an operand of width eew_bits when
    /// the configuration is (sew, self): emul = lmul * eew / sew.
    /// None if the result falls outside [1/8, 8].
    pub fn emul(&self, sew_bits: u32, eew_bits: u32) -> Option<Lmul> {
        // emul = (num/den) * eew/sew as a reduced fraction
        let num = self.num() * eew_bits;
        let den = self.den() * sew_bits;
        let g = gcd(num, den);
        match (num / g, den / g) {
            (1, 8) => Some(Lmul::F8),
            (1, 4) => Some(Lmul::F4),
            (1, 2) => Some(Lmul::F2),
            (1, 1) => Some(Lmul::M1),
            (2, 1) => Some(Lmul::M2),
            (4, 1) => Some(Lmul::M4),
            (8, 1) => Some(Lmul::M8),
            _ => None,
        }
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Largest legal vl for the given configuration:
/// vlmax = VLEN * LMUL / SEW. Zero when the combination is not
/// representable (fractional LMUL too small for the element width).
pub fn vlmax(vlen_bits: u32, sew_bits: u32, lmul: Lmul) -> u64 {
    u64::from(vlen_bits * lmul.num() / (lmul.den() * sew_bits))
}

/// The decoded vtype register.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct VType {
    pub sew: Sew,
    pub lmul: Lmul,
    /// Tail-agnostic: tail lanes may be overwritten with ones
    pub ta: bool,
    /// Mask-agnostic: masked-off lanes may be overwritten with ones
    pub ma: bool,
    pub vill: bool,
}

impl VType {
    /// Decode a vtype value against the hart's VLEN. Reserved lmul or
    /// sew encodings, set reserved bits, or a configuration with
    /// vlmax == 0 all yield the vill state.
    pub fn decode(value: u64, vlen_bits: u32) -> Self {
        let ill = Self {
            vill: true,
            ..Self::default()
        };
        // Reserved bits: everything between vma (bit 7) and vill
        if extract_field(value, 62, 8) != 0 {
            return ill;
        }
        if value >> 63 != 0 {
            return ill;
        }
        let Some(lmul) = Lmul::from_encoding(extract_field(value, 2, 0)) else {
            return ill;
        };
        let Some(sew) = Sew::from_encoding(extract_field(value, 5, 3)) else {
            return ill;
        };
        if vlmax(vlen_bits, sew.bits(), lmul) == 0 {
            return ill;
        }
        Self {
            sew,
            lmul,
            ta: value & 0x40 != 0,
            ma: value & 0x80 != 0,
            vill: false,
        }
    }

    /// Re-encode to the CSR value.
    pub fn encode(&self) -> u64 {
        if self.vill {
            return 1 << 63;
        }
        self.lmul.encoding()
            | (self.sew.encoding() << 3)
            | (u64::from(self.ta) << 6)
            | (u64::from(self.ma) << 7)
    }

    pub fn vlmax(&self, vlen_bits: u32) -> u64 {
        if self.vill {
            0
        } else {
            vlmax(vlen_bits, self.sew.bits(), self.lmul)
        }
    }
}

/// How vl is determined by a vset* instruction, given the AVL request
/// shape: `rd != 0 && rs1 == 0` requests vlmax; `rd == 0 && rs1 == 0`
/// keeps the previous vl; otherwise the AVL value strip-mines.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AvlRequest {
    Value(u64),
    SetMax,
    KeepVl,
}

/// Compute the new vl. For a strip-mine request larger than vlmax the
/// architecture allows any value in [ceil(avl/2), vlmax]; this
/// implementation picks vlmax.
pub fn compute_vl(request: AvlRequest, prev_vl: u64, new_vlmax: u64) -> u64 {
    match request {
        AvlRequest::Value(avl) => avl.min(new_vlmax),
        AvlRequest::SetMax => new_vlmax,
        AvlRequest::KeepVl => prev_vl,
    }
}
