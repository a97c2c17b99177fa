//! Vector-visible control and status registers
//!
//! Only the handful the vector core observes: the vector state CSRs,
//! the fixed-point accumulators, the FP flags in fcsr, and the VS
//! dirty-tracking field of mstatus (vsstatus when the hart is in a
//! virtualization mode). Everything else is out of scope.

use thiserror::Error;

use crate::vector::vtype::VType;

pub const CSR_FFLAGS: u16 = 0x001;
pub const CSR_FRM: u16 = 0x002;
pub const CSR_FCSR: u16 = 0x003;
pub const CSR_VSTART: u16 = 0x008;
pub const CSR_VXSAT: u16 = 0x009;
pub const CSR_VXRM: u16 = 0x00a;
pub const CSR_VCSR: u16 = 0x00f;
pub const CSR_VL: u16 = 0xc20;
pub const CSR_VTYPE: u16 = 0xc21;
pub const CSR_VLENB: u16 = 0xc22;

#[derive(Debug, Error)]
pub enum CsrError {
    #[error("CSR 0x{0:x} is not part of the vector-visible set")]
    NonExistentCsr(u16),
    #[error("attempted write to read-only CSR 0x{0:x}")]
    ReadOnlyCsr(u16),
}

/// The mstatus.VS / vsstatus.VS field.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum VsMode {
    Off,
    #[default]
    Initial,
    Clean,
    Dirty,
}

impl VsMode {
    pub fn encoding(&self) -> u64 {
        match self {
            VsMode::Off => 0,
            VsMode::Initial => 1,
            VsMode::Clean => 2,
            VsMode::Dirty => 3,
        }
    }
}

/// The vector CSR subset, with the decoded vtype cached alongside the
/// raw fields.
#[derive(Debug)]
pub struct VecCsrFile {
    pub vstart: u64,
    pub vl: u64,
    pub vtype: VType,
    /// Fixed-point rounding mode, 2 bits
    pub vxrm: u8,
    /// Cumulative fixed-point saturation flag
    pub vxsat: bool,
    /// fcsr accrued exception flags, 5 bits
    pub fflags: u8,
    /// fcsr rounding mode, 3 bits
    pub frm: u8,
    /// mstatus.VS
    pub vs: VsMode,
    /// vsstatus.VS, consulted instead of mstatus.VS while the hart is
    /// in a virtualization mode
    pub vs_virt: VsMode,
    pub virt_mode: bool,
    vlen_bits: u32,
}

impl VecCsrFile {
    pub fn new(vlen_bits: u32) -> Self {
        Self {
            vstart: 0,
            vl: 0,
            vtype: VType {
                vill: true,
                ..VType::default()
            },
            vxrm: 0,
            vxsat: false,
            fflags: 0,
            frm: 0,
            vs: VsMode::Initial,
            vs_virt: VsMode::Initial,
            virt_mode: false,
            vlen_bits,
        }
    }

    /// The VS field governing vector-extension availability right now.
    pub fn effective_vs(&self) -> VsMode {
        if self.virt_mode {
            self.vs_virt
        } else {
            self.vs
        }
    }

    /// Record that vector state was modified.
    pub fn mark_vs_dirty(&mut self) {
        if self.virt_mode {
            self.vs_virt = VsMode::Dirty;
        }
        self.vs = VsMode::Dirty;
    }

    /// Accrue FP exception flags into fcsr.
    pub fn accrue_fflags(&mut self, flags: u8) {
        self.fflags |= flags & 0x1f;
    }

    pub fn read(&self, addr: u16) -> Result<u64, CsrError> {
        match addr {
            CSR_FFLAGS => Ok(self.fflags.into()),
            CSR_FRM => Ok(self.frm.into()),
            CSR_FCSR => Ok(u64::from(self.frm) << 5 | u64::from(self.fflags)),
            CSR_VSTART => Ok(self.vstart),
            CSR_VXSAT => Ok(self.vxsat.into()),
            CSR_VXRM => Ok(self.vxrm.into()),
            CSR_VCSR => Ok(u64::from(self.vxrm) << 1 | u64::from(self.vxsat)),
            CSR_VL => Ok(self.vl),
            CSR_VTYPE => Ok(self.vtype.encode()),
            CSR_VLENB => Ok((self.vlen_bits / 8).into()),
            _ => Err(CsrError::NonExistentCsr(addr)),
        }
    }

    pub fn write(&mut self, addr: u16, value: u64) -> Result<(), CsrError> {
        match addr {
            CSR_FFLAGS => self.fflags = (value & 0x1f) as u8,
            CSR_FRM => self.frm = (value & 0x7) as u8,
            CSR_FCSR => {
                self.fflags = (value & 0x1f) as u8;
                self.frm = (value >> 5 & 0x7) as u8;
            }
            CSR_VSTART => self.vstart = value,
            CSR_VXSAT => self.vxsat = value & 1 != 0,
            CSR_VXRM => self.vxrm = (value & 0x3) as u8,
            CSR_VCSR => {
                self.vxsat = value & 1 != 0;
                self.vxrm = (value >> 1 & 0x3) as u8;
            }
            CSR_VL | CSR_VTYPE | CSR_VLENB => return Err(CsrError::ReadOnlyCsr(addr)),
            _ => return Err(CsrError::NonExistentCsr(addr)),
        }
        Ok(())
    }
}
