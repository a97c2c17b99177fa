//! RISC-V Hardware Thread (vector subset)
//!
//! The hart owns the architectural state the vector core touches:
//! the scalar register files it reads operands from, the vector
//! register file, the vector CSR subset, flat memory behind the PMA
//! map, and any memory-mapped devices. The execution entry point is
//! [`crate::vector::execute`], which borrows the hart for the
//! duration of one decoded instruction.
//!
//! The hart is single-threaded cooperative: an instruction runs to
//! completion, and the only state shared with other threads lives
//! inside devices.

use thiserror::Error;

use crate::devices::IoDevice;
use crate::memory::{Memory, Wordsize, Xlen};
use crate::pma::{AccessReason, PmaMap};
use crate::vector::mem::ElemDescriptor;
use crate::vector::regs::VecRegs;
use crate::vector::VecConfig;

use self::csr::VecCsrFile;

pub mod csr;

/// Exceptions the vector core can raise.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum Exception {
    #[error("illegal instruction")]
    IllegalInstruction,
    #[error("breakpoint at 0x{0:x}")]
    Breakpoint(u64),
    #[error("load address misaligned at 0x{0:x}")]
    LoadAddressMisaligned(u64),
    #[error("load access fault at 0x{0:x}")]
    LoadAccessFault(u64),
    #[error("store/AMO address misaligned at 0x{0:x}")]
    StoreAddressMisaligned(u64),
    #[error("store/AMO access fault at 0x{0:x}")]
    StoreAccessFault(u64),
    #[error("load page fault at 0x{0:x}")]
    LoadPageFault(u64),
    #[error("store/AMO page fault at 0x{0:x}")]
    StorePageFault(u64),
}

impl Exception {
    /// The mcause exception code.
    pub fn cause(&self) -> u64 {
        match self {
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint(_) => 3,
            Exception::LoadAddressMisaligned(_) => 4,
            Exception::LoadAccessFault(_) => 5,
            Exception::StoreAddressMisaligned(_) => 6,
            Exception::StoreAccessFault(_) => 7,
            Exception::LoadPageFault(_) => 13,
            Exception::StorePageFault(_) => 15,
        }
    }

    /// The mtval value: the faulting address where one exists.
    pub fn tval(&self) -> u64 {
        match self {
            Exception::IllegalInstruction => 0,
            Exception::Breakpoint(addr)
            | Exception::LoadAddressMisaligned(addr)
            | Exception::LoadAccessFault(addr)
            | Exception::StoreAddressMisaligned(addr)
            | Exception::StoreAccessFault(addr)
            | Exception::LoadPageFault(addr)
            | Exception::StorePageFault(addr) => *addr,
        }
    }
}

/// The access kind of a vector memory element.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemAccessKind {
    Load,
    Store,
}

/// Integer register file. x0 is hardwired to zero.
#[derive(Debug, Default)]
pub struct Registers {
    registers: [u64; 32],
}

impl Registers {
    pub fn read(&self, which: u32) -> u64 {
        assert!(which < 32, "invalid register x{which}");
        self.registers[which as usize]
    }

    pub fn write(&mut self, which: u32, value: u64) {
        assert!(which < 32, "invalid register x{which}");
        if which != 0 {
            self.registers[which as usize] = value;
        }
    }
}

/// Floating-point register file, raw 64-bit with NaN boxing for
/// narrower values.
#[derive(Debug)]
pub struct FpRegisters {
    registers: [u64; 32],
}

impl Default for FpRegisters {
    fn default() -> Self {
        Self { registers: [0; 32] }
    }
}

impl FpRegisters {
    pub fn read_raw(&self, which: u32) -> u64 {
        assert!(which < 32, "invalid register f{which}");
        self.registers[which as usize]
    }

    pub fn write_raw(&mut self, which: u32, value: u64) {
        assert!(which < 32, "invalid register f{which}");
        self.registers[which as usize] = value;
    }

    /// A narrow value read from an f register must be NaN-boxed in
    /// the bits above it; an improperly boxed value reads as the
    /// canonical NaN of the narrow type.
    pub fn read_boxed(&self, which: u32, bits: u32) -> u64 {
        let raw = self.read_raw(which);
        if bits >= 64 {
            return raw;
        }
        let box_mask = !0u64 << bits;
        if raw & box_mask == box_mask {
            raw & !box_mask
        } else {
            match bits {
                16 => 0x7e00,
                32 => 0x7fc0_0000,
                _ => 0,
            }
        }
    }

    pub fn write_boxed(&mut self, which: u32, bits: u32, value: u64) {
        let boxed = if bits >= 64 {
            value
        } else {
            value | (!0u64 << bits)
        };
        self.write_raw(which, boxed);
    }
}

/// The hart.
pub struct Hart {
    pub xlen: Xlen,
    pub registers: Registers,
    pub fregs: FpRegisters,
    pub memory: Memory,
    pub pma: PmaMap,
    pub devices: Vec<Box<dyn IoDevice>>,
    pub csr: VecCsrFile,
    pub vregs: VecRegs,
    pub config: VecConfig,
    pub trace: bool,

    /// Per-instruction load/store descriptor list, cleared (not
    /// freed) at instruction entry
    pub descriptors: Vec<ElemDescriptor>,
    /// Per-element FP flags of the current instruction
    pub elem_fflags: Vec<u8>,
    /// Per-element saturation of the current instruction
    pub elem_sat: Vec<bool>,

    /// Address ranges that fault on translation, standing in for
    /// unmapped pages
    page_fault_ranges: Vec<(u64, u64)>,
    /// Debug trigger address ranges checked before each element
    /// access
    trigger_ranges: Vec<(u64, u64)>,
}

impl Hart {
    pub fn new(config: VecConfig, mem_size: u64) -> Self {
        let vlen_bits = config.vlen_bits;
        Self {
            xlen: Xlen::Xlen64,
            registers: Registers::default(),
            fregs: FpRegisters::default(),
            memory: Memory::new(Xlen::Xlen64),
            pma: PmaMap::new(mem_size),
            devices: Vec::new(),
            csr: VecCsrFile::new(vlen_bits),
            vregs: VecRegs::new(vlen_bits),
            config,
            trace: false,
            descriptors: Vec::new(),
            elem_fflags: Vec::new(),
            elem_sat: Vec::new(),
            page_fault_ranges: Vec::new(),
            trigger_ranges: Vec::new(),
        }
    }

    pub fn x(&self, n: u32) -> u64 {
        self.registers.read(n)
    }

    pub fn set_x(&mut self, n: u32, value: u64) {
        self.registers.write(n, value);
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn add_device(&mut self, device: Box<dyn IoDevice>) {
        self.devices.push(device);
    }

    /// Declare [first, last] as faulting on translation (an unmapped
    /// page).
    pub fn add_page_fault_range(&mut self, first: u64, last: u64) {
        self.page_fault_ranges.push((first, last));
    }

    /// Arm a debug trigger on [first, last].
    pub fn add_trigger_range(&mut self, first: u64, last: u64) {
        self.trigger_ranges.push((first, last));
    }

    pub fn clear_trigger_ranges(&mut self) {
        self.trigger_ranges.clear();
    }

    /// True if a before-access trigger matches the access.
    pub fn trigger_hit(&self, addr: u64, size: u64) -> bool {
        let end = addr + size - 1;
        self.trigger_ranges
            .iter()
            .any(|&(first, last)| end >= first && addr <= last)
    }

    /// Translate a virtual element address. Translation is flat in
    /// this hart, but unmapped pages fault, and an element crossing a
    /// 4 KiB page boundary reports the second page's address
    /// separately.
    pub fn translate(
        &self,
        addr: u64,
        size: u64,
        kind: MemAccessKind,
    ) -> Result<(u64, u64), Exception> {
        let end = addr + size - 1;
        for &(first, last) in &self.page_fault_ranges {
            if end >= first && addr <= last {
                let fault_addr = addr.max(first);
                return Err(match kind {
                    MemAccessKind::Load => Exception::LoadPageFault(fault_addr),
                    MemAccessKind::Store => Exception::StorePageFault(fault_addr),
                });
            }
        }
        let pa2 = if addr >> 12 == end >> 12 {
            addr
        } else {
            (end >> 12) << 12
        };
        Ok((addr, pa2))
    }

    /// Consult the PMA map for the access: permission first, then
    /// alignment. Misalignment raises an access fault instead of a
    /// misaligned exception in regions so attributed; memory-mapped
    /// registers always trap misalignment.
    pub fn check_pma(&mut self, addr: u64, size: u64, kind: MemAccessKind) -> Result<(), Exception> {
        self.pma.set_access_reason(AccessReason::LdSt);
        let pma = self.pma.access_pma(addr);
        let permitted = match kind {
            MemAccessKind::Load => pma.is_read(),
            MemAccessKind::Store => pma.is_write(),
        };
        if !permitted {
            return Err(match kind {
                MemAccessKind::Load => Exception::LoadAccessFault(addr),
                MemAccessKind::Store => Exception::StoreAccessFault(addr),
            });
        }
        let misaligned = size > 1 && addr % size != 0;
        if misaligned && (self.pma.is_mmr(addr) || !pma.is_misaligned_ok()) {
            return Err(if pma.access_fault_on_misal() {
                match kind {
                    MemAccessKind::Load => Exception::LoadAccessFault(addr),
                    MemAccessKind::Store => Exception::StoreAccessFault(addr),
                }
            } else {
                match kind {
                    MemAccessKind::Load => Exception::LoadAddressMisaligned(addr),
                    MemAccessKind::Store => Exception::StoreAddressMisaligned(addr),
                }
            });
        }
        Ok(())
    }

    fn device_index(&self, addr: u64) -> Option<usize> {
        self.devices.iter().position(|d| d.covers(addr))
    }

    /// Read size bytes of physical memory, dispatching to a device or
    /// memory-mapped register where one claims the address. Devices
    /// only accept naturally-aligned word and double-word accesses.
    pub fn read_phys(&mut self, pa: u64, size: u64) -> Result<u64, Exception> {
        if let Some(ix) = self.device_index(pa) {
            return match size {
                4 => Ok(self.devices[ix].read(pa).into()),
                8 => Ok(self.devices[ix].read_dword(pa)),
                _ => Err(Exception::LoadAccessFault(pa)),
            };
        }
        if self.pma.is_mmr(pa) {
            let width = Wordsize::from_width(size).ok_or(Exception::LoadAccessFault(pa))?;
            return self
                .pma
                .read_mmr(pa, width)
                .ok_or(Exception::LoadAccessFault(pa));
        }
        self.memory
            .read_bytes(pa, size)
            .map_err(|_| Exception::LoadAccessFault(pa))
    }

    /// Write size bytes of physical memory; dispatch as for reads.
    pub fn write_phys(&mut self, pa: u64, size: u64, value: u64) -> Result<(), Exception> {
        if let Some(ix) = self.device_index(pa) {
            return match size {
                4 => {
                    self.devices[ix].write(pa, value as u32);
                    Ok(())
                }
                8 => {
                    self.devices[ix].write_dword(pa, value);
                    Ok(())
                }
                _ => Err(Exception::StoreAccessFault(pa)),
            };
        }
        if self.pma.is_mmr(pa) {
            let width = Wordsize::from_width(size).ok_or(Exception::StoreAccessFault(pa))?;
            if self.pma.write_mmr(pa, width, value) {
                return Ok(());
            }
            return Err(Exception::StoreAccessFault(pa));
        }
        self.memory
            .write_bytes(pa, value, size)
            .map_err(|_| Exception::StoreAccessFault(pa))
    }

    /// Reset the per-instruction trace buffers.
    pub fn begin_instruction(&mut self) {
        self.descriptors.clear();
        self.elem_fflags.clear();
        self.elem_sat.clear();
        self.vregs.clear_touched();
    }
}
