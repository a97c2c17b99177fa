//! # Physical Memory Attributes
//!
//! This module imposes structure on the otherwise-flat physical
//! address space. Every access made by the hart first resolves the
//! attributes of the word-aligned region containing the target
//! address: whether the access kind is permitted, whether the word
//! belongs to a memory-mapped register, whether the region is
//! idempotent (safe to read speculatively or repeat), its atomic
//! class, and how misaligned accesses behave there.
//!
//! Attributes are held in up to 128 ordered regions. When an address
//! is covered by several valid regions, the lowest-indexed region
//! wins; this matches the PMP/PMA ordering convention of the
//! privileged architecture. An address covered by no region resolves
//! to the default attributes (read/write/execute, atomic, reservable,
//! idempotent, misaligned-ok) while in range of configured memory,
//! and to the no-access attributes beyond it.
//!
//! Memory-mapped registers live in the [`mmr::MmrBank`] owned by the
//! map; a region advertising [`Pma::MEM_MAPPED`] defers to the
//! register's own attributes for words the bank claims.

use std::fmt;

use itertools::Itertools;

use crate::memory::Wordsize;
use crate::utils::extract_field;

pub mod mmr;

use mmr::MmrBank;

/// Physical memory attribute set for a word-aligned section of the
/// address space.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Pma {
    attrib: u32,
}

impl Pma {
    pub const NONE: u32 = 0;
    pub const READ: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const EXEC: u32 = 4;
    pub const IDEMPOTENT: u32 = 8;
    /// Atomic add/min/max
    pub const AMO_OTHER: u32 = 0x10;
    pub const AMO_SWAP: u32 = 0x20;
    pub const AMO_LOGICAL: u32 = 0x40;
    pub const MEM_MAPPED: u32 = 0x200;
    /// lr/sc reservations allowed
    pub const RSRV: u32 = 0x400;
    pub const IO: u32 = 0x800;
    pub const CACHEABLE: u32 = 0x1000;
    /// Misaligned access supported
    pub const MISAL_OK: u32 = 0x2000;
    /// Misaligned access raises access fault instead of misaligned
    pub const MISAL_ACC_FAULT: u32 = 0x4000;

    pub const AMO_ARITH: u32 = Self::AMO_SWAP | Self::AMO_OTHER | Self::AMO_LOGICAL;
    pub const MAPPED: u32 = Self::READ | Self::WRITE | Self::EXEC;
    pub const DEFAULT: u32 = Self::READ
        | Self::WRITE
        | Self::EXEC
        | Self::IDEMPOTENT
        | Self::AMO_ARITH
        | Self::RSRV
        | Self::MISAL_OK;

    pub fn new(attrib: u32) -> Self {
        Self { attrib }
    }

    /// Accessible for read, write or execute.
    pub fn is_mapped(&self) -> bool {
        self.attrib & Self::MAPPED != 0
    }

    pub fn is_read(&self) -> bool {
        self.attrib & Self::READ != 0
    }

    pub fn is_write(&self) -> bool {
        self.attrib & Self::WRITE != 0
    }

    pub fn is_exec(&self) -> bool {
        self.attrib & Self::EXEC != 0
    }

    pub fn is_idempotent(&self) -> bool {
        self.attrib & Self::IDEMPOTENT != 0
    }

    pub fn is_cacheable(&self) -> bool {
        self.attrib & Self::CACHEABLE != 0
    }

    pub fn has_mem_mapped_reg(&self) -> bool {
        self.attrib & Self::MEM_MAPPED != 0
    }

    pub fn is_amo(&self) -> bool {
        self.attrib & Self::AMO_ARITH != 0
    }

    pub fn is_rsrv(&self) -> bool {
        self.attrib & Self::RSRV != 0
    }

    pub fn is_io(&self) -> bool {
        self.attrib & Self::IO != 0
    }

    pub fn is_misaligned_ok(&self) -> bool {
        self.attrib & Self::MISAL_OK != 0
    }

    /// Misaligned access raises a misaligned exception here.
    pub fn misal_on_misal(&self) -> bool {
        self.attrib & Self::MISAL_ACC_FAULT == 0
    }

    /// Misaligned access raises an access-fault exception here.
    pub fn access_fault_on_misal(&self) -> bool {
        self.attrib & Self::MISAL_ACC_FAULT != 0
    }

    pub fn enable(&mut self, attrib: u32) {
        self.attrib |= attrib;
    }

    pub fn disable(&mut self, attrib: u32) {
        self.attrib &= !attrib;
    }

    /// True if every bit of the given attribute combination is present.
    pub fn has_attrib(&self, attrib: u32) -> bool {
        self.attrib & attrib == attrib
    }

    pub fn attributes(&self) -> u32 {
        self.attrib
    }

    /// Parse a single attribute name. Valid names: none, read, write,
    /// exec, idempotent, amoswap, amological, amoother, amoarithmetic,
    /// amo, mem_mapped, rsrv, io, cacheable, misal_ok, misal_acc_fault.
    pub fn attrib_from_str(name: &str) -> Option<u32> {
        let attrib = match name {
            "none" => Self::NONE,
            "read" => Self::READ,
            "write" => Self::WRITE,
            "exec" => Self::EXEC,
            "idempotent" => Self::IDEMPOTENT,
            "amoswap" => Self::AMO_SWAP,
            "amological" => Self::AMO_LOGICAL,
            "amoother" => Self::AMO_OTHER,
            "amoarithmetic" | "amo" => Self::AMO_ARITH,
            "mem_mapped" => Self::MEM_MAPPED,
            "rsrv" => Self::RSRV,
            "io" => Self::IO,
            "cacheable" => Self::CACHEABLE,
            "misal_ok" => Self::MISAL_OK,
            "misal_acc_fault" => Self::MISAL_ACC_FAULT,
            _ => return None,
        };
        Some(attrib)
    }
}

impl fmt::Display for Pma {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (Self::READ, "read"),
            (Self::WRITE, "write"),
            (Self::EXEC, "exec"),
            (Self::IDEMPOTENT, "idempotent"),
            (Self::AMO_OTHER, "amoother"),
            (Self::AMO_SWAP, "amoswap"),
            (Self::AMO_LOGICAL, "amological"),
            (Self::MEM_MAPPED, "memmapped"),
            (Self::RSRV, "rsrv"),
            (Self::IO, "io"),
            (Self::CACHEABLE, "cacheable"),
            (Self::MISAL_OK, "misalok"),
            (Self::MISAL_ACC_FAULT, "misalaccfault"),
        ];
        let joined = names
            .iter()
            .filter(|(bit, _)| self.attrib & bit != 0)
            .map(|(_, name)| *name)
            .join(",");
        write!(f, "{joined}")
    }
}

/// Why the map was consulted, recorded in the access trace.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum AccessReason {
    #[default]
    None,
    Fetch,
    LdSt,
}

/// One record of the per-access trace: which region matched and for
/// what address.
#[derive(Debug, Clone)]
pub struct PmaTrace {
    pub region_index: usize,
    pub addr: u64,
    pub first_addr: u64,
    pub last_addr: u64,
    pub reason: AccessReason,
}

#[derive(Debug, Default, Copy, Clone)]
struct Region {
    first_addr: u64,
    last_addr: u64,
    pma: Pma,
    valid: bool,
}

impl Region {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.first_addr && addr <= self.last_addr
    }

    fn overlaps(&self, low: u64, high: u64) -> bool {
        high >= self.first_addr && low <= self.last_addr
    }
}

/// Maximum number of attribute regions.
pub const MAX_REGIONS: usize = 128;

/// Physical memory attribute map: the ordered regions, the default
/// and no-access fallbacks, and the bank of memory-mapped registers.
/// One per memory; mutated only during configuration.
#[derive(Debug)]
pub struct PmaMap {
    regions: Vec<Region>,
    mem_size: u64,
    default_pma: Pma,
    no_access_pma: Pma,
    mmrs: MmrBank,
    mmr_ranges: Vec<(u64, u64)>,
    trace_enabled: bool,
    trace: Vec<PmaTrace>,
    reason: AccessReason,
}

impl PmaMap {
    pub fn new(mem_size: u64) -> Self {
        // Misaligned accesses out of range still report an access
        // fault rather than a misaligned fault.
        let mut no_access_pma = Pma::default();
        no_access_pma.enable(Pma::MISAL_OK);
        Self {
            regions: Vec::with_capacity(32),
            mem_size,
            default_pma: Pma::new(Pma::DEFAULT),
            no_access_pma,
            mmrs: MmrBank::default(),
            mmr_ranges: Vec::new(),
            trace_enabled: false,
            trace: Vec::new(),
            reason: AccessReason::None,
        }
    }

    /// Install or replace the region at the given index. Regions are
    /// matched in index order: if an address is covered by multiple
    /// valid regions, the lowest-indexed one applies. The region
    /// covers the word-aligned words with addresses in
    /// [first_addr, last_addr]. Returns false if the index is out of
    /// range.
    pub fn define_region(&mut self, index: usize, first_addr: u64, last_addr: u64, pma: Pma) -> bool {
        if index >= MAX_REGIONS {
            return false;
        }
        if index >= self.regions.len() {
            self.regions.resize(index + 1, Region::default());
        }
        self.regions[index] = Region {
            first_addr,
            last_addr,
            pma,
            valid: true,
        };
        if pma.has_mem_mapped_reg() {
            if index >= self.mmr_ranges.len() {
                self.mmr_ranges.resize(index + 1, (0, 0));
            }
            self.mmr_ranges[index] = (first_addr, last_addr);
        }
        true
    }

    /// Disable matching for the region at the given index.
    pub fn invalidate_region(&mut self, index: usize) {
        if index >= MAX_REGIONS {
            return;
        }
        if index >= self.regions.len() {
            self.regions.resize(index + 1, Region::default());
        }
        self.regions[index].valid = false;
    }

    /// Define a memory-mapped register. Returns false if size is not
    /// 4 or 8 or the address is not aligned to the size.
    pub fn define_mmr(&mut self, addr: u64, write_mask: u64, size: u64, pma: Pma) -> bool {
        self.mmrs.define(addr, write_mask, size, pma)
    }

    /// The attributes of the word containing the given address. A
    /// matching region that advertises memory-mapped registers defers
    /// to the register's own attributes when the bank claims the
    /// word. Out-of-range addresses resolve to no-access; unclaimed
    /// in-range addresses resolve to the default attributes.
    pub fn pma_for(&self, addr: u64) -> Pma {
        let addr = addr & !3;
        for region in &self.regions {
            if region.valid && region.contains(addr) {
                if !region.pma.has_mem_mapped_reg() {
                    return region.pma;
                }
                return self.mmrs.pma_at(addr).unwrap_or(region.pma);
            }
        }
        if addr >= self.mem_size {
            self.no_access_pma
        } else {
            self.default_pma
        }
    }

    /// Like [`Self::pma_for`] but records the matching region in the
    /// access trace when tracing is enabled.
    pub fn access_pma(&mut self, addr: u64) -> Pma {
        let word_addr = addr & !3;
        let hit = self
            .regions
            .iter()
            .enumerate()
            .find(|(_, r)| r.valid && r.contains(word_addr))
            .map(|(ix, r)| (ix, *r));
        if let Some((ix, region)) = hit {
            if self.trace_enabled {
                self.trace.push(PmaTrace {
                    region_index: ix,
                    addr: word_addr,
                    first_addr: region.first_addr,
                    last_addr: region.last_addr,
                    reason: self.reason,
                });
            }
            if !region.pma.has_mem_mapped_reg() {
                return region.pma;
            }
            return self.mmrs.pma_at(word_addr).unwrap_or(region.pma);
        }
        if word_addr >= self.mem_size {
            self.no_access_pma
        } else {
            self.default_pma
        }
    }

    /// True if more than one valid region covers the address.
    pub fn matches_multiple(&self, addr: u64) -> bool {
        self.regions
            .iter()
            .filter(|r| r.valid && r.contains(addr))
            .count()
            > 1
    }

    /// The write-mask of the MMR owning the word at addr; all-ones if
    /// no MMR was ever defined there.
    pub fn mem_mapped_mask(&self, addr: u64) -> u64 {
        self.mmrs.mask_at(addr).unwrap_or(!0)
    }

    /// True if the address falls within a defined MMR (the owning
    /// word or double-word).
    pub fn is_mmr(&self, addr: u64) -> bool {
        self.mmrs.contains(addr)
    }

    /// True if [start, end] overlaps any region configured as holding
    /// memory-mapped registers.
    pub fn overlaps_mmr_range(&self, start: u64, end: u64) -> bool {
        self.mmr_ranges
            .iter()
            .any(|&(low, high)| end >= low && start <= high)
    }

    /// Re-mark the region at the given index as memory-mapped if its
    /// span overlaps a configured MMR range.
    pub fn update_mem_mapped_attrib(&mut self, index: usize) {
        let Some(region) = self.regions.get(index).copied() else {
            return;
        };
        let overlaps = self
            .mmr_ranges
            .iter()
            .any(|&(low, high)| region.overlaps(low, high));
        if overlaps {
            self.regions[index].pma.enable(Pma::MEM_MAPPED);
        }
    }

    /// Toggle misaligned-data support in the default and no-access
    /// attributes.
    pub fn enable_misaligned_data(&mut self, flag: bool) {
        if flag {
            self.default_pma.enable(Pma::MISAL_OK);
            self.no_access_pma.enable(Pma::MISAL_OK);
        } else {
            self.default_pma.disable(Pma::MISAL_OK);
            self.no_access_pma.disable(Pma::MISAL_OK);
        }
    }

    /// Clear the default attributes (no access outside defined regions).
    pub fn clear_default_pma(&mut self) {
        self.default_pma = Pma::default();
    }

    pub fn enable_in_default_pma(&mut self, attrib: u32) {
        self.default_pma.enable(attrib);
    }

    pub fn read_mmr(&self, addr: u64, width: Wordsize) -> Option<u64> {
        self.mmrs.read(addr, width)
    }

    pub fn write_mmr(&mut self, addr: u64, width: Wordsize, value: u64) -> bool {
        self.mmrs.write(addr, width, value)
    }

    /// Write bypassing the register's write-mask.
    pub fn poke_mmr(&mut self, addr: u64, value: u64) -> bool {
        self.mmrs.poke(addr, value)
    }

    /// Reset (to zero) all memory-mapped register values.
    pub fn reset_mmrs(&mut self) {
        self.mmrs.reset();
    }

    pub fn enable_trace(&mut self, flag: bool) {
        self.trace_enabled = flag;
    }

    pub fn set_access_reason(&mut self, reason: AccessReason) {
        self.reason = reason;
    }

    pub fn trace(&self) -> &[PmaTrace] {
        &self.trace
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }

    pub fn print_regions(&self) {
        for (ix, region) in self.regions.iter().enumerate() {
            println!("Region {ix}");
            println!("valid: {}", region.valid);
            if region.valid {
                println!("base addr: 0x{:x}", region.first_addr);
                println!("last addr: 0x{:x}", region.last_addr);
                println!("attributes: {}", region.pma);
            }
        }
    }
}

/// Unpack the value of a PMACFG CSR into (first_addr, last_addr, pma).
/// Returns None if the size field (bits 63:58) is zero, which marks
/// the entry invalid.
///
/// Layout: bits 2:0 are R/W/X; bits 4:3 a memory type (nonzero means
/// IO: no misaligned support, misaligned raises access fault); bits
/// 6:5 an AMO class applied to cacheable main memory (1 swap,
/// 2 logical, 3 arithmetic); bit 7 cacheable; bits 55:12 the base
/// address; bits 63:58 log2 of the region size, clamped up to 4 KiB.
pub fn unpack_pmacfg(value: u64) -> Option<(u64, u64, Pma)> {
    let mut n = value >> 58;
    if n == 0 {
        return None;
    }
    if n < 12 {
        n = 12;
    }

    // Misaligned load/store allowed by default; this does not apply
    // to AMO/LR/SC.
    let mut attrib = Pma::MISAL_OK;
    if value & 1 != 0 {
        attrib |= Pma::READ;
    }
    if value & 2 != 0 {
        attrib |= Pma::WRITE;
    }
    if value & 4 != 0 {
        attrib |= Pma::EXEC;
    }

    let mem_type = extract_field(value, 4, 3);
    if mem_type != 0 {
        attrib |= Pma::IO;
        attrib &= !Pma::MISAL_OK;
        attrib |= Pma::MISAL_ACC_FAULT;
    } else {
        let cacheable = value & 0x80 != 0;
        if cacheable {
            attrib |= Pma::CACHEABLE | Pma::RSRV;
            match extract_field(value, 6, 5) {
                1 => attrib |= Pma::AMO_SWAP,
                2 => attrib |= Pma::AMO_LOGICAL,
                3 => attrib |= Pma::AMO_ARITH,
                _ => (),
            }
        }
    }

    // Base address in bits 55:12; clear the low n bits for the first
    // address, set them for the last.
    let addr = (value << 8) >> 8;
    let first = (addr >> n) << n;
    let last = if n < 56 {
        first | ((1u64 << n) - 1)
    } else {
        !0
    };
    Some((first, last, Pma::new(attrib)))
}
