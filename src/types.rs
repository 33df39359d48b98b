//! Data structures for instruction trace entries.
//!
//! An [`Entry`] accumulates everything one in-flight instruction was observed
//! doing: the instruction bytes, register writes, memory accesses, interrupt
//! information and free-form events. Entries are built up by the collector
//! API, committed at instruction boundaries and handed to the active backend.

use bitflags::bitflags;
use serde::Serialize;
use std::fmt;

/// Maximum instruction size, in bytes, across supported targets.
pub const MAX_INSN_SIZE: usize = 16;

/// Sentinel physical address recorded when translation is unavailable.
pub const PADDR_NONE: u64 = u64::MAX;

bitflags! {
    /// Per-entry state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// The entry carries valid instruction bytes.
        const HAS_INSTR_DATA = 1 << 0;
        /// The instruction changed the CPU mode; `next_cpu_mode` is valid.
        const MODE_SWITCH = 1 << 1;
        /// A synchronous exception was taken; `intr_*` fields are valid.
        const INTR_TRAP = 1 << 2;
        /// An asynchronous interrupt was taken; `intr_code` and
        /// `intr_vector` are valid.
        const INTR_ASYNC = 1 << 3;
    }
}

/// CPU privilege mode, as reported by the target on a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CpuMode {
    User,
    #[default]
    Kernel,
    Hypervisor,
    Debug,
}

impl fmt::Display for CpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuMode::User => write!(f, "user"),
            CpuMode::Kernel => write!(f, "kernel"),
            CpuMode::Hypervisor => write!(f, "hypervisor"),
            CpuMode::Debug => write!(f, "debug"),
        }
    }
}

/// A capability register value: an integer address plus bounds and
/// permissions. Target-dependent; targets without capabilities never
/// construct one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capability {
    /// Validity tag.
    pub tag: bool,
    /// Current cursor address.
    pub address: u64,
    /// Lower bound.
    pub base: u64,
    /// Representable length above `base`.
    pub length: u64,
    /// Permission bits.
    pub perms: u32,
    /// Object type for sealed capabilities.
    pub otype: u32,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v:{} a:{:#x} b:{:#x} l:{:#x} p:{:#x} ot:{:#x}",
            self.tag as u8, self.address, self.base, self.length, self.perms, self.otype
        )
    }
}

/// One register update performed by the instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum RegisterRecord {
    /// Plain integer register write.
    Gpr { name: &'static str, value: u64 },
    /// Capability register receiving a full capability.
    Cap {
        name: &'static str,
        cap: Capability,
    },
    /// Capability register receiving a plain integer value.
    CapInt { name: &'static str, value: u64 },
}

impl RegisterRecord {
    pub fn name(&self) -> &'static str {
        match self {
            RegisterRecord::Gpr { name, .. }
            | RegisterRecord::Cap { name, .. }
            | RegisterRecord::CapInt { name, .. } => name,
        }
    }

    /// Whether the destination is a capability register.
    pub fn is_cap_reg(&self) -> bool {
        !matches!(self, RegisterRecord::Gpr { .. })
    }

    /// Whether the written value is itself a capability.
    pub fn holds_cap(&self) -> bool {
        matches!(self, RegisterRecord::Cap { .. })
    }
}

impl fmt::Display for RegisterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterRecord::Gpr { name, value } => write!(f, "{} = {:#x}", name, value),
            RegisterRecord::Cap { name, cap } => write!(f, "{} = {}", name, cap),
            RegisterRecord::CapInt { name, value } => {
                write!(f, "{} = {:#x} (cap reg)", name, value)
            }
        }
    }
}

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemAccess {
    Load,
    Store,
}

impl fmt::Display for MemAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemAccess::Load => write!(f, "read"),
            MemAccess::Store => write!(f, "write"),
        }
    }
}

/// Memory operation descriptor decoded from a target memop id.
///
/// The id packs the access width as a log2 size in the low two bits, the
/// signedness in bit 2 and the endianness in bit 3, matching the translator's
/// encoding of load/store opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemOp(u8);

impl MemOp {
    const SIZE_MASK: u8 = 0x3;
    const SIGN: u8 = 1 << 2;
    const BE: u8 = 1 << 3;

    /// Decode a raw memop id as emitted by the translator.
    pub fn from_raw(raw: u8) -> Self {
        MemOp(raw)
    }

    /// Build a descriptor from explicit properties. `width` must be a power
    /// of two between 1 and 8.
    pub fn new(width: usize, signed: bool, big_endian: bool) -> Self {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8));
        let mut raw = width.trailing_zeros() as u8;
        if signed {
            raw |= Self::SIGN;
        }
        if big_endian {
            raw |= Self::BE;
        }
        MemOp(raw)
    }

    /// Access width in bytes.
    pub fn width(&self) -> usize {
        1 << (self.0 & Self::SIZE_MASK)
    }

    pub fn is_signed(&self) -> bool {
        self.0 & Self::SIGN != 0
    }

    pub fn is_big_endian(&self) -> bool {
        self.0 & Self::BE != 0
    }
}

/// Value transferred by a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum MemValue {
    /// Integer value, always widened to 64 bits by the caller.
    Int { value: u64 },
    /// Capability transfer.
    Cap { cap: Capability },
}

/// One memory access performed by the instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    pub access: MemAccess,
    /// Width/sign/endianness descriptor; absent for capability transfers,
    /// which always move a full capability.
    pub op: Option<MemOp>,
    /// Virtual address of the access.
    pub addr: u64,
    /// Physical translation of `addr`, or [`PADDR_NONE`].
    pub paddr: u64,
    pub value: MemValue,
}

impl fmt::Display for MemoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            MemValue::Int { value } => write!(
                f,
                "mem {} [{:#x}] = {:#x} ({}B)",
                self.access,
                self.addr,
                value,
                self.op.map(|op| op.width()).unwrap_or(8)
            ),
            MemValue::Cap { cap } => {
                write!(f, "cap mem {} [{:#x}] = {}", self.access, self.addr, cap)
            }
        }
    }
}

/// Trace state transition announced by a [`Event::State`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceStateChange {
    Start,
    Stop,
    Flush,
}

impl fmt::Display for TraceStateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceStateChange::Start => write!(f, "start"),
            TraceStateChange::Stop => write!(f, "stop"),
            TraceStateChange::Flush => write!(f, "flush"),
        }
    }
}

/// Out-of-band event attached to an entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Trace start/stop/flush marker; backends use these to delimit slices.
    State { next: TraceStateChange, pc: u64 },
    /// Full register-file snapshot, emitted when a trace slice starts.
    RegDump { gpr: Vec<RegisterRecord> },
    /// Target-defined event with an opaque payload.
    User { id: u32, data: Vec<u8> },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::State { next, pc } => write!(f, "trace {} @ {:#x}", next, pc),
            Event::RegDump { gpr } => write!(f, "register dump ({} regs)", gpr.len()),
            Event::User { id, data } => write!(f, "user event {} ({} bytes)", id, data.len()),
        }
    }
}

/// Incremental builder for a [`Event::RegDump`] event.
///
/// The target fills one of these from its register file when a trace slice
/// starts; the finished event is appended to the starting entry.
#[derive(Debug, Default)]
pub struct RegDumpBuilder {
    gpr: Vec<RegisterRecord>,
}

impl RegDumpBuilder {
    pub fn with_capacity(nregs: usize) -> Self {
        RegDumpBuilder {
            gpr: Vec::with_capacity(nregs),
        }
    }

    pub fn reg(&mut self, name: &'static str, value: u64) -> &mut Self {
        self.gpr.push(RegisterRecord::Gpr { name, value });
        self
    }

    pub fn cap(&mut self, name: &'static str, cap: Capability) -> &mut Self {
        self.gpr.push(RegisterRecord::Cap { name, cap });
        self
    }

    pub fn cap_int(&mut self, name: &'static str, value: u64) -> &mut Self {
        self.gpr.push(RegisterRecord::CapInt { name, value });
        self
    }

    pub fn finish(self) -> Event {
        Event::RegDump { gpr: self.gpr }
    }
}

fn serialize_flag_bits<S: serde::Serializer>(
    flags: &EntryFlags,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u32(flags.bits())
}

/// Accumulator for everything one instruction was observed doing.
///
/// Entries live inside the per-CPU ring and are reused in place: a commit
/// returns the slot to the canonical empty shape rather than reallocating.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    /// Virtual PC of the instruction.
    pub pc: u64,
    /// Physical translation of `pc`, or [`PADDR_NONE`].
    pub paddr: u64,
    /// Address-space identifier stamped by the target.
    pub asid: u16,
    #[serde(serialize_with = "serialize_flag_bits")]
    pub flags: EntryFlags,
    /// Mode entered by the instruction; valid iff
    /// [`EntryFlags::MODE_SWITCH`] is set.
    pub next_cpu_mode: CpuMode,
    /// Interrupt/exception cause; valid iff one of the `INTR_*` flags is set.
    pub intr_code: u32,
    pub intr_vector: u64,
    /// Faulting address; valid only for synchronous exceptions.
    pub intr_faultaddr: u64,
    #[serde(skip_serializing)]
    pub insn_bytes: [u8; MAX_INSN_SIZE],
    #[serde(skip_serializing)]
    pub insn_size: usize,
    /// Register updates, in the order the target reported them.
    pub regs: Vec<RegisterRecord>,
    /// Memory accesses, in the order the target reported them.
    pub mem: Vec<MemoryRecord>,
    /// Events, in the order the target reported them.
    pub events: Vec<Event>,
    /// Free-form extra text attached by the target.
    pub txt: String,
}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            pc: 0,
            paddr: 0,
            asid: 0,
            flags: EntryFlags::empty(),
            next_cpu_mode: CpuMode::default(),
            intr_code: 0,
            intr_vector: 0,
            intr_faultaddr: 0,
            insn_bytes: [0; MAX_INSN_SIZE],
            insn_size: 0,
            regs: Vec::new(),
            mem: Vec::new(),
            events: Vec::new(),
            txt: String::new(),
        }
    }
}

impl Entry {
    /// The valid prefix of the instruction bytes.
    pub fn insn(&self) -> &[u8] {
        &self.insn_bytes[..self.insn_size]
    }

    /// Return the slot to the canonical empty shape for reuse.
    ///
    /// Child sequences are cleared, which also releases any heap-owned event
    /// payloads (register dumps, user event data). Capacity is retained so a
    /// hot slot stops allocating once warmed up.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.paddr = 0;
        self.asid = 0;
        self.flags = EntryFlags::empty();
        self.next_cpu_mode = CpuMode::default();
        self.intr_code = 0;
        self.intr_vector = 0;
        self.intr_faultaddr = 0;
        self.insn_bytes = [0; MAX_INSN_SIZE];
        self.insn_size = 0;
        self.regs.clear();
        self.mem.clear();
        self.events.clear();
        self.txt.clear();
    }

    /// Whether the slot is in the canonical empty shape.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
            && self.regs.is_empty()
            && self.mem.is_empty()
            && self.events.is_empty()
            && self.txt.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memop_decode() {
        let op = MemOp::new(4, true, false);
        assert_eq!(op.width(), 4);
        assert!(op.is_signed());
        assert!(!op.is_big_endian());

        let raw = MemOp::from_raw(0x3 | 0x8);
        assert_eq!(raw.width(), 8);
        assert!(!raw.is_signed());
        assert!(raw.is_big_endian());
    }

    #[test]
    fn test_entry_reset_releases_payloads() {
        let mut entry = Entry::default();
        entry.pc = 0x1000;
        entry.flags = EntryFlags::HAS_INSTR_DATA;
        entry.regs.push(RegisterRecord::Gpr {
            name: "ra",
            value: 1,
        });
        let mut dump = RegDumpBuilder::with_capacity(2);
        dump.reg("a0", 1).reg("a1", 2);
        entry.events.push(dump.finish());
        entry.txt.push_str("note");

        entry.reset();
        assert!(entry.is_empty());
        assert_eq!(entry.pc, 0);
        assert_eq!(entry.insn(), &[] as &[u8]);
    }

    #[test]
    fn test_register_record_flags() {
        let gpr = RegisterRecord::Gpr {
            name: "t0",
            value: 0,
        };
        let cap = RegisterRecord::Cap {
            name: "c1",
            cap: Capability::default(),
        };
        let cap_int = RegisterRecord::CapInt {
            name: "c2",
            value: 7,
        };
        assert!(!gpr.is_cap_reg() && !gpr.holds_cap());
        assert!(cap.is_cap_reg() && cap.holds_cap());
        assert!(cap_int.is_cap_reg() && !cap_int.holds_cap());
    }
}
