//! Per-CPU instruction tracing for system emulators.
//!
//! This crate is the collection and dispatch engine behind an emulator's
//! instruction trace: translated target code appends register writes, memory
//! accesses and events to the current [`Entry`] of its CPU, commits at each
//! instruction boundary, and committed entries flow through the per-CPU
//! filter list into a pluggable serialization [`Backend`]. A buffered mode
//! parks committed entries in a per-CPU ring until the target requests a
//! flush, and a staged printf protocol lets generated code capture formatted
//! debug lines with one store per argument.
//!
//! # Example
//!
//! ```ignore
//! use instr_trace::{BackendKind, LogFlags, TraceSession};
//!
//! let session = TraceSession::builder()
//!     .backend(BackendKind::Json.create(std::fs::File::create("trace.jsonl")?))
//!     .build();
//! // On the CPU worker thread:
//! let mut tracer = session.attach_cpu(0, &env);
//! session.global_switch(LogFlags::INSTR);
//! tracer.process_pending(&env);
//! tracer.instr(&env, pc, &insn_bytes);
//! tracer.reg("ra", 0x42);
//! tracer.commit();
//! ```

pub mod backend;
pub mod filter;
pub mod printf;
pub mod ring;
pub mod session;
pub mod tracer;
pub mod types;

pub use backend::{Backend, BackendKind, CpuId, JsonBackend, NopBackend, TextBackend};
pub use filter::{AddressRanges, NoRegions, TraceFilter};
pub use printf::{
    gen_printf, gen_printf_flush, Extend, ImmediateSink, IrValue, PrintfBuf, PrintfSink,
    PrintfStage, StagedArg, StoreWidth, PRINTF_ARG_MAX, PRINTF_BUF_DEPTH, PRINTF_FLUSH_BARRIER,
};
pub use ring::MIN_ENTRY_BUFFER_SIZE;
pub use session::{CliFilterError, LogFlags, TraceSession, TraceSessionBuilder};
pub use tracer::{CpuEnv, CpuTracer, CpuWork, LogLevel, TraceStats};
pub use types::{
    Capability, CpuMode, Entry, EntryFlags, Event, MemAccess, MemOp, MemValue, MemoryRecord,
    RegDumpBuilder, RegisterRecord, TraceStateChange, MAX_INSN_SIZE, PADDR_NONE,
};
