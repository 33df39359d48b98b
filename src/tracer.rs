//! Per-CPU trace controller.
//!
//! A [`CpuTracer`] is exclusively owned by its CPU's worker thread. The
//! target appends observations to the current entry through the collector
//! methods while an instruction executes, then commits at the instruction
//! boundary. Cross-CPU control (the global switch, buffer resizes, sync)
//! arrives as queued work that the worker applies between translation blocks
//! via [`CpuTracer::process_pending`].

use crate::backend::CpuId;
use crate::filter::{FilterSet, TraceFilter};
use crate::printf::{render_formatted, PrintfBuf};
use crate::ring::EntryRing;
use crate::session::SessionShared;
use crate::types::{
    CpuMode, Entry, EntryFlags, Event, MemAccess, MemOp, MemValue, MemoryRecord, RegisterRecord,
    TraceStateChange, Capability, MAX_INSN_SIZE, PADDR_NONE,
};
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Target CPU services the trace core depends on.
///
/// Implemented by the emulator; every method is invoked on the owning CPU's
/// thread.
pub trait CpuEnv {
    /// Whether the CPU currently executes in user mode.
    fn in_user_mode(&self) -> bool;

    /// The most recently executed PC, used when a switch request carries no
    /// explicit program counter.
    fn recent_pc(&self) -> u64;

    /// Translate a virtual address for debug purposes. `None` when no
    /// mapping exists; the record then carries the sentinel address.
    fn translate(&self, vaddr: u64) -> Option<u64>;

    /// Snapshot the register file for the start-of-slice register dump.
    /// `None` skips the dump event.
    fn regdump(&self) -> Option<Vec<RegisterRecord>>;
}

/// Per-CPU instruction logging level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Tracing off.
    #[default]
    None,
    /// Trace only while the CPU is in user mode.
    User,
    /// Trace everything.
    All,
}

/// Per-CPU tracing statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TraceStats {
    /// Entries handed to the backend.
    pub entries_emitted: u64,
    /// Trace slices started.
    pub trace_start: u64,
    /// Trace slices stopped.
    pub trace_stop: u64,
}

/// Deferred operation applied by the owning CPU worker at a safe point.
pub type CpuWork = Box<dyn FnOnce(&mut CpuTracer, &dyn CpuEnv) + Send + 'static>;

/// Pending loglevel change, applied at the owning CPU's next safe point.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SwitchRequest {
    pub(crate) next_level: LogLevel,
    /// PC attributed to the start/stop events. Ignored for global requests,
    /// which use the CPU's most recent PC instead.
    pub(crate) pc: u64,
    pub(crate) global: bool,
}

fn get_paddr(env: &dyn CpuEnv, vaddr: u64) -> u64 {
    env.translate(vaddr).unwrap_or(PADDR_NONE)
}

/// Per-CPU trace state: the entry ring, logging level, filters, statistics
/// and the staged-printf area.
pub struct CpuTracer {
    cpu: CpuId,
    shared: Arc<SessionShared>,
    loglevel: LogLevel,
    loglevel_active: bool,
    /// A slice start is pending: the current entry holds the Start event but
    /// nothing has been committed yet. Cleared by the first commit.
    starting: bool,
    force_drop: bool,
    buffered: bool,
    ring: EntryRing,
    filters: FilterSet,
    stats: TraceStats,
    printf: PrintfBuf,
    work_tx: Sender<CpuWork>,
    work_rx: Receiver<CpuWork>,
}

impl CpuTracer {
    pub(crate) fn new(
        cpu: CpuId,
        shared: Arc<SessionShared>,
        ring_capacity: usize,
        work_tx: Sender<CpuWork>,
        work_rx: Receiver<CpuWork>,
    ) -> Self {
        CpuTracer {
            cpu,
            shared,
            loglevel: LogLevel::None,
            loglevel_active: false,
            starting: false,
            force_drop: false,
            buffered: false,
            ring: EntryRing::with_capacity(ring_capacity),
            filters: FilterSet::default(),
            stats: TraceStats::default(),
            printf: PrintfBuf::default(),
            work_tx,
            work_rx,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }

    pub fn loglevel(&self) -> LogLevel {
        self.loglevel
    }

    pub fn loglevel_active(&self) -> bool {
        self.loglevel_active
    }

    /// The entry currently being populated.
    pub fn current(&self) -> &Entry {
        self.ring.current()
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Toggle buffered mode. With buffering off the ring degenerates to a
    /// single working slot and commits emit immediately.
    pub fn set_buffered(&mut self, enable: bool) {
        self.buffered = enable;
    }

    /// The staging area written by generated printf code.
    pub fn printf_buf_mut(&mut self) -> &mut PrintfBuf {
        &mut self.printf
    }

    /// Whether instruction logging is active on this CPU right now.
    pub fn check_enabled(&self) -> bool {
        self.shared.instr_enabled() && self.loglevel_active
    }

    pub fn add_filter(&mut self, filter: TraceFilter) {
        self.filters.add(filter);
    }

    pub fn remove_filter(&mut self, filter: TraceFilter) {
        self.filters.remove(filter);
    }

    // Collector API. Every method is a cheap no-op while tracing is
    // inactive, so translated code may call unconditionally.

    /// Record an integer register write.
    pub fn reg(&mut self, name: &'static str, value: u64) {
        if !self.check_enabled() {
            return;
        }
        self.ring
            .current_mut()
            .regs
            .push(RegisterRecord::Gpr { name, value });
    }

    /// Record a capability register write.
    pub fn cap(&mut self, name: &'static str, cap: Capability) {
        if !self.check_enabled() {
            return;
        }
        self.ring
            .current_mut()
            .regs
            .push(RegisterRecord::Cap { name, cap });
    }

    /// Record an integer write to a capability register.
    pub fn cap_int(&mut self, name: &'static str, value: u64) {
        if !self.check_enabled() {
            return;
        }
        self.ring
            .current_mut()
            .regs
            .push(RegisterRecord::CapInt { name, value });
    }

    fn mem_record(
        &mut self,
        env: &dyn CpuEnv,
        access: MemAccess,
        op: Option<MemOp>,
        addr: u64,
        value: MemValue,
    ) {
        let paddr = get_paddr(env, addr);
        self.ring.current_mut().mem.push(MemoryRecord {
            access,
            op,
            addr,
            paddr,
            value,
        });
    }

    /// Record an integer load. The value channel is 64 bits wide; narrower
    /// loads must be extended by the caller.
    pub fn ld_int(&mut self, env: &dyn CpuEnv, addr: u64, op: MemOp, value: u64) {
        if !self.check_enabled() {
            return;
        }
        self.mem_record(env, MemAccess::Load, Some(op), addr, MemValue::Int { value });
    }

    /// Record an integer store.
    pub fn st_int(&mut self, env: &dyn CpuEnv, addr: u64, op: MemOp, value: u64) {
        if !self.check_enabled() {
            return;
        }
        self.mem_record(env, MemAccess::Store, Some(op), addr, MemValue::Int { value });
    }

    /// Record a capability load.
    pub fn ld_cap(&mut self, env: &dyn CpuEnv, addr: u64, cap: Capability) {
        if !self.check_enabled() {
            return;
        }
        self.mem_record(env, MemAccess::Load, None, addr, MemValue::Cap { cap });
    }

    /// Record a capability store.
    pub fn st_cap(&mut self, env: &dyn CpuEnv, addr: u64, cap: Capability) {
        if !self.check_enabled() {
            return;
        }
        self.mem_record(env, MemAccess::Store, None, addr, MemValue::Cap { cap });
    }

    /// Record the instruction being executed.
    pub fn instr(&mut self, env: &dyn CpuEnv, pc: u64, bytes: &[u8]) {
        if !self.check_enabled() {
            return;
        }
        assert!(bytes.len() <= MAX_INSN_SIZE, "instruction too large");
        let paddr = get_paddr(env, pc);
        let entry = self.ring.current_mut();
        entry.pc = pc;
        entry.paddr = paddr;
        entry.insn_bytes[..bytes.len()].copy_from_slice(bytes);
        entry.insn_size = bytes.len();
        entry.flags.insert(EntryFlags::HAS_INSTR_DATA);
    }

    /// Stamp the entry's address-space identifier.
    pub fn asid(&mut self, asid: u16) {
        if !self.check_enabled() {
            return;
        }
        self.ring.current_mut().asid = asid;
    }

    /// Record a synchronous exception taken by this instruction.
    pub fn exception(&mut self, code: u32, vector: u64, faultaddr: u64) {
        if !self.check_enabled() {
            return;
        }
        let entry = self.ring.current_mut();
        entry.flags.insert(EntryFlags::INTR_TRAP);
        entry.intr_code = code;
        entry.intr_vector = vector;
        entry.intr_faultaddr = faultaddr;
    }

    /// Record an asynchronous interrupt taken by this instruction.
    pub fn interrupt(&mut self, code: u32, vector: u64) {
        if !self.check_enabled() {
            return;
        }
        let entry = self.ring.current_mut();
        entry.flags.insert(EntryFlags::INTR_ASYNC);
        entry.intr_code = code;
        entry.intr_vector = vector;
    }

    /// Append an event. Ownership of any heap payload transfers to the entry
    /// and is released when the slot resets.
    pub fn event(&mut self, event: Event) {
        if !self.check_enabled() {
            return;
        }
        self.ring.current_mut().events.push(event);
    }

    /// Append formatted text to the entry. Rendering happens immediately, in
    /// contrast to the staged printf path.
    pub fn extra(&mut self, args: fmt::Arguments<'_>) {
        if !self.check_enabled() {
            return;
        }
        use fmt::Write;
        let _ = self.ring.current_mut().txt.write_fmt(args);
    }

    /// Convenience: append a named value to the entry text.
    pub fn log_value(&mut self, name: &str, value: u64) {
        self.extra(format_args!("{}: {:#x}\n", name, value));
    }

    // Controller operations.

    /// Record a CPU mode change. The caller must end the translation block
    /// after this, so that a resulting loglevel switch applies at the block
    /// boundary.
    pub fn mode_switch(&mut self, mode: CpuMode, pc: u64) {
        let entry = self.ring.current_mut();
        entry.flags.insert(EntryFlags::MODE_SWITCH);
        entry.next_cpu_mode = mode;

        if !self.shared.instr_enabled() || self.loglevel != LogLevel::User {
            return;
        }
        // Pause or resume user-only logging when the interesting mode flips.
        if (mode == CpuMode::User) != self.loglevel_active {
            self.schedule_switch(SwitchRequest {
                next_level: self.loglevel,
                pc,
                global: false,
            });
        }
    }

    /// Discard the current entry at the next commit.
    pub fn drop_entry(&mut self) {
        self.force_drop = true;
    }

    /// Publish the current entry, subject to filters, then reset the
    /// now-current slot for the next instruction.
    pub fn commit(&mut self) {
        self.do_commit();
        self.reset_current();
    }

    fn do_commit(&mut self) {
        if self.force_drop {
            return;
        }
        if !self
            .filters
            .accepts(self.shared.regions.as_ref(), self.ring.current())
        {
            return;
        }
        if self.buffered {
            self.ring.advance();
        } else {
            self.shared.backend.emit_instr(self.cpu, self.ring.current());
            self.stats.entries_emitted += 1;
        }
    }

    fn reset_current(&mut self) {
        self.ring.current_mut().reset();
        self.force_drop = false;
        self.starting = false;
    }

    /// Append a flush marker and drain the ring through the backend.
    ///
    /// With tracing disabled the marker-carrying entry is committed by
    /// force so the flush remains visible to backends. In buffered mode
    /// every committed entry between tail and head is emitted in order.
    pub fn flush(&mut self) {
        let pc = self.ring.current().pc;
        self.ring.current_mut().events.push(Event::State {
            next: TraceStateChange::Flush,
            pc,
        });

        if !self.check_enabled() {
            self.commit();
        }
        if !self.buffered {
            return;
        }

        let backend = Arc::clone(&self.shared.backend);
        let cpu = self.cpu;
        let mut emitted = 0u64;
        self.ring.drain_committed(|entry| {
            backend.emit_instr(cpu, entry);
            emitted += 1;
        });
        self.stats.entries_emitted += emitted;
    }

    /// Render all staged printf slots into the current entry.
    ///
    /// The validity bitmap is always cleared; rendering happens only while
    /// tracing is active, in bit order from least to most significant.
    pub fn printf_dump(&mut self) {
        let mut valid = self.printf.take_valid();
        if !self.check_enabled() {
            return;
        }
        while valid != 0 {
            let ndx = valid.trailing_zeros() as usize;
            valid &= valid - 1;
            let Some(fmt) = self.printf.fmts[ndx] else {
                continue;
            };
            let args = self.printf.args[ndx];
            render_formatted(&mut self.ring.current_mut().txt, fmt, &args);
        }
    }

    /// Request tracing on this CPU at the given level, e.g. from a target
    /// trace-control no-op instruction. Takes effect at the next safe point.
    pub fn start(&mut self, pc: u64, level: LogLevel) {
        assert!(level != LogLevel::None, "start requires a logging level");
        self.shared.enable_instr();
        // Already running in the requested mode.
        if self.loglevel == level && self.loglevel_active {
            return;
        }
        self.schedule_switch(SwitchRequest {
            next_level: level,
            pc,
            global: false,
        });
    }

    /// Request tracing off on this CPU. Takes effect at the next safe point.
    pub fn stop(&mut self, pc: u64) {
        self.schedule_switch(SwitchRequest {
            next_level: LogLevel::None,
            pc,
            global: false,
        });
    }

    pub(crate) fn schedule_switch(&self, req: SwitchRequest) {
        let _ = self
            .work_tx
            .send(Box::new(move |tracer, env| tracer.apply_loglevel_switch(env, req)));
    }

    /// Apply queued cross-CPU work. Must be called by the owning worker at a
    /// safe point between translation blocks.
    pub fn process_pending(&mut self, env: &dyn CpuEnv) {
        let rx = self.work_rx.clone();
        while let Ok(work) = rx.try_recv() {
            work(self, env);
        }
    }

    /// Change the logging level, emitting slice boundary events.
    ///
    /// When logging starts, the Start event is staged in the current entry
    /// but only becomes visible with the first committed instruction: the
    /// path from here back to the translation loop may take an interrupt
    /// that immediately switches mode and stops again, and that abandoned
    /// start must not produce an empty slice.
    pub(crate) fn apply_loglevel_switch(&mut self, env: &dyn CpuEnv, req: SwitchRequest) {
        let pc = if req.global { env.recent_pc() } else { req.pc };
        debug_assert!(
            self.shared.instr_enabled(),
            "loglevel switch with the global instruction-log bit clear"
        );

        let next_active = match req.next_level {
            LogLevel::None => false,
            LogLevel::All => true,
            LogLevel::User => {
                // The current entry holds the mode switch that triggered us,
                // if any; otherwise ask the CPU directly.
                let entry = self.ring.current();
                if entry.flags.contains(EntryFlags::MODE_SWITCH) {
                    entry.next_cpu_mode == CpuMode::User
                } else {
                    env.in_user_mode()
                }
            }
        };

        let prev_level = self.loglevel;
        let prev_active = self.loglevel_active;
        self.loglevel = req.next_level;
        self.loglevel_active = next_active;

        if req.next_level == prev_level && prev_active == next_active {
            return;
        }

        if prev_active {
            if self.starting {
                // The pending start never saw a commit; abandon it silently.
                self.reset_current();
            } else {
                self.ring.current_mut().events.push(Event::State {
                    next: TraceStateChange::Stop,
                    pc,
                });
                self.stats.trace_stop += 1;
                self.do_commit();
                self.reset_current();
            }
        }
        if next_active {
            self.starting = true;
            self.emit_start(env, pc);
            if let Some(gpr) = env.regdump() {
                self.ring.current_mut().events.push(Event::RegDump { gpr });
            }
            self.stats.trace_start += 1;
        }
    }

    fn emit_start(&mut self, env: &dyn CpuEnv, pc: u64) {
        let paddr = get_paddr(env, pc);
        let entry = self.ring.current_mut();
        // Start events never carry complete instruction data; stamping the
        // PC here keeps the field correct even on this first partial entry.
        entry.flags.remove(EntryFlags::HAS_INSTR_DATA);
        entry.pc = pc;
        entry.paddr = paddr;
        entry.events.push(Event::State {
            next: TraceStateChange::Start,
            pc,
        });
    }

    pub(crate) fn resize_ring(&mut self, capacity: usize) {
        self.ring.reinit(capacity);
        self.force_drop = false;
        self.starting = false;
    }

    pub(crate) fn sync_backend(&self) {
        self.shared.backend.sync(self.cpu);
        self.dump_debug_stats();
    }

    fn dump_debug_stats(&self) {
        if !self.shared.trace_debug() {
            return;
        }
        info!(
            cpu = self.cpu,
            entries_emitted = self.stats.entries_emitted,
            trace_slices = self.stats.trace_start,
            "instruction tracing statistics"
        );
        if self.stats.trace_start != self.stats.trace_stop {
            warn!(
                cpu = self.cpu,
                trace_stop = self.stats.trace_stop,
                "unbalanced trace stop count"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::session::SessionShared;
    use crossbeam_channel::unbounded;
    use std::sync::Mutex;

    struct TestEnv {
        user_mode: bool,
        pc: u64,
    }

    impl CpuEnv for TestEnv {
        fn in_user_mode(&self) -> bool {
            self.user_mode
        }

        fn recent_pc(&self) -> u64 {
            self.pc
        }

        fn translate(&self, vaddr: u64) -> Option<u64> {
            Some(vaddr | 0x8000_0000_0000)
        }

        fn regdump(&self) -> Option<Vec<RegisterRecord>> {
            Some(vec![RegisterRecord::Gpr {
                name: "r0",
                value: 0,
            }])
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        entries: Mutex<Vec<Entry>>,
    }

    impl Backend for RecordingBackend {
        fn emit_instr(&self, _cpu: CpuId, entry: &Entry) {
            self.entries.lock().unwrap().push(entry.clone());
        }
    }

    fn tracer_with_capacity(capacity: usize) -> (CpuTracer, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let shared = Arc::new(SessionShared::for_tests(backend.clone()));
        let (tx, rx) = unbounded();
        (CpuTracer::new(0, shared, capacity, tx, rx), backend)
    }

    fn enabled_tracer(capacity: usize) -> (CpuTracer, Arc<RecordingBackend>, TestEnv) {
        let (mut tracer, backend) = tracer_with_capacity(capacity);
        let env = TestEnv {
            user_mode: false,
            pc: 0,
        };
        tracer.shared.enable_instr();
        tracer.apply_loglevel_switch(
            &env,
            SwitchRequest {
                next_level: LogLevel::All,
                pc: 0,
                global: false,
            },
        );
        (tracer, backend, env)
    }

    #[test]
    fn test_ring_overflow_drops_oldest_committed() {
        let (mut tracer, backend, env) = enabled_tracer(4);
        tracer.set_buffered(true);

        for pc in 0..6u64 {
            tracer.instr(&env, 0x1000 + pc, &[0x90]);
            tracer.commit();
        }
        tracer.flush();

        let entries = backend.entries.lock().unwrap();
        assert_eq!(entries.len(), 4);
        let pcs: Vec<u64> = entries.iter().map(|e| e.pc).collect();
        assert_eq!(pcs, vec![0x1002, 0x1003, 0x1004, 0x1005]);
        // The flush marker rides the still-uncommitted current entry.
        assert!(tracer
            .current()
            .events
            .iter()
            .any(|e| matches!(e, Event::State { next: TraceStateChange::Flush, .. })));
    }

    #[test]
    fn test_force_drop_suppresses_emission() {
        let (mut tracer, backend, env) = enabled_tracer(8);
        tracer.instr(&env, 0x1000, &[0x90]);
        tracer.drop_entry();
        tracer.commit();
        // The start entry was dropped along with everything else.
        assert!(backend.entries.lock().unwrap().is_empty());
        assert!(tracer.current().is_empty());
    }

    #[test]
    fn test_filter_rejection_suppresses_emission() {
        let (mut tracer, backend, env) = enabled_tracer(8);
        // Consume the entry carrying the start events.
        tracer.commit();
        tracer.add_filter(TraceFilter::Events);

        tracer.instr(&env, 0x1000, &[0x90]);
        tracer.commit();
        assert_eq!(backend.entries.lock().unwrap().len(), 1);

        tracer.event(Event::User {
            id: 1,
            data: vec![],
        });
        tracer.commit();
        assert_eq!(backend.entries.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_noop_switch_emits_nothing() {
        let (mut tracer, backend, env) = enabled_tracer(8);
        tracer.commit();
        let stats = tracer.stats();

        tracer.apply_loglevel_switch(
            &env,
            SwitchRequest {
                next_level: LogLevel::All,
                pc: 0x2000,
                global: false,
            },
        );
        assert_eq!(tracer.stats(), stats);
        assert_eq!(backend.entries.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_commit_when_inactive_still_resets() {
        let (mut tracer, backend) = tracer_with_capacity(8);
        tracer.shared.enable_instr();
        // Collector calls are no-ops while inactive.
        tracer.reg("rax", 1);
        tracer.asid(7);
        assert!(tracer.current().is_empty());
        tracer.commit();
        // Streaming commit of an empty entry still reaches the backend; the
        // translator only pairs commits with traced instructions.
        assert_eq!(backend.entries.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_paddr_sentinel_on_translation_failure() {
        struct NoMmu;
        impl CpuEnv for NoMmu {
            fn in_user_mode(&self) -> bool {
                false
            }
            fn recent_pc(&self) -> u64 {
                0
            }
            fn translate(&self, _vaddr: u64) -> Option<u64> {
                None
            }
            fn regdump(&self) -> Option<Vec<RegisterRecord>> {
                None
            }
        }

        let (mut tracer, _backend) = tracer_with_capacity(8);
        tracer.shared.enable_instr();
        let env = NoMmu;
        tracer.apply_loglevel_switch(
            &env,
            SwitchRequest {
                next_level: LogLevel::All,
                pc: 0x1000,
                global: false,
            },
        );
        tracer.ld_int(&env, 0x4000, MemOp::new(8, false, false), 0xff);
        let entry = tracer.current();
        assert_eq!(entry.paddr, PADDR_NONE);
        assert_eq!(entry.mem[0].paddr, PADDR_NONE);
    }

    #[test]
    fn test_printf_dump_inactive_clears_validity() {
        let (mut tracer, _backend) = tracer_with_capacity(8);
        tracer.printf_buf_mut().valid_entries = 0b101;
        tracer.printf_dump();
        assert_eq!(tracer.printf_buf_mut().valid_entries, 0);
        assert!(tracer.current().txt.is_empty());
    }
}
