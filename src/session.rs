//! Process-wide trace services.
//!
//! A [`TraceSession`] owns everything shared between CPUs: the active
//! backend, the global log-flag bitset, the debug-region service and the
//! filter list applied to newly created CPUs. Cross-CPU operations never
//! touch another CPU's state directly; they enqueue work on the owning
//! worker's mailbox and the worker applies it between translation blocks.

use crate::backend::{Backend, CpuId};
use crate::filter::{AddressRanges, NoRegions, TraceFilter};
use crate::ring::MIN_ENTRY_BUFFER_SIZE;
use crate::tracer::{CpuEnv, CpuTracer, CpuWork, LogLevel, SwitchRequest};
use bitflags::bitflags;
use crossbeam_channel::{bounded, unbounded, Sender};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

bitflags! {
    /// Global instruction-logging request bits, as set by the monitor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LogFlags: u32 {
        /// Trace instructions on all CPUs.
        const INSTR = 1 << 0;
        /// Trace user-mode instructions only. Implies `INSTR`.
        const INSTR_U = 1 << 1;
    }
}

/// State shared between the session handle and every per-CPU tracer.
/// Backend, region service and defaults are fixed at build time; only the
/// flag word and buffer size mutate afterwards, and only via the monitor
/// paths.
pub(crate) struct SessionShared {
    log_flags: AtomicU32,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) regions: Arc<dyn AddressRanges>,
    trace_debug: AtomicBool,
    entry_buffer_size: AtomicUsize,
}

impl SessionShared {
    pub(crate) fn log_flags(&self) -> LogFlags {
        LogFlags::from_bits_truncate(self.log_flags.load(Ordering::Acquire))
    }

    pub(crate) fn instr_enabled(&self) -> bool {
        self.log_flags().contains(LogFlags::INSTR)
    }

    /// Latch the global instruction-log bit. Never cleared by a disable:
    /// per-CPU activity gates emission, and clearing eagerly would cut off
    /// CPUs still inside their current translation block.
    pub(crate) fn enable_instr(&self) {
        self.log_flags
            .fetch_or(LogFlags::INSTR.bits(), Ordering::AcqRel);
    }

    fn set_user_bit(&self, user: bool) {
        if user {
            self.log_flags
                .fetch_or(LogFlags::INSTR_U.bits(), Ordering::AcqRel);
        } else {
            self.log_flags
                .fetch_and(!LogFlags::INSTR_U.bits(), Ordering::AcqRel);
        }
    }

    pub(crate) fn trace_debug(&self) -> bool {
        self.trace_debug.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(backend: Arc<dyn Backend>) -> Self {
        SessionShared {
            log_flags: AtomicU32::new(0),
            backend,
            regions: Arc::new(NoRegions),
            trace_debug: AtomicBool::new(false),
            entry_buffer_size: AtomicUsize::new(MIN_ENTRY_BUFFER_SIZE),
        }
    }
}

/// Error from [`TraceSession::set_cli_filters`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliFilterError {
    UnknownFilter(String),
}

impl fmt::Display for CliFilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliFilterError::UnknownFilter(name) => {
                write!(f, "invalid trace filter name: {:?}", name)
            }
        }
    }
}

impl std::error::Error for CliFilterError {}

struct CpuHandle {
    cpu: CpuId,
    tx: Sender<CpuWork>,
}

/// Builder for a [`TraceSession`]. The backend and collaborator services are
/// fixed once built.
pub struct TraceSessionBuilder {
    backend: Arc<dyn Backend>,
    regions: Arc<dyn AddressRanges>,
    entry_buffer_size: usize,
    trace_debug: bool,
    log_flags: LogFlags,
}

impl Default for TraceSessionBuilder {
    fn default() -> Self {
        TraceSessionBuilder {
            backend: crate::backend::BackendKind::Text.create(io::stderr()),
            regions: Arc::new(NoRegions),
            entry_buffer_size: MIN_ENTRY_BUFFER_SIZE,
            trace_debug: false,
            log_flags: LogFlags::empty(),
        }
    }
}

impl TraceSessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    /// Inject the debug-region service backing the `MemRegions` filter.
    pub fn debug_regions(mut self, regions: Arc<dyn AddressRanges>) -> Self {
        self.regions = regions;
        self
    }

    /// Default per-CPU ring capacity. Undersized requests keep the previous
    /// value, with a warning.
    pub fn entry_buffer_size(mut self, capacity: usize) -> Self {
        if capacity < MIN_ENTRY_BUFFER_SIZE {
            warn!(
                requested = capacity,
                minimum = MIN_ENTRY_BUFFER_SIZE,
                "trace entry buffer size too small, ignored"
            );
        } else {
            self.entry_buffer_size = capacity;
        }
        self
    }

    pub fn trace_debug(mut self, enable: bool) -> Self {
        self.trace_debug = enable;
        self
    }

    /// Instruction-logging flags requested before any CPU exists, e.g. from
    /// the command line.
    pub fn log_flags(mut self, mut flags: LogFlags) -> Self {
        if flags.contains(LogFlags::INSTR_U) {
            flags.insert(LogFlags::INSTR);
        }
        self.log_flags = flags;
        self
    }

    pub fn build(self) -> TraceSession {
        TraceSession {
            shared: Arc::new(SessionShared {
                log_flags: AtomicU32::new(self.log_flags.bits()),
                backend: self.backend,
                regions: self.regions,
                trace_debug: AtomicBool::new(self.trace_debug),
                entry_buffer_size: AtomicUsize::new(self.entry_buffer_size),
            }),
            cpus: Mutex::new(Vec::new()),
            reset_filters: Mutex::new(Vec::new()),
        }
    }
}

/// Process-wide trace engine handle.
pub struct TraceSession {
    shared: Arc<SessionShared>,
    cpus: Mutex<Vec<CpuHandle>>,
    reset_filters: Mutex<Vec<TraceFilter>>,
}

impl TraceSession {
    pub fn builder() -> TraceSessionBuilder {
        TraceSessionBuilder::new()
    }

    /// Current global log-flag word.
    pub fn log_flags(&self) -> LogFlags {
        self.shared.log_flags()
    }

    pub fn enable_trace_debug(&self) {
        self.shared.trace_debug.store(true, Ordering::Relaxed);
    }

    /// Create the tracing state for a new CPU. Must be called on the thread
    /// that will own the CPU; the returned tracer moves to that worker.
    ///
    /// Applies the reset filters, runs backend init, and switches logging on
    /// immediately if the global flags already request it.
    pub fn attach_cpu(&self, cpu: CpuId, env: &dyn CpuEnv) -> CpuTracer {
        let (tx, rx) = unbounded();
        let capacity = self.shared.entry_buffer_size.load(Ordering::Relaxed);
        let mut tracer = CpuTracer::new(cpu, Arc::clone(&self.shared), capacity, tx.clone(), rx);
        // Register first so cross-CPU operations reach this CPU as soon as
        // it exists; queued work is applied at its first safe point.
        self.cpus.lock().unwrap().push(CpuHandle { cpu, tx });

        for filter in self.reset_filters.lock().unwrap().iter() {
            tracer.add_filter(*filter);
        }

        self.shared.backend.init(cpu);

        let flags = self.shared.log_flags();
        if flags.intersects(LogFlags::INSTR | LogFlags::INSTR_U) {
            debug_assert!(
                flags.contains(LogFlags::INSTR),
                "INSTR_U implies INSTR broken"
            );
            let level = if flags.contains(LogFlags::INSTR_U) {
                LogLevel::User
            } else {
                LogLevel::All
            };
            tracer.apply_loglevel_switch(
                env,
                SwitchRequest {
                    next_level: level,
                    pc: 0,
                    global: true,
                },
            );
        }

        tracer
    }

    /// Forget a CPU torn down by the emulator.
    pub fn detach_cpu(&self, cpu: CpuId) {
        self.cpus.lock().unwrap().retain(|h| h.cpu != cpu);
    }

    fn broadcast(&self, make: impl Fn() -> CpuWork) {
        for handle in self.cpus.lock().unwrap().iter() {
            let _ = handle.tx.send(make());
        }
    }

    /// Monitor-facing switch: map the flag word onto a per-CPU level and
    /// schedule the change on every CPU. The change takes effect only once
    /// each CPU reaches its next safe point, i.e. after it has left its
    /// current translation block. Returns the normalized flag word
    /// (`INSTR_U` implies `INSTR`).
    pub fn global_switch(&self, mut flags: LogFlags) -> LogFlags {
        if flags.contains(LogFlags::INSTR_U) {
            flags.insert(LogFlags::INSTR);
        }
        let next_level = if flags.contains(LogFlags::INSTR_U) {
            LogLevel::User
        } else if flags.contains(LogFlags::INSTR) {
            LogLevel::All
        } else {
            LogLevel::None
        };

        // The global bit must be observable before any per-CPU switch runs.
        if next_level != LogLevel::None {
            self.shared.enable_instr();
        }
        self.shared
            .set_user_bit(flags.contains(LogFlags::INSTR_U));

        self.broadcast(|| {
            Box::new(move |tracer: &mut CpuTracer, env: &dyn CpuEnv| {
                tracer.apply_loglevel_switch(
                    env,
                    SwitchRequest {
                        next_level,
                        pc: 0,
                        global: true,
                    },
                );
            })
        });

        flags
    }

    /// Start tracing on every CPU at the given level.
    pub fn start_all(&self, level: LogLevel) {
        assert!(level != LogLevel::None, "start requires a logging level");
        self.shared.enable_instr();
        self.broadcast(|| {
            Box::new(move |tracer: &mut CpuTracer, env: &dyn CpuEnv| {
                if tracer.loglevel() == level && tracer.loglevel_active() {
                    return;
                }
                tracer.apply_loglevel_switch(
                    env,
                    SwitchRequest {
                        next_level: level,
                        pc: 0,
                        global: true,
                    },
                );
            })
        });
    }

    /// Stop tracing on every CPU.
    pub fn stop_all(&self) {
        self.broadcast(|| {
            Box::new(move |tracer: &mut CpuTracer, env: &dyn CpuEnv| {
                tracer.apply_loglevel_switch(
                    env,
                    SwitchRequest {
                        next_level: LogLevel::None,
                        pc: 0,
                        global: true,
                    },
                );
            })
        });
    }

    /// Resize every CPU's entry ring. Undersized requests are rejected with
    /// a warning and leave all state unchanged.
    pub fn set_buffer_size(&self, capacity: usize) {
        if capacity < MIN_ENTRY_BUFFER_SIZE {
            warn!(
                requested = capacity,
                minimum = MIN_ENTRY_BUFFER_SIZE,
                "trace entry buffer size too small, ignored"
            );
            return;
        }
        self.shared
            .entry_buffer_size
            .store(capacity, Ordering::Relaxed);
        self.broadcast(|| {
            Box::new(move |tracer: &mut CpuTracer, _env: &dyn CpuEnv| {
                tracer.resize_ring(capacity);
            })
        });
    }

    /// Run the backend sync hook in every CPU's own context, blocking until
    /// all CPUs have executed it. May delay the caller; intended for the
    /// shutdown and checkpoint paths.
    pub fn sync_buffers(&self) {
        let handles: Vec<(CpuId, Sender<CpuWork>)> = self
            .cpus
            .lock()
            .unwrap()
            .iter()
            .map(|h| (h.cpu, h.tx.clone()))
            .collect();
        for (_cpu, tx) in handles {
            let (done_tx, done_rx) = bounded(1);
            let work: CpuWork = Box::new(move |tracer: &mut CpuTracer, _env: &dyn CpuEnv| {
                tracer.sync_backend();
                let _ = done_tx.send(());
            });
            if tx.send(work).is_ok() {
                let _ = done_rx.recv();
            }
        }
    }

    /// Forward an out-of-band numeric sample to the backend.
    pub fn counter(&self, cpu: CpuId, counter: u32, value: i64) {
        self.shared.backend.emit_debug(cpu, counter, value);
    }

    /// Install a filter on every existing CPU.
    pub fn add_filter_all(&self, filter: TraceFilter) {
        self.broadcast(|| {
            Box::new(move |tracer: &mut CpuTracer, _env: &dyn CpuEnv| {
                tracer.add_filter(filter);
            })
        });
    }

    /// Remove a filter from every existing CPU.
    pub fn remove_filter_all(&self, filter: TraceFilter) {
        self.broadcast(|| {
            Box::new(move |tracer: &mut CpuTracer, _env: &dyn CpuEnv| {
                tracer.remove_filter(filter);
            })
        });
    }

    /// Install a filter on every CPU, current and future. Before the first
    /// CPU exists the filter lands on the reset list consumed by
    /// [`TraceSession::attach_cpu`].
    pub fn add_startup_filter(&self, filter: TraceFilter) {
        let no_cpus = self.cpus.lock().unwrap().is_empty();
        if no_cpus {
            let mut reset = self.reset_filters.lock().unwrap();
            if !reset.contains(&filter) {
                reset.push(filter);
            }
        } else {
            self.add_filter_all(filter);
        }
    }

    /// Parse a comma-separated filter list from the command line. Stops at
    /// the first unknown name; filters added up to that point stay in
    /// effect.
    pub fn set_cli_filters(&self, spec: &str) -> Result<(), CliFilterError> {
        for name in spec.split(',') {
            match name {
                "events" => self.add_startup_filter(TraceFilter::Events),
                other => return Err(CliFilterError::UnknownFilter(other.to_string())),
            }
        }
        Ok(())
    }
}
