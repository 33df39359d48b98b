//! Trace serialization backends.
//!
//! The core hands every committed [`Entry`] to a single process-wide backend.
//! Backends are deliberately dumb sinks: ordering and filtering have already
//! happened by the time `emit_instr` runs, and record order within an entry
//! must be preserved in the output.

use crate::types::{Entry, EntryFlags};
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use tracing::warn;

/// Index of an emulated CPU.
pub type CpuId = usize;

/// Serialization sink for committed trace entries.
///
/// `init`, `sync` and `emit_debug` are optional hooks with no-op defaults.
/// All hooks are invoked on the owning CPU's thread, `sync` via the blocking
/// session-wide drain.
pub trait Backend: Send + Sync {
    /// Per-CPU one-time setup (headers, file creation).
    fn init(&self, _cpu: CpuId) {}

    /// Blocking checkpoint; flush anything buffered for this CPU.
    fn sync(&self, _cpu: CpuId) {}

    /// Serialize one committed entry.
    fn emit_instr(&self, cpu: CpuId, entry: &Entry);

    /// Out-of-band numeric sample from the debug counter interface.
    fn emit_debug(&self, _cpu: CpuId, _counter: u32, _value: i64) {}
}

/// Backend selector. A single kind is active per process, chosen at startup;
/// switching after CPUs exist is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Text,
    CvTrace,
    Nop,
    Perfetto,
    Protobuf,
    Json,
    DrCacheSim,
}

impl BackendKind {
    /// Instantiate the backend, writing to `out` where the kind produces
    /// output. Kinds without a built-in implementation degrade to the no-op
    /// backend with a warning.
    pub fn create<W>(self, out: W) -> std::sync::Arc<dyn Backend>
    where
        W: Write + Send + 'static,
    {
        use std::sync::Arc;
        match self {
            BackendKind::Text => Arc::new(TextBackend::new(out)),
            BackendKind::Json => Arc::new(JsonBackend::new(out)),
            BackendKind::Nop => Arc::new(NopBackend),
            other => {
                warn!(kind = ?other, "trace backend not built in, falling back to nop");
                Arc::new(NopBackend)
            }
        }
    }
}

/// Backend that discards everything. Lets users switch tracing off at
/// runtime without reconfiguring the trace machinery.
#[derive(Debug, Default)]
pub struct NopBackend;

impl Backend for NopBackend {
    fn emit_instr(&self, _cpu: CpuId, _entry: &Entry) {}
}

/// Human-readable text backend.
pub struct TextBackend<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> TextBackend<W> {
    pub fn new(out: W) -> Self {
        TextBackend {
            out: Mutex::new(out),
        }
    }

    fn write_entry(&self, cpu: CpuId, entry: &Entry) -> std::io::Result<()> {
        let mut out = self.out.lock().expect("text backend writer poisoned");
        if entry.flags.contains(EntryFlags::HAS_INSTR_DATA) {
            writeln!(
                out,
                "[{}:{}] {:#018x}: {}",
                entry.asid,
                cpu,
                entry.pc,
                hex::encode(entry.insn())
            )?;
        } else {
            writeln!(out, "[{}:{}] {:#018x}: <no instruction>", entry.asid, cpu, entry.pc)?;
        }
        if entry.flags.contains(EntryFlags::MODE_SWITCH) {
            writeln!(out, "    mode -> {}", entry.next_cpu_mode)?;
        }
        if entry.flags.contains(EntryFlags::INTR_TRAP) {
            writeln!(
                out,
                "    exception {} vector {:#x} fault {:#x}",
                entry.intr_code, entry.intr_vector, entry.intr_faultaddr
            )?;
        } else if entry.flags.contains(EntryFlags::INTR_ASYNC) {
            writeln!(
                out,
                "    interrupt {} vector {:#x}",
                entry.intr_code, entry.intr_vector
            )?;
        }
        for reg in &entry.regs {
            writeln!(out, "    {}", reg)?;
        }
        for mem in &entry.mem {
            writeln!(out, "    {}", mem)?;
        }
        for event in &entry.events {
            writeln!(out, "    {}", event)?;
        }
        if !entry.txt.is_empty() {
            for line in entry.txt.lines() {
                writeln!(out, "    {}", line)?;
            }
        }
        Ok(())
    }
}

impl<W: Write + Send> Backend for TextBackend<W> {
    fn sync(&self, _cpu: CpuId) {
        let mut out = self.out.lock().expect("text backend writer poisoned");
        if let Err(err) = out.flush() {
            warn!(%err, "text trace flush failed");
        }
    }

    fn emit_instr(&self, cpu: CpuId, entry: &Entry) {
        if let Err(err) = self.write_entry(cpu, entry) {
            warn!(%err, "text trace write failed");
        }
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    cpu: CpuId,
    #[serde(skip_serializing_if = "Option::is_none")]
    insn: Option<String>,
    #[serde(flatten)]
    entry: &'a Entry,
}

/// JSON-lines backend: one serialized entry per line.
pub struct JsonBackend<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonBackend<W> {
    pub fn new(out: W) -> Self {
        JsonBackend {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send> Backend for JsonBackend<W> {
    fn sync(&self, _cpu: CpuId) {
        let mut out = self.out.lock().expect("json backend writer poisoned");
        if let Err(err) = out.flush() {
            warn!(%err, "json trace flush failed");
        }
    }

    fn emit_instr(&self, cpu: CpuId, entry: &Entry) {
        let record = JsonRecord {
            cpu,
            insn: entry
                .flags
                .contains(EntryFlags::HAS_INSTR_DATA)
                .then(|| hex::encode(entry.insn())),
            entry,
        };
        let mut out = self.out.lock().expect("json backend writer poisoned");
        let result = serde_json::to_writer(&mut *out, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| out.write_all(b"\n"));
        if let Err(err) = result {
            warn!(%err, "json trace write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegisterRecord;
    use std::sync::{Arc, Mutex as StdMutex};

    /// Shared growable sink so tests can inspect backend output.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<StdMutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sample_entry() -> Entry {
        let mut entry = Entry::default();
        entry.pc = 0x1000;
        entry.flags = EntryFlags::HAS_INSTR_DATA;
        entry.insn_bytes[0] = 0x90;
        entry.insn_size = 1;
        entry.regs.push(RegisterRecord::Gpr {
            name: "rax",
            value: 0x42,
        });
        entry
    }

    #[test]
    fn test_text_backend_renders_entry() {
        let buf = SharedBuf::default();
        let backend = TextBackend::new(buf.clone());
        backend.emit_instr(0, &sample_entry());
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("0x0000000000001000: 90"));
        assert!(text.contains("rax = 0x42"));
    }

    #[test]
    fn test_json_backend_emits_one_line() {
        let buf = SharedBuf::default();
        let backend = JsonBackend::new(buf.clone());
        backend.emit_instr(1, &sample_entry());
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(value["cpu"], 1);
        assert_eq!(value["insn"], "90");
        assert_eq!(value["pc"], 0x1000);
    }

    #[test]
    fn test_unsupported_kind_falls_back_to_nop() {
        let backend = BackendKind::Perfetto.create(std::io::sink());
        backend.emit_instr(0, &sample_entry());
        backend.sync(0);
    }
}
