//! Staged printf: cheap translation-time capture of formatted debug output.
//!
//! Translated code cannot afford a full printf call per debug line. Instead,
//! the translator stages each printf at translation time: [`gen_printf`]
//! drives the translator's IR builder to emit one typed store per argument
//! plus a single OR marking the slot valid. The accumulated slots are
//! rendered much later, by [`crate::CpuTracer::printf_dump`], and only when
//! the owning entry is actually being traced.
//!
//! The staging area holds raw 8-byte argument words with no type tags; the
//! renderer recovers each argument's type from the format string, the same
//! contract a varargs printf has.

use std::fmt::Write;

/// Number of printf slots that can be staged between flushes.
pub const PRINTF_BUF_DEPTH: usize = 32;

/// Maximum arguments per staged printf.
pub const PRINTF_ARG_MAX: usize = 8;

/// Slot count that forces a render call at the next flush point.
pub const PRINTF_FLUSH_BARRIER: usize = 32;

/// Per-CPU staging area written by generated code.
#[derive(Debug, Clone)]
pub struct PrintfBuf {
    pub fmts: [Option<&'static str>; PRINTF_BUF_DEPTH],
    pub args: [[u64; PRINTF_ARG_MAX]; PRINTF_BUF_DEPTH],
    /// Bitmap of slots holding a staged printf.
    pub valid_entries: u64,
}

impl Default for PrintfBuf {
    fn default() -> Self {
        PrintfBuf {
            fmts: [None; PRINTF_BUF_DEPTH],
            args: [[0; PRINTF_ARG_MAX]; PRINTF_BUF_DEPTH],
            valid_entries: 0,
        }
    }
}

impl PrintfBuf {
    /// Claim the validity bitmap, leaving it clear.
    pub fn take_valid(&mut self) -> u64 {
        std::mem::take(&mut self.valid_entries)
    }
}

/// Per-translation-block staging cursor, owned by the translator's context.
#[derive(Debug, Default)]
pub struct PrintfStage {
    used: usize,
}

impl PrintfStage {
    pub fn new() -> Self {
        PrintfStage::default()
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

/// Opaque handle to a runtime value in the translator's IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrValue(pub u32);

/// Source of one staged argument, matching the type-spec characters:
/// `c` compile-time constant, `w` 32-bit runtime value, `d` 64-bit runtime
/// value.
#[derive(Debug, Clone, Copy)]
pub enum StagedArg {
    ConstInt(u64),
    ConstFloat(f64),
    Rt32(IrValue),
    Rt64(IrValue),
}

/// Width of a generated store into the argument area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWidth {
    B1,
    B2,
    B4,
    B8,
}

impl StoreWidth {
    fn from_size(size: usize) -> Self {
        match size {
            1 => StoreWidth::B1,
            2 => StoreWidth::B2,
            4 => StoreWidth::B4,
            8 => StoreWidth::B8,
            _ => unreachable!("invalid argument store size"),
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            StoreWidth::B1 => 0xff,
            StoreWidth::B2 => 0xffff,
            StoreWidth::B4 => 0xffff_ffff,
            StoreWidth::B8 => u64::MAX,
        }
    }
}

/// Extension applied when widening a 32-bit runtime value to an 8-byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    Zero,
    Sign,
}

/// The translator's IR builder, as seen by the staging generator.
///
/// Each method emits code into the current translation block; nothing runs
/// until the block executes. An interpreter-style implementation may instead
/// apply the effects immediately (see [`ImmediateSink`]).
pub trait PrintfSink {
    /// Store the format literal for `slot`.
    fn store_fmt(&mut self, slot: usize, fmt: &'static str);

    /// OR `mask` into the validity bitmap.
    fn or_valid(&mut self, mask: u64);

    /// Store a compile-time constant into an argument word.
    fn store_const(&mut self, slot: usize, arg: usize, width: StoreWidth, bits: u64);

    /// Store a 32-bit runtime value; `extend` applies only to full-width
    /// stores promoting the value to 64 bits.
    fn store_rt32(&mut self, slot: usize, arg: usize, width: StoreWidth, src: IrValue, extend: Extend);

    /// Store a 64-bit runtime value, truncated to `width`.
    fn store_rt64(&mut self, slot: usize, arg: usize, width: StoreWidth, src: IrValue);

    /// Call the runtime render helper.
    fn call_render(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Length {
    None,
    Short,
    Long,
    LongLong,
}

#[derive(Debug, Clone, Copy)]
struct Conv {
    minus: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
    width: Option<usize>,
    precision: Option<usize>,
    length: Length,
    conv: u8,
}

/// Parse one conversion starting just after a `%`. Returns the spec and the
/// number of bytes consumed. `conv == b'%'` denotes a literal percent.
fn parse_conversion(bytes: &[u8]) -> (Conv, usize) {
    let mut conv = Conv {
        minus: false,
        plus: false,
        space: false,
        zero: false,
        alt: false,
        width: None,
        precision: None,
        length: Length::None,
        conv: 0,
    };
    let mut i = 0;
    loop {
        match bytes.get(i) {
            Some(&b'-') => conv.minus = true,
            Some(&b'+') => conv.plus = true,
            Some(&b' ') => conv.space = true,
            Some(&b'0') => conv.zero = true,
            Some(&b'#') => conv.alt = true,
            _ => break,
        }
        i += 1;
    }
    while let Some(&d) = bytes.get(i) {
        if !d.is_ascii_digit() {
            break;
        }
        conv.width = Some(conv.width.unwrap_or(0) * 10 + (d - b'0') as usize);
        i += 1;
    }
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        let mut prec = 0;
        while let Some(&d) = bytes.get(i) {
            if !d.is_ascii_digit() {
                break;
            }
            prec = prec * 10 + (d - b'0') as usize;
            i += 1;
        }
        conv.precision = Some(prec);
    }
    while let Some(&l) = bytes.get(i) {
        match l {
            b'h' => conv.length = Length::Short,
            b'l' => {
                conv.length = if conv.length == Length::Long {
                    Length::LongLong
                } else {
                    Length::Long
                };
            }
            _ => break,
        }
        i += 1;
    }
    conv.conv = *bytes
        .get(i)
        .expect("format string ends inside a conversion");
    (conv, i + 1)
}

/// Storage size in bytes and signedness for a conversion.
fn conv_storage(conv: &Conv) -> (usize, bool) {
    match conv.conv {
        b'c' => (1, false),
        b'd' | b'i' => (int_size(conv.length), true),
        b'u' | b'x' | b'X' | b'o' => (int_size(conv.length), false),
        b'e' | b'E' | b'f' | b'g' | b'G' => {
            if matches!(conv.length, Length::Long | Length::LongLong) {
                (8, false)
            } else {
                (4, false)
            }
        }
        b's' | b'p' => (8, false),
        other => panic!("unsupported printf conversion '{}'", other as char),
    }
}

fn int_size(length: Length) -> usize {
    match length {
        Length::Short => 2,
        Length::None => 4,
        Length::Long | Length::LongLong => 8,
    }
}

/// Stage one printf at translation time.
///
/// Reserves the next slot, emits the format-pointer store and validity OR,
/// then walks `fmt` and `type_spec` in lockstep emitting one typed store per
/// conversion. Panics when the slot or argument capacity is exceeded or the
/// format string and type spec disagree; these are translator bugs, not
/// runtime conditions.
pub fn gen_printf(
    stage: &mut PrintfStage,
    sink: &mut dyn PrintfSink,
    type_spec: &str,
    fmt: &'static str,
    args: &[StagedArg],
) {
    let ndx = stage.used;
    stage.used += 1;
    assert!(
        ndx < PRINTF_BUF_DEPTH,
        "staged printf slots exhausted; flush earlier or raise the buffer depth"
    );

    sink.store_fmt(ndx, fmt);
    sink.or_valid(1u64 << ndx);

    let mut types = type_spec.bytes();
    let mut argv = args.iter();
    let bytes = fmt.as_bytes();
    let mut i = 0;
    let mut argn = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        let (conv, used) = parse_conversion(&bytes[i + 1..]);
        i += 1 + used;
        if conv.conv == b'%' {
            continue;
        }

        assert!(argn < PRINTF_ARG_MAX, "staged printf argument slots exhausted");
        let t = types
            .next()
            .expect("type spec exhausted before format string");
        let arg = *argv
            .next()
            .expect("fewer staged arguments than conversions");
        let matches_spec = matches!(
            (t, arg),
            (b'c', StagedArg::ConstInt(_))
                | (b'c', StagedArg::ConstFloat(_))
                | (b'w', StagedArg::Rt32(_))
                | (b'd', StagedArg::Rt64(_))
        );
        assert!(
            matches_spec,
            "type spec '{}' does not match staged argument {:?}",
            t as char, arg
        );

        let (size, signed) = conv_storage(&conv);
        let width = StoreWidth::from_size(size);
        match arg {
            StagedArg::ConstInt(v) => sink.store_const(ndx, argn, width, v & width.mask()),
            StagedArg::ConstFloat(v) => {
                let bits = if size == 8 {
                    v.to_bits()
                } else {
                    (v as f32).to_bits() as u64
                };
                sink.store_const(ndx, argn, width, bits);
            }
            StagedArg::Rt32(src) => {
                let extend = if signed { Extend::Sign } else { Extend::Zero };
                sink.store_rt32(ndx, argn, width, src, extend);
            }
            StagedArg::Rt64(src) => sink.store_rt64(ndx, argn, width, src),
        }
        argn += 1;
    }
    assert!(
        types.next().is_none() && argv.next().is_none(),
        "format string and type spec must exhaust together"
    );
}

/// Emit the render call if the staged slots warrant one, and reset the
/// stage. `flush_early` flushes any non-empty stage; `force` flushes
/// unconditionally.
pub fn gen_printf_flush(
    stage: &mut PrintfStage,
    sink: &mut dyn PrintfSink,
    flush_early: bool,
    force: bool,
) {
    if force
        || (stage.used != 0 && (flush_early || stage.used >= PRINTF_FLUSH_BARRIER))
    {
        sink.call_render();
        stage.used = 0;
    }
}

/// Render one staged format string against its argument words.
///
/// Literal runs are copied through; each conversion reinterprets its 8-byte
/// word by the type the format string declares, exactly as the generated
/// stores wrote it.
pub(crate) fn render_formatted(out: &mut String, fmt: &str, args: &[u64; PRINTF_ARG_MAX]) {
    let bytes = fmt.as_bytes();
    let mut i = 0;
    let mut start = 0;
    let mut argn = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        out.push_str(&fmt[start..i]);
        let (conv, used) = parse_conversion(&bytes[i + 1..]);
        i += 1 + used;
        start = i;
        if conv.conv == b'%' {
            out.push('%');
            continue;
        }
        assert!(argn < PRINTF_ARG_MAX, "rendered more arguments than staged");
        render_conv(out, &conv, args[argn]);
        argn += 1;
    }
    out.push_str(&fmt[start..]);
}

fn render_conv(out: &mut String, conv: &Conv, raw: u64) {
    match conv.conv {
        b'c' => {
            let s = char::from(raw as u8).to_string();
            pad_str(out, conv, &s);
        }
        b'd' | b'i' => {
            let v: i64 = match conv.length {
                Length::Short => raw as u16 as i16 as i64,
                Length::None => raw as u32 as i32 as i64,
                Length::Long | Length::LongLong => raw as i64,
            };
            format_int(out, conv, v < 0, v.unsigned_abs(), 10, false, "");
        }
        b'u' | b'x' | b'X' | b'o' => {
            let v: u64 = match conv.length {
                Length::Short => raw as u16 as u64,
                Length::None => raw as u32 as u64,
                Length::Long | Length::LongLong => raw,
            };
            let (radix, upper, prefix) = match conv.conv {
                b'u' => (10, false, ""),
                b'x' => (16, false, "0x"),
                b'X' => (16, true, "0X"),
                _ => (8, false, "0"),
            };
            let prefix = if conv.alt && v != 0 { prefix } else { "" };
            format_int(out, conv, false, v, radix, upper, prefix);
        }
        b'e' | b'E' | b'f' | b'g' | b'G' => {
            let v = if matches!(conv.length, Length::Long | Length::LongLong) {
                f64::from_bits(raw)
            } else {
                f32::from_bits(raw as u32) as f64
            };
            let prec = conv.precision.unwrap_or(6);
            let mut s = String::new();
            match conv.conv {
                b'f' => write!(s, "{:.*}", prec, v).unwrap(),
                b'e' | b'E' => write!(s, "{:.*e}", prec, v).unwrap(),
                _ => write!(s, "{}", v).unwrap(),
            }
            if conv.conv.is_ascii_uppercase() {
                s.make_ascii_uppercase();
            }
            pad_str(out, conv, &s);
        }
        // Pointers render numerically; the staging area holds raw words, so
        // string arguments must go through the format literal instead.
        b's' | b'p' => {
            let s = format!("0x{:x}", raw);
            pad_str(out, conv, &s);
        }
        other => panic!("unsupported printf conversion '{}'", other as char),
    }
}

fn format_int(
    out: &mut String,
    conv: &Conv,
    negative: bool,
    magnitude: u64,
    radix: u32,
    upper: bool,
    prefix: &str,
) {
    let mut digits = match radix {
        10 => format!("{}", magnitude),
        16 if upper => format!("{:X}", magnitude),
        16 => format!("{:x}", magnitude),
        _ => format!("{:o}", magnitude),
    };
    if let Some(prec) = conv.precision {
        while digits.len() < prec {
            digits.insert(0, '0');
        }
    }
    let sign = if negative {
        "-"
    } else if conv.plus {
        "+"
    } else if conv.space {
        " "
    } else {
        ""
    };

    let body_len = sign.len() + prefix.len() + digits.len();
    let width = conv.width.unwrap_or(0);
    let fill = width.saturating_sub(body_len);
    if conv.minus {
        out.push_str(sign);
        out.push_str(prefix);
        out.push_str(&digits);
        out.extend(std::iter::repeat(' ').take(fill));
    } else if conv.zero && conv.precision.is_none() {
        out.push_str(sign);
        out.push_str(prefix);
        out.extend(std::iter::repeat('0').take(fill));
        out.push_str(&digits);
    } else {
        out.extend(std::iter::repeat(' ').take(fill));
        out.push_str(sign);
        out.push_str(prefix);
        out.push_str(&digits);
    }
}

fn pad_str(out: &mut String, conv: &Conv, s: &str) {
    let width = conv.width.unwrap_or(0);
    let fill = width.saturating_sub(s.chars().count());
    if conv.minus {
        out.push_str(s);
        out.extend(std::iter::repeat(' ').take(fill));
    } else {
        out.extend(std::iter::repeat(' ').take(fill));
        out.push_str(s);
    }
}

/// Sink for interpreter-style translators: applies every staged store to the
/// buffer immediately instead of emitting code, resolving runtime value
/// handles against the given register views.
pub struct ImmediateSink<'a> {
    pub buf: &'a mut PrintfBuf,
    pub regs32: &'a [u32],
    pub regs64: &'a [u64],
    /// Set when a flush emitted the render call; the caller is expected to
    /// invoke the render helper and clear this.
    pub render_requested: bool,
}

impl<'a> ImmediateSink<'a> {
    pub fn new(buf: &'a mut PrintfBuf, regs32: &'a [u32], regs64: &'a [u64]) -> Self {
        ImmediateSink {
            buf,
            regs32,
            regs64,
            render_requested: false,
        }
    }
}

impl PrintfSink for ImmediateSink<'_> {
    fn store_fmt(&mut self, slot: usize, fmt: &'static str) {
        self.buf.fmts[slot] = Some(fmt);
    }

    fn or_valid(&mut self, mask: u64) {
        self.buf.valid_entries |= mask;
    }

    fn store_const(&mut self, slot: usize, arg: usize, width: StoreWidth, bits: u64) {
        self.buf.args[slot][arg] = bits & width.mask();
    }

    fn store_rt32(&mut self, slot: usize, arg: usize, width: StoreWidth, src: IrValue, extend: Extend) {
        let v = self.regs32[src.0 as usize];
        let stored = match (width, extend) {
            (StoreWidth::B8, Extend::Sign) => v as i32 as i64 as u64,
            (StoreWidth::B8, Extend::Zero) => v as u64,
            (w, _) => (v as u64) & w.mask(),
        };
        self.buf.args[slot][arg] = stored;
    }

    fn store_rt64(&mut self, slot: usize, arg: usize, width: StoreWidth, src: IrValue) {
        self.buf.args[slot][arg] = self.regs64[src.0 as usize] & width.mask();
    }

    fn call_render(&mut self) {
        self.render_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(fmt: &str, args: &[u64]) -> String {
        let mut slot = [0u64; PRINTF_ARG_MAX];
        slot[..args.len()].copy_from_slice(args);
        let mut out = String::new();
        render_formatted(&mut out, fmt, &slot);
        out
    }

    #[test]
    fn test_render_basic_conversions() {
        assert_eq!(render("n=%d", &[7]), "n=7");
        assert_eq!(render("n=%d", &[(-5i32) as u32 as u64]), "n=-5");
        assert_eq!(render("x=%x", &[0xabcd]), "x=abcd");
        assert_eq!(render("X=%X", &[0xabcd]), "X=ABCD");
        assert_eq!(render("o=%o", &[8]), "o=10");
        assert_eq!(render("c=%c", &[b'Q' as u64]), "c=Q");
        assert_eq!(render("100%% done", &[]), "100% done");
    }

    #[test]
    fn test_render_length_modifiers() {
        // Declared type selects how much of the word is read.
        assert_eq!(render("%hd", &[0xffff_8000]), "-32768");
        assert_eq!(render("%ld", &[u64::MAX]), "-1");
        assert_eq!(render("%llx", &[0x1234_5678_9abc_def0]), "123456789abcdef0");
        assert_eq!(render("%u", &[u64::MAX]), "4294967295");
    }

    #[test]
    fn test_render_width_and_flags() {
        assert_eq!(render("%04x", &[0x2a]), "002a");
        assert_eq!(render("%#x", &[0x2a]), "0x2a");
        assert_eq!(render("%6d", &[42]), "    42");
        assert_eq!(render("%-6d|", &[42]), "42    |");
        assert_eq!(render("%+d", &[42]), "+42");
    }

    #[test]
    fn test_render_floats() {
        assert_eq!(render("%f", &[f32::to_bits(1.5) as u64]), "1.500000");
        assert_eq!(render("%.2lf", &[f64::to_bits(2.25)]), "2.25");
    }

    #[test]
    fn test_gen_printf_stores_and_marks_valid() {
        let mut buf = PrintfBuf::default();
        let regs32 = [7u32];
        let regs64 = [0xabcdu64];
        let mut sink = ImmediateSink::new(&mut buf, &regs32, &regs64);
        let mut stage = PrintfStage::new();

        gen_printf(
            &mut stage,
            &mut sink,
            "wcd",
            "a=%d b=%c c=0x%lx",
            &[
                StagedArg::Rt32(IrValue(0)),
                StagedArg::ConstInt(b'Q' as u64),
                StagedArg::Rt64(IrValue(0)),
            ],
        );
        assert_eq!(stage.used(), 1);
        assert_eq!(buf.valid_entries, 1);
        assert_eq!(buf.fmts[0], Some("a=%d b=%c c=0x%lx"));
        assert_eq!(buf.args[0][0], 7);
        assert_eq!(buf.args[0][1], b'Q' as u64);
        assert_eq!(buf.args[0][2], 0xabcd);
    }

    #[test]
    fn test_gen_printf_sign_extends_runtime32() {
        let mut buf = PrintfBuf::default();
        let regs32 = [(-3i32) as u32];
        let regs64: [u64; 0] = [];
        let mut sink = ImmediateSink::new(&mut buf, &regs32, &regs64);
        let mut stage = PrintfStage::new();

        // %ld promotes the 32-bit value to a signed 8-byte slot; %lx
        // promotes with zero extension.
        gen_printf(&mut stage, &mut sink, "w", "%ld", &[StagedArg::Rt32(IrValue(0))]);
        gen_printf(&mut stage, &mut sink, "w", "%lx", &[StagedArg::Rt32(IrValue(0))]);
        assert_eq!(buf.args[0][0] as i64, -3);
        assert_eq!(buf.args[1][0], (-3i32) as u32 as u64);
    }

    #[test]
    fn test_gen_printf_const_float_roundtrip() {
        let mut buf = PrintfBuf::default();
        let mut sink = ImmediateSink::new(&mut buf, &[], &[]);
        let mut stage = PrintfStage::new();

        // A 4-byte slot stores the f32 bit pattern and renders back as the
        // decimal value; an 8-byte slot keeps full f64 precision.
        gen_printf(
            &mut stage,
            &mut sink,
            "c",
            "x=%f",
            &[StagedArg::ConstFloat(1.5)],
        );
        gen_printf(
            &mut stage,
            &mut sink,
            "c",
            "y=%.2lf",
            &[StagedArg::ConstFloat(2.25)],
        );

        assert_eq!(buf.args[0][0], f32::to_bits(1.5) as u64);
        assert_eq!(buf.args[1][0], f64::to_bits(2.25));

        let mut out = String::new();
        render_formatted(&mut out, buf.fmts[0].unwrap(), &buf.args[0]);
        assert_eq!(out, "x=1.500000");

        let mut out = String::new();
        render_formatted(&mut out, buf.fmts[1].unwrap(), &buf.args[1]);
        assert_eq!(out, "y=2.25");
    }

    #[test]
    #[should_panic(expected = "exhaust together")]
    fn test_gen_printf_rejects_spec_desync() {
        let mut buf = PrintfBuf::default();
        let mut sink = ImmediateSink::new(&mut buf, &[], &[]);
        let mut stage = PrintfStage::new();
        gen_printf(&mut stage, &mut sink, "c", "no conversions", &[StagedArg::ConstInt(1)]);
    }

    #[test]
    fn test_flush_barrier_behavior() {
        let mut buf = PrintfBuf::default();
        let mut sink = ImmediateSink::new(&mut buf, &[], &[]);
        let mut stage = PrintfStage::new();

        // Empty stage: nothing to flush unless forced.
        gen_printf_flush(&mut stage, &mut sink, true, false);
        assert!(!sink.render_requested);
        gen_printf_flush(&mut stage, &mut sink, false, true);
        assert!(sink.render_requested);

        sink.render_requested = false;
        gen_printf(&mut stage, &mut sink, "c", "%d", &[StagedArg::ConstInt(1)]);
        // Below the barrier and not early: keep staging.
        gen_printf_flush(&mut stage, &mut sink, false, false);
        assert!(!sink.render_requested);
        assert_eq!(stage.used(), 1);
        // Early flush drains a non-empty stage.
        gen_printf_flush(&mut stage, &mut sink, true, false);
        assert!(sink.render_requested);
        assert_eq!(stage.used(), 0);
    }
}
