//! Kernel logging sinks.
//!
//! Two phases, zero loss: [`init_early_serial`] registers lock-free
//! writers that hit COM1 directly (usable before the heap exists);
//! [`init_logger`] replaces them with the sink fan-out logger once
//! allocation works. The `/dev/kmsg` ring sink is added when the VFS
//! comes up and [`config::LOG_USE_VNODE`] is set.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use salern_core::log::LogLevel;
use salern_core::sync::SpinLock;

use crate::arch::x86_64::port::{inb, outb};
use crate::config;

// ---------------------------------------------------------------------------
// 16550 UART (COM1)
// ---------------------------------------------------------------------------

const COM1: u16 = 0x3f8;

/// Programs COM1: 115200 8N1, FIFOs on.
///
/// # Safety
///
/// Touches the UART ports; run once during early boot.
pub unsafe fn serial_init() {
    // SAFETY: Standard 16550 initialization sequence.
    unsafe {
        outb(COM1 + 1, 0x00); // interrupts off
        outb(COM1 + 3, 0x80); // DLAB
        outb(COM1 + 0, 0x01); // divisor 1 = 115200
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x03); // 8N1
        outb(COM1 + 2, 0xc7); // FIFO on, clear, 14-byte threshold
        outb(COM1 + 4, 0x0b); // DTR | RTS | OUT2
    }
}

fn serial_putb(byte: u8) {
    // SAFETY: Polling the line-status register then writing the data
    // port is the architected transmit sequence.
    unsafe {
        while inb(COM1 + 5) & 0x20 == 0 {
            crate::arch::cpu_relax();
        }
        outb(COM1, byte);
    }
}

/// Writes raw bytes to the serial port (console fallback, panic path).
pub fn serial_write(bytes: &[u8]) {
    for &byte in bytes {
        if byte == b'\n' {
            serial_putb(b'\r');
        }
        serial_putb(byte);
    }
}

struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        serial_write(s.as_bytes());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Early phase
// ---------------------------------------------------------------------------

fn early_print(args: fmt::Arguments<'_>) {
    let _ = SerialWriter.write_fmt(args);
}

fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level > config::LOG_LEVEL {
        return;
    }
    let ns = crate::time::now_ns();
    let secs = ns / 1_000_000_000;
    let micros = (ns / 1_000) % 1_000_000;
    let _ = write!(SerialWriter, "[{secs:>5}.{micros:06}] {} {args}\n", level.tag());
}

/// Registers the lock-free serial writers. Safe from the first
/// instruction after [`serial_init`].
pub fn init_early_serial() {
    // SAFETY: Both functions only poll and write UART ports.
    unsafe {
        salern_core::log::set_print_fn(early_print);
        salern_core::log::set_log_fn(early_log);
    }
}

// ---------------------------------------------------------------------------
// Sink fan-out logger
// ---------------------------------------------------------------------------

/// An output sink for the kernel logger.
pub trait LogSink: Send + Sync {
    /// Writes a fragment.
    fn write_str(&self, s: &str);
    /// Most verbose category this sink accepts.
    fn max_level(&self) -> LogLevel;
    /// Name for diagnostics.
    fn name(&self) -> &'static str;
}

struct SerialSink;

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        serial_write(s.as_bytes());
    }

    fn max_level(&self) -> LogLevel {
        config::LOG_LEVEL
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

/// Ring of recent log bytes, exported as `/dev/kmsg`.
struct KmsgSink;

static KMSG: SpinLock<salern_core::collections::RingBuf<16384>> =
    SpinLock::new(salern_core::collections::RingBuf::new());

impl LogSink for KmsgSink {
    fn write_str(&self, s: &str) {
        let mut ring = KMSG.lock();
        for &byte in s.as_bytes() {
            if ring.is_full() {
                ring.pop();
            }
            ring.push(byte);
        }
    }

    fn max_level(&self) -> LogLevel {
        config::LOG_LEVEL
    }

    fn name(&self) -> &'static str {
        "kmsg"
    }
}

/// The `/dev/kmsg` device: drains the ring.
pub struct KmsgDev;

impl crate::fs::devfs::DevOps for KmsgDev {
    fn read(&self, buf: &mut [u8], _off: u64) -> Result<usize, salern_abi::Errno> {
        Ok(KMSG.lock().read(buf))
    }
}

struct LoggerInner {
    sinks: Vec<Box<dyn LogSink>>,
}

static LOGGER: SpinLock<Option<LoggerInner>> = SpinLock::new(None);

fn logger_print(args: fmt::Arguments<'_>) {
    let guard = LOGGER.lock();
    if let Some(inner) = guard.as_ref() {
        for sink in &inner.sinks {
            let mut w = SinkWriter(sink.as_ref());
            let _ = w.write_fmt(args);
        }
    }
}

fn logger_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let ns = crate::time::now_ns();
    let secs = ns / 1_000_000_000;
    let micros = (ns / 1_000) % 1_000_000;
    let guard = LOGGER.lock();
    if let Some(inner) = guard.as_ref() {
        for sink in &inner.sinks {
            if level <= sink.max_level() {
                let mut w = SinkWriter(sink.as_ref());
                let _ = write!(w, "[{secs:>5}.{micros:06}] {} {args}\n", level.tag());
            }
        }
    }
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Switches to the full logger (post-heap). Serial keeps flowing; the
/// kmsg ring starts filling.
pub fn init_logger() {
    {
        let mut logger = LOGGER.lock();
        let mut sinks: Vec<Box<dyn LogSink>> = Vec::with_capacity(2);
        sinks.push(Box::new(SerialSink));
        if config::LOG_USE_VNODE {
            sinks.push(Box::new(KmsgSink));
        }
        *logger = Some(LoggerInner { sinks });
    }
    // SAFETY: The logger functions take only the logger spinlock.
    unsafe {
        salern_core::log::set_print_fn(logger_print);
        salern_core::log::set_log_fn(logger_log);
    }
}

/// Registers an additional sink (e.g. the screen renderer glue).
pub fn add_sink(sink: Box<dyn LogSink>) {
    if let Some(inner) = LOGGER.lock().as_mut() {
        inner.sinks.push(sink);
    }
}

/// Writes a panic message directly to COM1, bypassing every lock.
pub fn panic_serial(args: fmt::Arguments<'_>) {
    let _ = SerialWriter.write_fmt(args);
}
