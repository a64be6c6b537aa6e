//! Logging infrastructure
//!
//! This module provides logging via the `log` crate. Every record is
//! formatted as `[ticks] [LEVEL] message` into an in-memory ring that the
//! debug interface drains with [`read_ring`], and copied to an optional
//! text sink (typically a UART) registered with [`set_sink`].
//!
//! Records are written with interrupts masked so ISR and main-loop output
//! never interleave inside a line.

use core::fmt::Write;

use heapless::Deque;
use log::{Level, LevelFilter, Metadata, Record};

use crate::arch::sync::IrqMutex;
use crate::config::LOG_RING_SIZE;

/// Text output for log lines
pub type Sink = &'static mut (dyn Write + Send);

static RING: IrqMutex<Deque<u8, LOG_RING_SIZE>> = IrqMutex::new(Deque::new());
static SINK: IrqMutex<Option<Sink>> = IrqMutex::new(None);
static TICK_SOURCE: IrqMutex<Option<fn() -> u64>> = IrqMutex::new(None);

/// Appends to the ring, dropping the oldest bytes once it is full
struct RingWriter<'a>(&'a mut Deque<u8, LOG_RING_SIZE>);

impl Write for RingWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &byte in s.as_bytes() {
            if self.0.is_full() {
                self.0.pop_front();
            }
            let _ = self.0.push_back(byte);
        }
        Ok(())
    }
}

fn timestamp() -> u64 {
    let source = *TICK_SOURCE.lock();
    source.map(|ticks| ticks()).unwrap_or(0)
}

/// Ring + sink logger
struct FirmwareLogger;

impl log::Log for FirmwareLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let ts = timestamp();

        {
            let mut ring = RING.lock();
            let _ = writeln!(
                RingWriter(&mut ring),
                "[{:>10}] [{}] {}",
                ts,
                level_str,
                record.args()
            );
        }

        if let Some(sink) = SINK.lock().as_mut() {
            let _ = writeln!(sink, "[{:>10}] [{}] {}", ts, level_str, record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: FirmwareLogger = FirmwareLogger;

/// Initialize the logging subsystem
///
/// Installing twice is harmless; the first logger stays.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Copy log lines to `sink` as well as the ring
pub fn set_sink(sink: Sink) {
    *SINK.lock() = Some(sink);
}

/// Timestamp source for log lines, e.g. a free-running timer
pub fn set_tick_source(source: fn() -> u64) {
    *TICK_SOURCE.lock() = Some(source);
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Move buffered log text into `buf`, oldest first; returns the byte count
pub fn read_ring(buf: &mut [u8]) -> usize {
    drain_into(&mut RING.lock(), buf)
}

fn drain_into(ring: &mut Deque<u8, LOG_RING_SIZE>, buf: &mut [u8]) -> usize {
    let mut count = 0;
    for slot in buf.iter_mut() {
        match ring.pop_front() {
            Some(byte) => *slot = byte,
            None => break,
        }
        count += 1;
    }
    count
}
