//! Simple logger implementation for the scheduler core
//!
//! Implements the `log` facade over a sink supplied by the embedding kernel
//! (serial port, framebuffer console, ...). Until `init` is called the
//! facade discards everything, which is also the mode the test suite runs in.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};
use spin::{Mutex, Once};

/// Where formatted log lines end up. The embedding kernel hands us one of
/// these at boot; it must be interrupt-safe to write to.
pub trait LogSink: Send {
    fn write_str(&mut self, s: &str);
}

struct SinkLogger {
    sink: Mutex<&'static mut dyn LogSink>,
}

static LOGGER: Once<SinkLogger> = Once::new();

impl log::Log for SinkLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
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

        // Format into a fixed buffer; log lines longer than this are cut.
        let mut buf = [0u8; 512];
        let pos = {
            let mut writer = BufferWriter {
                buffer: &mut buf,
                pos: 0,
            };
            let _ = write!(&mut writer, "[{}] {}\n", level_str, record.args());
            writer.pos
        };

        let mut sink = self.sink.lock();
        if let Ok(s) = core::str::from_utf8(&buf[..pos]) {
            sink.write_str(s);
        }
    }

    fn flush(&self) {}
}

/// Fixed-buffer writer so formatting never allocates.
struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    pos: usize,
}

impl fmt::Write for BufferWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let room = self.buffer.len() - self.pos;
        let n = bytes.len().min(room);
        self.buffer[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
        self.pos += n;
        Ok(())
    }
}

/// Install the logger. Safe to call more than once; only the first sink wins.
pub fn init(sink: &'static mut dyn LogSink, level: LevelFilter) {
    let logger = LOGGER.call_once(|| SinkLogger {
        sink: Mutex::new(sink),
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
