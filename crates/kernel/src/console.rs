//! The kernel logger: formats `log` records onto an attached text sink.

use alloc::boxed::Box;
use core::{
    fmt::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use log::LevelFilter;
use spin::{Mutex, Once};

type Sink = Box<dyn Write + Send>;

pub struct Console {
    has_output: AtomicBool,
    sink: Mutex<Option<Sink>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    /// Creates the global console and installs it as the logger.
    pub fn init() -> &'static Self {
        let console = Self::default();
        console.install();
        console
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(Console::new)
    }

    fn new() -> Self {
        Console {
            has_output: AtomicBool::new(false),
            sink: Mutex::new(None),
        }
    }

    pub fn install(&'static self) {
        if log::set_logger(self).is_err() {
            return;
        }
        log::set_max_level(Self::max_level());
    }

    pub const fn max_level() -> LevelFilter {
        if cfg!(debug_assertions) {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        }
    }

    pub fn has_output(&self) -> bool {
        self.has_output.load(Ordering::SeqCst)
    }

    pub fn attach(&self, sink: impl Write + Send + 'static) {
        *self.sink.lock() = Some(Box::new(sink));
        self.has_output.store(true, Ordering::SeqCst);
    }

    /// Writes raw text, bypassing log formatting.
    pub fn write_str(&self, text: &str) {
        if let Some(sink) = &mut *self.sink.lock() {
            let _ = sink.write_str(text);
        }
    }
}

impl log::Log for Console {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= Self::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = &mut *self.sink.lock() {
            let _ = write_log_entry_to(&mut **sink, record);
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(
    writer: &mut (impl core::fmt::Write + ?Sized),
    record: &log::Record,
) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
