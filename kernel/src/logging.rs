//! Installs the `log` crate's global logger on top of
//! [`shared::log::LogSink`], writing to QEMU's debug port (spec.md section 6
//! names a `debugger_trap`-style early console as an external collaborator;
//! this is the minimal stand-in that makes `log::info!` etc. work at all
//! before a real console driver exists). Mirrors the teacher's old
//! `kernel/src/logging.rs`, with `spin::Once` in place of `lazy_static` to
//! match the singleton idiom [`crate::memory::MemoryContext`] already uses.

use log::LevelFilter;
use shared::log::{LogSink, QemuDebugWriter};

static LOGGER: spin::Once<LogSink<QemuDebugWriter>> = spin::Once::new();

/// Installs the global logger. Idempotent: safe to call more than once (only
/// the first call takes effect), but must be called before any other
/// `log::*!` use if those messages are to go anywhere.
pub fn init() {
    let logger = LOGGER.call_once(|| LogSink::new(unsafe { QemuDebugWriter::new() }));
    // `set_logger` only errors if called twice with different loggers;
    // `LOGGER`'s `Once` already makes repeat calls return the same instance.
    let _ = log::set_logger(logger);
    log::set_max_level(LevelFilter::Trace);
}
