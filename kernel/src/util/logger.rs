// =============================================================================
// OpalOS — Kernel Logger (log facade → machine console)
// =============================================================================
//
// Provides formatted text output for the kernel through the standard `log`
// facade, so every module writes `log::info!(...)` and the backend decides
// where the bytes go. Output goes to the machine console (a serial port on
// real hardware).
//
// WHY THE `log` CRATE AND NOT OUR OWN MACROS?
//   The facade costs nothing when no logger is installed (records are
//   dropped), needs no heap, and keeps call sites identical between the
//   kernel and host-side tooling. The only constraint is that
//   `log::set_logger` wants a `'static` backend — we park the backend in a
//   `spin::Once` to get one without an allocator.
//
// USAGE:
//   util::logger::init(machine);            // once, at early boot
//   log::info!("[vm] {} frames", total);    // anywhere afterwards
//
// THREAD SAFETY:
//   A record is formatted straight into `Machine::console_write`, which is
//   the machine's serialized console sink. Messages from different threads
//   may interleave at line granularity, never mid-character.
//
// =============================================================================

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

use crate::machine::Machine;

/// Streams formatted text into the machine console.
struct ConsoleWriter<'a> {
    machine: &'a dyn Machine,
}

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.machine.console_write(s);
        Ok(())
    }
}

/// The `log` backend: one console line per record, level-tagged.
pub struct MachineLogger {
    machine: &'static dyn Machine,
}

impl Log for MachineLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut console = ConsoleWriter {
            machine: self.machine,
        };
        let _ = writeln!(console, "[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// The one logger instance; `log::set_logger` needs it to live forever.
static LOGGER: Once<MachineLogger> = Once::new();

/// Installs the machine console as the global `log` backend.
///
/// Called once during early boot, before the VM bootstrap so the layout
/// report lands on the console. A second call (or a logger installed by
/// someone else) is ignored.
pub fn init(machine: &'static dyn Machine) {
    let logger = LOGGER.call_once(|| MachineLogger { machine });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
