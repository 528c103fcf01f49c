//! Kernel logging: the `log` facade wired to a byte-oriented console.
//!
//! The VM code logs from awkward places, the page-fault path included. A
//! sink that blocked on its own lock would deadlock the moment a trap fires
//! while a record is mid-write, so this one never waits: a record that finds
//! the console busy is dropped and counted, and the count is reported the
//! next time the console is free.

use core::fmt::Write;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, Log, Metadata, Record};
use spin::Mutex;

/// Console-backed `log` sink, safe to use from trap context.
pub struct ConsoleLog<W> {
    console: Mutex<W>,
    lost: AtomicUsize,
}

impl<W: Write + Send> ConsoleLog<W> {
    pub const fn new(console: W) -> ConsoleLog<W> {
        ConsoleLog {
            console: Mutex::new(console),
            lost: AtomicUsize::new(0),
        }
    }

    /// Records dropped so far because the console was busy.
    pub fn lost_records(&self) -> usize {
        self.lost.load(Ordering::Relaxed)
    }
}

impl<W: Write + Send> Log for ConsoleLog<W> {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        // Never block: this may be running in a trap that interrupted a
        // thread already holding the console.
        let Some(mut console) = self.console.try_lock() else {
            self.lost.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let lost = self.lost.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let _ = writeln!(console, "!! {} log records lost in traps", lost);
        }

        let _ = writeln!(
            console,
            "{}|{}: {}",
            severity(record.level()),
            subsystem(record.target()),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Single-character severity tag; console lines are narrow on this machine.
const fn severity(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    }
}

/// Last segment of the module path. Inside one kernel that is all the tag a
/// reader needs.
fn subsystem(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::string::String;
    use std::sync::Mutex as StdMutex;

    fn record<'a>(target: &'a str, args: core::fmt::Arguments<'a>) -> Record<'a> {
        Record::builder()
            .level(Level::Info)
            .target(target)
            .args(args)
            .build()
    }

    static FORMAT_OUT: StdMutex<String> = StdMutex::new(String::new());

    struct FormatCapture;

    impl Write for FormatCapture {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            FORMAT_OUT.lock().unwrap().push_str(s);
            Ok(())
        }
    }

    #[test]
    fn formats_severity_subsystem_and_message() {
        let sink = ConsoleLog::new(FormatCapture);
        sink.log(&record(
            "kernel_vm::vm::fault",
            format_args!("{} frames", 42),
        ));

        let captured = FORMAT_OUT.lock().unwrap();
        assert_eq!(&*captured, "I|fault: 42 frames\n");
    }

    static TRAP_SINK: ConsoleLog<TrapCapture> = ConsoleLog::new(TrapCapture);
    static TRAP_OUT: StdMutex<String> = StdMutex::new(String::new());

    /// Reenters the logger mid-write, the way a trap handler logging during
    /// another record's output would.
    struct TrapCapture;

    impl Write for TrapCapture {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            if s.contains("outer") {
                TRAP_SINK.log(&record("vm", format_args!("from the trap")));
            }
            TRAP_OUT.lock().unwrap().push_str(s);
            Ok(())
        }
    }

    #[test]
    fn records_from_trap_context_are_counted_not_deadlocked() {
        TRAP_SINK.log(&record("vm", format_args!("outer record")));
        assert_eq!(TRAP_SINK.lost_records(), 1);

        TRAP_SINK.log(&record("vm", format_args!("after the trap")));
        assert_eq!(TRAP_SINK.lost_records(), 0);

        let output = TRAP_OUT.lock().unwrap();
        assert!(output.contains("I|vm: outer record"));
        assert!(output.contains("!! 1 log records lost in traps"));
        assert!(output.contains("I|vm: after the trap"));
    }
}
