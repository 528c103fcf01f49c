//! Error codes surfaced to the trap layer.

/// Why a VM operation failed. The trap path turns these into the process's
/// fate: an illegal access kills it, exhaustion is reported like any other
/// failed syscall.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Errno {
    /// Access outside any region, write to a read-only region, or VM state
    /// not ready for the request.
    Fault,
    /// Unrecognized fault code from the trap path.
    Inval,
    /// No free frame, or no kernel memory for bookkeeping.
    NoMem,
}
