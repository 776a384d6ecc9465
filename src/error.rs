//! Error taxonomy for the core, grouped the way spec.md's "Error Handling Design"
//! groups them: guest faults are expected and recoverable, resource exhaustion is
//! recoverable but caller-visible, and invariant violations are fatal.

use thiserror::Error;

/// The canonical x86 page-fault error code bit layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageFaultCode {
    pub present: bool,
    pub write: bool,
    pub user: bool,
    pub reserved_write: bool,
    pub instruction_fetch: bool,
}

impl PageFaultCode {
    pub fn as_u32(&self) -> u32 {
        (self.present as u32)
            | ((self.write as u32) << 1)
            | ((self.user as u32) << 2)
            | ((self.reserved_write as u32) << 3)
            | ((self.instruction_fetch as u32) << 4)
    }
}

/// A guest-visible fault: expected, recoverable, vectored through the IDT by the
/// interpreter/recompiler's shared exception-delivery path.
#[derive(Clone, Copy, Debug, Error)]
pub enum GuestFault {
    #[error("page fault at linear address {linear:#010x} (code {code:#x})")]
    Page { linear: u32, code: PageFaultCode },
    #[error("general protection fault, error code {code:#x}")]
    GeneralProtection { code: u32 },
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("divide error")]
    DivideError,
    #[error("alignment check, error code {code:#x}")]
    AlignmentCheck { code: u32 },
}

impl GuestFault {
    /// The IDT vector this fault delivers through.
    pub fn vector(&self) -> u8 {
        match self {
            GuestFault::DivideError => 0x00,
            GuestFault::InvalidOpcode => 0x06,
            GuestFault::GeneralProtection { .. } => 0x0d,
            GuestFault::Page { .. } => 0x0e,
            GuestFault::AlignmentCheck { .. } => 0x11,
        }
    }
}

/// Host-side resource exhaustion: recoverable, reported to the registering caller.
#[derive(Clone, Copy, Debug, Error)]
pub enum ResourceExhausted {
    #[error("timer table is full ({max} entries already registered)")]
    TimerTableFull { max: usize },
    #[error("I/O handler priority stack is full for port range {base:#06x}+{count}")]
    IoHandlerStackFull { base: u16, count: u16 },
    #[error("memory mapping table is full")]
    MemoryMappingTableFull,
    #[error("block arena is exhausted and no block was eligible for LRU eviction")]
    BlockArenaExhausted,
}

/// Invariant violations: should never occur. The top-level controller treats these
/// as fatal. `Invariant` intentionally does not implement any recovery path.
#[derive(Clone, Debug, Error)]
pub enum Invariant {
    #[error("illegal cycle-pair timing entry for opcode class {0:?}")]
    IllegalPairTiming(&'static str),
    #[error("timer cascade references an unknown handle {0}")]
    UnknownTimerHandle(u32),
    #[error("opcode table entry out of range: {0:#04x}")]
    OpcodeTableOutOfRange(u8),
    #[error("block store coverage list is inconsistent for page {0:#010x}")]
    CoverageListInconsistent(u32),
}

/// Top-level error type returned by fallible core entry points.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Fault(#[from] GuestFault),
    #[error(transparent)]
    Exhausted(#[from] ResourceExhausted),
    #[error(transparent)]
    Invariant(#[from] Invariant),
}

/// Logs and then aborts the process for an invariant violation, per spec.md §7
/// category 3. Centralized so every call site is visible in one place.
pub fn fatal(invariant: Invariant) -> ! {
    log::error!("invariant violation: {invariant}");
    panic!("fatal invariant violation: {invariant}");
}
