//! Primitive identifiers shared across the engine.
//!
//! The source material this engine is modeled on mixes `uint` and `ulong`
//! for log indices across different callbacks; we use a single 64-bit
//! unsigned type everywhere instead (see the open question in the design
//! notes).

/// A Raft term number. Monotonically increasing, never decreases.
pub type Term = u64;

/// A 1-based log index. Index 0 is reserved to mean "no entry".
pub type LogIndex = u64;

/// A cluster member identifier, unique within a cluster. Must be >= 1.
pub type ServerId = i32;

/// Result kinds surfaced to clients and callers, per the error design.
///
/// This is intentionally distinct from [`crate::error::Error`]: `ResultCode`
/// is the small enum callers branch on (it round-trips over the wire in
/// response envelopes), while `Error` carries richer context for the
/// orchestrator's internal propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    NotLeader,
    BadRequest,
    ServerAlreadyExists,
    ServerNotFound,
    ConfigChanging,
    Cancelled,
    Timeout,
    Failed,
}
