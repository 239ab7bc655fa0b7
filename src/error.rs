//! Engine-wide error type.
//!
//! Mirrors the teacher's small hand-rolled `MemError`: a flat enum covering
//! every fatal condition named in the design's error-handling section, kept
//! deliberately narrow since most conditions (unknown opcode, channel
//! allocation failure) are meant to abort the engine thread rather than be
//! recovered from.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown {isa} opcode {opcode:#x} at pc={pc:#010x}")]
    UnknownOpcode { isa: &'static str, opcode: u32, pc: u32 },

    #[error("scheduler livelock: instruction advanced zero cycles outside STOP state")]
    SchedulerLivelock,

    #[error("channel allocation failure: {0}")]
    ChannelAllocation(String),

    #[error("backup storage read error while restoring: {0}")]
    BackupRestore(String),

    #[error("snapshot mismatch: {0}")]
    SnapshotMismatch(String),

    #[error("invalid reset configuration: {0}")]
    Configuration(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
