//! Error taxonomy for the engine stack.
//!
//! Each layer has its own error type. Protocol-level errors (`NotReady`,
//! `Timeout`, `Cancelled`) are local to one request and never affect other
//! outstanding requests. Transport failures are never returned to a command
//! caller directly; they drive the supervisor's restart policy, and every
//! request tied to the torn-down worker completes as `Cancelled`.

use std::time::Duration;

use thiserror::Error;

/// Failures at the raw transport (engine process) layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to spawn engine process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write to engine stdin: {0}")]
    Write(#[source] std::io::Error),

    #[error("engine process has no active stdin")]
    NotRunning,

    #[error("invalid engine command line: {0}")]
    InvalidCommand(String),
}

/// Failures surfaced by the supervisor's send/observe interface.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The worker is not currently alive (crashed, restarting, or dead).
    #[error("engine worker is not alive")]
    NotAlive,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures local to a single protocol request.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A command was issued while the engine was not ready. Caller error,
    /// surfaced immediately, never retried internally.
    #[error("engine is not ready")]
    NotReady,

    /// No matching response arrived within the budget.
    #[error("command {command:?} timed out after {elapsed:?} (budget {budget:?})")]
    Timeout {
        command: String,
        elapsed: Duration,
        budget: Duration,
    },

    /// The request was invalidated by client teardown or worker replacement.
    #[error("request cancelled")]
    Cancelled,
}

/// Failures starting or driving an analysis session.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("engine is not ready for analysis")]
    EngineNotReady,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
