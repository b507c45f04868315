//! # kibitz-core
//!
//! UCI engine supervision and analysis streaming for the kibitz opening
//! explorer.
//!
//! This crate is frontend-agnostic: the same stack serves a desktop app,
//! a WebSocket bridge, or the bundled `analyze` CLI.
//!
//! ## Key Concepts
//!
//! - **EngineSupervisor**: keeps one engine process alive and healthy, with
//!   bounded restarts and a cursor-based view of its output
//! - **UciClient**: request/response correlation over the raw line stream
//! - **AnalysisSession**: one continuous evaluation of one position,
//!   incrementally materialized and staleness-filtered
//! - **EngineEvent**: unified event type broadcast to every subscriber

pub mod error;
pub mod events;
pub mod logging;
pub mod output;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod uci;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use error::{AnalysisError, ProtocolError, SupervisorError, TransportError};
pub use events::{EngineEvent, EventBus};
pub use protocol::{CommandTimeouts, Matcher, UciClient};
pub use session::{AnalysisOptions, AnalysisSession, AnalysisStatus};
pub use supervisor::{EngineSupervisor, SupervisorConfig, SupervisorState};
pub use transport::{EngineCommand, Transport, TransportFactory};
pub use uci::{AnalysisRecord, Score, SearchOptions};
