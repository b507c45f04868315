//! Request/response correlation over the supervisor's line stream.
//!
//! UCI gives no way to tag a command with an id, so correlation is done by
//! watching the output stream for a line the caller describes with a
//! [`Matcher`]. Every outstanding request accumulates all lines that arrive
//! while it waits; when a line matches, the request resolves with everything
//! it accumulated, in delivery order. One line can resolve several requests
//! at once — callers that both wait for `readyok` both get their answer.
//!
//! A single dispatch thread owns the read cursor into the supervisor's
//! output log and serializes line delivery and timeout expiry, so there is
//! exactly one writer to the pending map's resolution state at any time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::supervisor::{EngineSupervisor, SupervisorState};
use crate::uci::{position_command, set_option_command, SearchOptions};

/// Dispatch wakeup granularity; bounds timeout expiry latency.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a request recognizes its response line.
pub enum Matcher {
    /// Line contains this substring.
    Contains(String),
    Pattern(Regex),
    Predicate(Box<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Matcher {
    pub fn contains(needle: impl Into<String>) -> Self {
        Matcher::Contains(needle.into())
    }

    fn matches(&self, line: &str) -> bool {
        match self {
            Matcher::Contains(needle) => line.contains(needle.as_str()),
            Matcher::Pattern(regex) => regex.is_match(line),
            Matcher::Predicate(pred) => pred(line),
        }
    }
}

/// Per-command response budgets for the convenience wrappers.
#[derive(Debug, Clone)]
pub struct CommandTimeouts {
    pub is_ready: Duration,
    pub set_position: Duration,
    pub set_option: Duration,
    pub start_search: Duration,
    pub stop: Duration,
    pub default: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            is_ready: Duration::from_secs(5),
            set_position: Duration::from_secs(1),
            set_option: Duration::from_secs(1),
            start_search: Duration::from_secs(1),
            stop: Duration::from_secs(2),
            default: Duration::from_secs(3),
        }
    }
}

struct PendingRequest {
    command: String,
    matcher: Matcher,
    /// Every line seen since this request was registered.
    received: Vec<String>,
    started: Instant,
    budget: Duration,
    deadline: Instant,
    sender: Sender<Result<Vec<String>, ProtocolError>>,
}

/// Caller's side of one outstanding request.
pub struct ResponseHandle {
    receiver: Receiver<Result<Vec<String>, ProtocolError>>,
}

impl ResponseHandle {
    /// Block until the request resolves, times out, or is cancelled.
    pub fn wait(self) -> Result<Vec<String>, ProtocolError> {
        match self.receiver.recv() {
            Ok(outcome) => outcome,
            // Dispatch gone without a verdict: the client was torn down.
            Err(_) => Err(ProtocolError::Cancelled),
        }
    }
}

fn resolved(lines: Vec<String>) -> ResponseHandle {
    let (tx, rx) = mpsc::channel();
    let _ = tx.send(Ok(lines));
    ResponseHandle { receiver: rx }
}

/// Correlates commands with engine responses on top of a supervisor.
pub struct UciClient {
    supervisor: Arc<EngineSupervisor>,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    closed: Arc<AtomicBool>,
    timeouts: CommandTimeouts,
}

impl UciClient {
    pub fn new(supervisor: Arc<EngineSupervisor>) -> Self {
        Self::with_timeouts(supervisor, CommandTimeouts::default())
    }

    pub fn with_timeouts(supervisor: Arc<EngineSupervisor>, timeouts: CommandTimeouts) -> Self {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let dispatch_supervisor = Arc::clone(&supervisor);
        let dispatch_pending = Arc::clone(&pending);
        let dispatch_closed = Arc::clone(&closed);
        thread::spawn(move || run_dispatch(dispatch_supervisor, dispatch_pending, dispatch_closed));

        Self {
            supervisor,
            pending,
            closed,
            timeouts,
        }
    }

    /// Send a command and register interest in its response.
    ///
    /// The request is registered *before* the line goes out, so a response
    /// racing the registration cannot be missed. With no matcher the handle
    /// resolves immediately with empty lines and no timer is ever armed.
    pub fn send_command(
        &self,
        command: &str,
        matcher: Option<Matcher>,
        timeout: Duration,
    ) -> Result<ResponseHandle, ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Cancelled);
        }
        if !self.supervisor.is_ready() {
            return Err(ProtocolError::NotReady);
        }

        let Some(matcher) = matcher else {
            self.supervisor
                .send(command)
                .map_err(|_| ProtocolError::Cancelled)?;
            return Ok(resolved(Vec::new()));
        };

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        lock(&self.pending).insert(
            id.clone(),
            PendingRequest {
                command: command.to_string(),
                matcher,
                received: Vec::new(),
                started,
                budget: timeout,
                deadline: started + timeout,
                sender: tx,
            },
        );

        if self.supervisor.send(command).is_err() {
            lock(&self.pending).remove(&id);
            return Err(ProtocolError::Cancelled);
        }
        Ok(ResponseHandle { receiver: rx })
    }

    /// Outstanding requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    /// The supervisor this client correlates over. Consumers that need their
    /// own output cursor (the analysis session) read through this.
    pub fn supervisor(&self) -> &Arc<EngineSupervisor> {
        &self.supervisor
    }

    /// Probe the engine with `isready`. A failure is logged, not thrown:
    /// callers treat this as a boolean health question.
    pub fn is_ready(&self) -> bool {
        let handle = self.send_command(
            "isready",
            Some(Matcher::contains("readyok")),
            self.timeouts.is_ready,
        );
        match handle.and_then(ResponseHandle::wait) {
            Ok(_) => true,
            Err(err) => {
                log::warn!("readiness probe failed: {}", err);
                false
            }
        }
    }

    /// Load a position. `position` has no response line in UCI.
    pub fn set_position(&self, fen: &str) -> Result<(), ProtocolError> {
        self.send_command(&position_command(fen), None, self.timeouts.set_position)?
            .wait()?;
        Ok(())
    }

    pub fn set_option(
        &self,
        name: &str,
        value: impl std::fmt::Display,
    ) -> Result<(), ProtocolError> {
        self.send_command(
            &set_option_command(name, value),
            None,
            self.timeouts.set_option,
        )?
        .wait()?;
        Ok(())
    }

    /// Kick off a search. Fire-and-forget: progress arrives as `info` lines
    /// which the analysis session consumes from its own cursor.
    pub fn start_search(&self, options: &SearchOptions) -> Result<(), ProtocolError> {
        self.send_command(&options.go_command(), None, self.timeouts.start_search)?
            .wait()?;
        Ok(())
    }

    /// Stop the current search and wait for the terminating `bestmove`.
    ///
    /// An engine that is not searching never answers `stop`, so a timeout
    /// here is expected in some races and is swallowed with a warning.
    pub fn stop_search(&self) -> Result<(), ProtocolError> {
        let handle = self.send_command(
            "stop",
            Some(Matcher::contains("bestmove")),
            self.timeouts.stop,
        )?;
        match handle.wait() {
            Ok(_) => Ok(()),
            Err(err @ ProtocolError::Timeout { .. }) => {
                log::warn!("stop not acknowledged: {}", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Fail every outstanding request with `Cancelled` and stop dispatching.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        cancel_all(&self.pending);
    }
}

impl Drop for UciClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(pending: &Mutex<HashMap<String, PendingRequest>>) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn cancel_all(pending: &Mutex<HashMap<String, PendingRequest>>) {
    for (_, request) in lock(pending).drain() {
        let _ = request.sender.send(Err(ProtocolError::Cancelled));
    }
}

/// Dispatch loop: the single writer for request resolution.
fn run_dispatch(
    supervisor: Arc<EngineSupervisor>,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    closed: Arc<AtomicBool>,
) {
    let mut cursor = supervisor.output_end();
    while !closed.load(Ordering::SeqCst) {
        if supervisor.state() == SupervisorState::Terminated {
            cancel_all(&pending);
            return;
        }

        let (lines, next) = supervisor.wait_output(cursor, POLL_INTERVAL);
        cursor = next;

        let now = Instant::now();
        let mut map = lock(&pending);

        for line in &lines {
            let mut matched = Vec::new();
            for (id, request) in map.iter_mut() {
                request.received.push(line.clone());
                if request.matcher.matches(line) {
                    matched.push(id.clone());
                }
            }
            for id in matched {
                if let Some(request) = map.remove(&id) {
                    let _ = request.sender.send(Ok(request.received));
                }
            }
        }

        let expired: Vec<String> = map
            .iter()
            .filter(|(_, request)| now >= request.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(request) = map.remove(&id) {
                log::warn!("command {:?} timed out", request.command);
                let _ = request.sender.send(Err(ProtocolError::Timeout {
                    command: request.command,
                    elapsed: now.duration_since(request.started),
                    budget: request.budget,
                }));
            }
        }

        // Readiness drops the moment a worker fails and stays down until a
        // replacement finishes its handshake, so a pending request that
        // outlived its worker is cancelled here rather than left to time out.
        if !map.is_empty() && !supervisor.is_ready() {
            for (_, request) in map.drain() {
                let _ = request.sender.send(Err(ProtocolError::Cancelled));
            }
        }
    }
}
