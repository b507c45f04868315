//! Analysis session: one continuous evaluation of one position.
//!
//! The session turns the raw info stream into an incrementally materialized
//! result set keyed by `(depth, line rank)`, where deeper output for the
//! same key replaces the older record. Engine lines carry no indication of
//! which position they belong to, so the session keeps two keys: the *live*
//! position (stamped at the top of `start`) and the *searched* position
//! (stamped as `go` is issued). Output is accepted only while
//! the two agree and a search is running; everything else is stale residue
//! of a superseded search and is discarded without a trace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AnalysisError;
use crate::events::{EngineEvent, EventBus};
use crate::protocol::UciClient;
use crate::supervisor::SupervisorState;
use crate::uci::{parse_search_info, AnalysisRecord, SearchOptions};

/// Reader wakeup granularity when the engine is silent.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What to analyze and how hard. With neither depth nor movetime the search
/// runs until stopped.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub depth: Option<u32>,
    pub movetime_ms: Option<u64>,
    /// Number of ranked lines to request (MultiPV).
    pub num_lines: u32,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            depth: None,
            movetime_ms: None,
            num_lines: 1,
        }
    }
}

/// Caller-facing snapshot of the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStatus {
    pub running: bool,
    pub position_key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub requested_lines: u32,
}

struct AnalysisState {
    running: bool,
    /// The live position: what the caller most recently asked for.
    position_key: Option<String>,
    /// The searched position: what the engine was last told to `go` on.
    search_key: Option<String>,
    started_at: Option<DateTime<Utc>>,
    requested_lines: u32,
    results: HashMap<(u32, u32), AnalysisRecord>,
}

impl AnalysisState {
    fn new() -> Self {
        Self {
            running: false,
            position_key: None,
            search_key: None,
            started_at: None,
            requested_lines: 1,
            results: HashMap::new(),
        }
    }

    /// The staleness guard. Between a superseding `start` and its `go` the
    /// keys disagree, so output of the superseded search falls through here.
    fn accepts_output(&self) -> bool {
        self.running && self.search_key.is_some() && self.search_key == self.position_key
    }
}

type UpdateCallback = Arc<dyn Fn(&AnalysisRecord) + Send + Sync>;

struct SessionShared {
    state: Mutex<AnalysisState>,
    on_update: Mutex<Option<UpdateCallback>>,
    bus: Arc<EventBus>,
}

/// Drives one engine through repeated position analyses.
pub struct AnalysisSession {
    client: Arc<UciClient>,
    shared: Arc<SessionShared>,
    closed: Arc<AtomicBool>,
}

impl AnalysisSession {
    /// Create the session and start its reader thread. The reader owns a
    /// private cursor into the supervisor's output and runs for the life of
    /// the session, whether or not an analysis is active.
    pub fn new(client: Arc<UciClient>, bus: Arc<EventBus>) -> Self {
        let shared = Arc::new(SessionShared {
            state: Mutex::new(AnalysisState::new()),
            on_update: Mutex::new(None),
            bus,
        });
        let closed = Arc::new(AtomicBool::new(false));

        let reader_supervisor = Arc::clone(client.supervisor());
        let reader_shared = Arc::clone(&shared);
        let reader_closed = Arc::clone(&closed);
        thread::spawn(move || {
            let mut cursor = reader_supervisor.output_end();
            while !reader_closed.load(Ordering::SeqCst) {
                if reader_supervisor.state() == SupervisorState::Terminated {
                    return;
                }
                let (lines, next) = reader_supervisor.wait_output(cursor, POLL_INTERVAL);
                cursor = next;
                for line in &lines {
                    handle_line(&reader_shared, line);
                }
            }
        });

        Self {
            client,
            shared,
            closed,
        }
    }

    /// Begin analyzing `position` (a FEN string), superseding any running
    /// analysis. The live key and result set flip over *before* the first
    /// engine command goes out, so output of the old search can never land
    /// in the new result set.
    pub fn start(&self, position: &str, options: &AnalysisOptions) -> Result<(), AnalysisError> {
        self.stop();

        let requested_lines = options.num_lines.max(1);
        {
            let mut state = lock_state(&self.shared);
            state.results.clear();
            state.position_key = Some(position.to_string());
            state.search_key = None;
            state.running = true;
            state.started_at = Some(Utc::now());
            state.requested_lines = requested_lines;
        }

        match self.drive_start(position, options, requested_lines) {
            Ok(()) => {
                log::info!("analysis started for {}", position);
                self.shared.bus.emit(EngineEvent::AnalysisStarted {
                    position: position.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                lock_state(&self.shared).running = false;
                Err(err)
            }
        }
    }

    fn drive_start(
        &self,
        position: &str,
        options: &AnalysisOptions,
        requested_lines: u32,
    ) -> Result<(), AnalysisError> {
        // One retry: a freshly restarted engine often answers the second
        // probe even when the first raced its handshake.
        if !self.client.is_ready() && !self.client.is_ready() {
            return Err(AnalysisError::EngineNotReady);
        }

        self.client.set_position(position)?;
        if requested_lines > 1 {
            self.client.set_option("MultiPV", requested_lines)?;
        }
        let search = SearchOptions {
            depth: options.depth,
            movetime_ms: options.movetime_ms,
            ..SearchOptions::default()
        };
        // Stamped before go goes out: the engine's first info line may beat
        // the return of `start_search` and must not be dropped as stale.
        lock_state(&self.shared).search_key = Some(position.to_string());
        self.client.start_search(&search)?;
        Ok(())
    }

    /// Stop the running analysis. No-op when idle. The session flips to idle
    /// deterministically whether or not the engine acknowledges the stop.
    pub fn stop(&self) {
        let position = {
            let state = lock_state(&self.shared);
            if !state.running {
                return;
            }
            state.position_key.clone().unwrap_or_default()
        };

        if let Err(err) = self.client.stop_search() {
            log::warn!("stopping analysis failed: {}", err);
        }

        {
            let mut state = lock_state(&self.shared);
            state.running = false;
            state.search_key = None;
        }
        self.shared
            .bus
            .emit(EngineEvent::AnalysisStopped { position });
    }

    pub fn is_ready(&self) -> bool {
        self.client.supervisor().is_ready()
    }

    pub fn is_analyzing(&self) -> bool {
        lock_state(&self.shared).running
    }

    /// Current records, sorted by depth and then line rank.
    pub fn current_results(&self) -> Vec<AnalysisRecord> {
        let state = lock_state(&self.shared);
        let mut records: Vec<AnalysisRecord> = state.results.values().cloned().collect();
        records.sort_by_key(AnalysisRecord::result_key);
        records
    }

    pub fn status(&self) -> AnalysisStatus {
        let state = lock_state(&self.shared);
        AnalysisStatus {
            running: state.running,
            position_key: state.position_key.clone(),
            started_at: state.started_at,
            requested_lines: state.requested_lines,
        }
    }

    /// Register a callback fired once per accepted record, in addition to
    /// the `AnalysisUpdate` events on the bus.
    pub fn set_on_update(&self, callback: impl Fn(&AnalysisRecord) + Send + Sync + 'static) {
        *lock_callback(&self.shared) = Some(Arc::new(callback));
    }

    /// Stop any running analysis and shut the reader down. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
    }
}

impl Drop for AnalysisSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_state(shared: &SessionShared) -> MutexGuard<'_, AnalysisState> {
    shared
        .state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_callback(shared: &SessionShared) -> MutexGuard<'_, Option<UpdateCallback>> {
    shared
        .on_update
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process one engine line against the session state.
fn handle_line(shared: &SessionShared, line: &str) {
    if line.starts_with("info") {
        let Some(record) = parse_search_info(line) else {
            return;
        };
        let position = {
            let mut state = lock_state(shared);
            if !state.accepts_output() {
                return;
            }
            state.results.insert(record.result_key(), record.clone());
            state.position_key.clone().unwrap_or_default()
        };
        if let Some(callback) = lock_callback(shared).clone() {
            callback(&record);
        }
        shared
            .bus
            .emit(EngineEvent::AnalysisUpdate { position, record });
    } else if line.starts_with("bestmove") {
        let position = {
            let mut state = lock_state(shared);
            if !state.accepts_output() {
                return;
            }
            state.running = false;
            state.position_key.clone().unwrap_or_default()
        };
        log::info!("analysis complete for {}", position);
        shared
            .bus
            .emit(EngineEvent::AnalysisComplete { position });
    }
}
