//! Engine process supervision.
//!
//! Keeps exactly one engine worker alive and observably healthy, or declares
//! it permanently dead. The supervisor owns the transport's lifecycle:
//! start, readiness detection, health probing, bounded restarts with
//! backoff, and teardown. It exposes a fire-and-forget `send` plus a
//! cursor-based view of everything the engine has printed; request/response
//! correlation lives one layer up in [`crate::protocol`].
//!
//! State machine: `Starting -> Ready -> {Degraded, Dead}`, with
//! `Degraded -> Starting` on restart, `Degraded -> Dead` once the restart
//! budget is exhausted, and `Terminated` reachable from anywhere via
//! explicit shutdown.
//!
//! Concurrency: one pump thread per worker instance (invalidated by an epoch
//! counter when the worker is replaced), one health thread per supervisor,
//! and one short-lived backoff thread per restart. All shared state sits
//! behind a single mutex; a condvar wakes output readers and the health
//! thread.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::events::{EngineEvent, EventBus};
use crate::logging::{log_line, open_transcript, LogHandle};
use crate::output::OutputLog;
use crate::transport::{TransportEvent, TransportFactory};

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorState {
    /// Worker spawned, readiness handshake not yet answered.
    Starting,
    /// Worker answered the readiness handshake and is accepting commands.
    Ready,
    /// A failure was observed; a restart is pending.
    Degraded,
    /// Restart budget exhausted. Only a manual restart leaves this state.
    Dead,
    /// Explicitly shut down. Terminal.
    Terminated,
}

/// Supervisor tuning. Defaults are UCI-shaped and mirror the values the
/// opening explorer ships with, but every protocol string is configuration:
/// the supervisor itself never assumes UCI.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Sent once to every fresh worker instance.
    pub init_command: Option<String>,
    /// A line containing this marks the worker ready (once per instance).
    pub readiness_pattern: String,
    /// Passive liveness probe sent by the health check.
    pub liveness_probe: String,
    /// A line containing this answers the probe.
    pub liveness_response: String,
    /// Lines with this prefix mean a long-running operation is in progress.
    pub busy_enter_prefix: String,
    /// Lines with this prefix mean the long-running operation finished.
    pub busy_exit_prefix: String,
    /// Commands with this prefix start a long-running operation and do not
    /// count as activity for health bookkeeping.
    pub long_op_command_prefix: Option<String>,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub health_check_interval: Duration,
    /// Probe response deadline while idle.
    pub health_check_timeout: Duration,
    /// Probe response deadline while a long-running operation is active.
    pub busy_health_check_timeout: Duration,
    /// Idle silence that triggers a probe.
    pub idle_silence_threshold: Duration,
    /// Mid-operation silence that triggers a probe anyway.
    pub busy_silence_threshold: Duration,
    /// Sustained readiness that refunds the restart budget.
    pub readiness_grace: Duration,
    pub output_buffer_capacity: usize,
    /// Directory for engine I/O transcripts; `None` disables them.
    pub log_dir: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            init_command: Some("uci".to_string()),
            readiness_pattern: "uciok".to_string(),
            liveness_probe: "isready".to_string(),
            liveness_response: "readyok".to_string(),
            busy_enter_prefix: "info".to_string(),
            busy_exit_prefix: "bestmove".to_string(),
            long_op_command_prefix: Some("go".to_string()),
            max_restarts: 3,
            restart_backoff: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(15),
            health_check_timeout: Duration::from_secs(10),
            busy_health_check_timeout: Duration::from_secs(20),
            idle_silence_threshold: Duration::from_secs(300),
            busy_silence_threshold: Duration::from_secs(600),
            readiness_grace: Duration::from_secs(30),
            output_buffer_capacity: 500,
            log_dir: None,
        }
    }
}

struct SupervisorInner {
    state: SupervisorState,
    alive: bool,
    ready: bool,
    busy: bool,
    restart_count: u32,
    /// A failure has already been counted and a replacement is on its way.
    /// Further reports of the same fault (a probe deadline racing the exit
    /// watcher, a send error racing either) must not spend more budget.
    restart_pending: bool,
    last_activity: Instant,
    ready_since: Option<Instant>,
    probe_deadline: Option<Instant>,
    /// Worker instance generation. Bumped on every replacement so a
    /// superseded worker's pump thread can never touch fresh state.
    epoch: u64,
    transport: Option<Box<dyn crate::transport::Transport>>,
    output: OutputLog,
}

struct Shared {
    inner: Mutex<SupervisorInner>,
    cond: Condvar,
    config: SupervisorConfig,
    factory: Box<dyn TransportFactory>,
    bus: Arc<EventBus>,
    transcript: LogHandle,
}

/// Supervises one engine worker. See the module docs for the state machine.
pub struct EngineSupervisor {
    shared: Arc<Shared>,
}

impl EngineSupervisor {
    /// Spawn the first worker and start the health loop.
    ///
    /// A spawn failure is not an error return: it routes through the normal
    /// failure path so the retry budget applies to it like any other fault.
    pub fn start(
        factory: Box<dyn TransportFactory>,
        config: SupervisorConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        let engine_id = Uuid::new_v4().to_string();
        let transcript = open_transcript(config.log_dir.as_deref(), &engine_id);
        let capacity = config.output_buffer_capacity;
        let shared = Arc::new(Shared {
            inner: Mutex::new(SupervisorInner {
                state: SupervisorState::Starting,
                alive: false,
                ready: false,
                busy: false,
                restart_count: 0,
                restart_pending: false,
                last_activity: Instant::now(),
                ready_since: None,
                probe_deadline: None,
                epoch: 0,
                transport: None,
                output: OutputLog::new(capacity),
            }),
            cond: Condvar::new(),
            config,
            factory,
            bus,
            transcript,
        });

        spawn_worker(&shared);

        let health_shared = Arc::clone(&shared);
        thread::spawn(move || run_health_loop(health_shared));

        Self { shared }
    }

    /// Forward one line to the worker. Fire-and-forget at this layer.
    pub fn send(&self, line: &str) -> Result<(), SupervisorError> {
        let mut inner = lock(&self.shared);
        if !inner.alive {
            return Err(SupervisorError::NotAlive);
        }
        let Some(transport) = inner.transport.as_ref() else {
            return Err(SupervisorError::NotAlive);
        };
        log_line(&self.shared.transcript, "SEND", line);
        log::debug!("engine< {}", line);
        match transport.send(line) {
            Ok(()) => {
                // Commands that start a long search do not count as activity;
                // the engine may legitimately go quiet while it thinks.
                let long_op = self
                    .shared
                    .config
                    .long_op_command_prefix
                    .as_deref()
                    .is_some_and(|prefix| line.starts_with(prefix));
                if !long_op {
                    inner.last_activity = Instant::now();
                }
                Ok(())
            }
            Err(err) => {
                drop(inner);
                handle_failure(&self.shared, "command send failed");
                Err(err.into())
            }
        }
    }

    /// Absolute index one past the newest output line.
    pub fn output_end(&self) -> u64 {
        lock(&self.shared).output.end_index()
    }

    /// Read all retained output at or after `cursor` (lagging cursors are
    /// clamped to the oldest retained line). Non-blocking.
    pub fn read_output(&self, cursor: u64) -> (Vec<String>, u64) {
        lock(&self.shared).output.read_from(cursor)
    }

    /// Like [`read_output`](Self::read_output), but blocks up to `timeout`
    /// for at least one new line. Returns early on termination.
    pub fn wait_output(&self, cursor: u64, timeout: Duration) -> (Vec<String>, u64) {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.shared);
        loop {
            let (lines, next) = inner.output.read_from(cursor);
            if !lines.is_empty() || inner.state == SupervisorState::Terminated {
                return (lines, next);
            }
            let now = Instant::now();
            if now >= deadline {
                return (lines, next);
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner = guard;
        }
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.shared).alive
    }

    /// Ready means alive *and* past the readiness handshake.
    pub fn is_ready(&self) -> bool {
        let inner = lock(&self.shared);
        inner.alive && inner.ready
    }

    pub fn state(&self) -> SupervisorState {
        lock(&self.shared).state
    }

    pub fn restart_count(&self) -> u32 {
        lock(&self.shared).restart_count
    }

    /// User-initiated restart. Refunds the budget first, so it also recovers
    /// a `Dead` supervisor.
    pub fn restart(&self) {
        {
            let mut inner = lock(&self.shared);
            if inner.state == SupervisorState::Terminated {
                return;
            }
            inner.restart_count = 0;
            // A user-initiated restart overrides one already in flight.
            inner.restart_pending = false;
            if inner.state == SupervisorState::Dead {
                inner.state = SupervisorState::Degraded;
            }
        }
        handle_failure(&self.shared, "manual restart");
    }

    /// Idempotent shutdown: cancels timers, tears down the transport, flips
    /// `alive = false, ready = false`. Safe to call while operations are in
    /// flight.
    pub fn terminate(&self) {
        let transport = {
            let mut inner = lock(&self.shared);
            if inner.state == SupervisorState::Terminated {
                return;
            }
            inner.state = SupervisorState::Terminated;
            inner.alive = false;
            inner.ready = false;
            inner.busy = false;
            inner.probe_deadline = None;
            inner.epoch += 1;
            inner.transport.take()
        };
        self.shared.cond.notify_all();
        if let Some(transport) = transport {
            // Best-effort polite quit; EOF on stdin finishes the job.
            let _ = transport.send("quit");
            transport.terminate();
        }
        log::info!("engine supervisor terminated");
    }
}

impl Drop for EngineSupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, SupervisorInner> {
    shared
        .inner
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connect a fresh worker and start its pump thread.
fn spawn_worker(shared: &Arc<Shared>) {
    let connected = shared.factory.connect();
    let (events, epoch) = {
        let mut inner = lock(shared);
        if inner.state == SupervisorState::Terminated {
            if let Ok((transport, _)) = connected {
                transport.terminate();
            }
            return;
        }
        // Whatever happens next is a fresh fault, not the one that got us
        // here; a spawn failure below re-arms the flag via the failure path.
        inner.restart_pending = false;
        match connected {
            Ok((transport, events)) => {
                inner.epoch += 1;
                inner.transport = Some(transport);
                inner.alive = true;
                inner.ready = false;
                inner.busy = false;
                inner.probe_deadline = None;
                inner.ready_since = None;
                inner.last_activity = Instant::now();
                inner.state = SupervisorState::Starting;
                // The replacement starts with a clean window; absolute
                // indices keep advancing, so readers' cursors survive.
                inner.output.clear();

                if let Some(ref init) = shared.config.init_command {
                    log_line(&shared.transcript, "SEND", init);
                    if let Some(ref transport) = inner.transport {
                        if let Err(err) = transport.send(init) {
                            log::warn!("init command failed: {}", err);
                            drop(inner);
                            handle_failure(shared, "init command failed");
                            return;
                        }
                    }
                }
                (events, inner.epoch)
            }
            Err(err) => {
                log::error!("failed to spawn engine worker: {}", err);
                drop(inner);
                handle_failure(shared, "worker spawn failed");
                return;
            }
        }
    };
    shared.cond.notify_all();

    let pump_shared = Arc::clone(shared);
    thread::spawn(move || run_pump(pump_shared, events, epoch));
}

/// Consume one worker instance's transport events until it is superseded.
fn run_pump(shared: Arc<Shared>, events: Receiver<TransportEvent>, epoch: u64) {
    for event in events {
        match event {
            TransportEvent::Line(line) => {
                let became_ready = {
                    let mut inner = lock(&shared);
                    if inner.epoch != epoch || inner.state == SupervisorState::Terminated {
                        return;
                    }
                    log_line(&shared.transcript, "RECV", &line);
                    log::debug!("engine> {}", line);

                    inner.last_activity = Instant::now();
                    // Any activity at all cancels a pending probe deadline.
                    inner.probe_deadline = None;

                    let mut became_ready = false;
                    if !inner.ready && line.contains(&shared.config.readiness_pattern) {
                        inner.ready = true;
                        inner.ready_since = Some(Instant::now());
                        inner.state = SupervisorState::Ready;
                        became_ready = true;
                    }
                    if line.contains(&shared.config.liveness_response) {
                        inner.alive = true;
                    }
                    if line.starts_with(&shared.config.busy_enter_prefix) {
                        inner.busy = true;
                    } else if line.starts_with(&shared.config.busy_exit_prefix) {
                        inner.busy = false;
                    }

                    inner.output.push(line);
                    became_ready
                };
                shared.cond.notify_all();
                if became_ready {
                    log::info!("engine worker ready");
                    shared.bus.emit(EngineEvent::EngineReady);
                }
            }
            TransportEvent::Closed(exit) => {
                {
                    let inner = lock(&shared);
                    if inner.epoch != epoch || inner.state == SupervisorState::Terminated {
                        return;
                    }
                }
                handle_failure(&shared, &format!("engine exited with code {}", exit.code));
                return;
            }
        }
    }
    // Channel closed without a Closed event: the transport was torn down
    // deliberately (restart or terminate); nothing left to report.
}

/// Failure path shared by transport errors, exit events and probe timeouts.
fn handle_failure(shared: &Arc<Shared>, reason: &str) {
    let (transport, outcome) = {
        let mut inner = lock(shared);
        if matches!(
            inner.state,
            SupervisorState::Terminated | SupervisorState::Dead
        ) {
            return;
        }
        // One fault, one budget unit: duplicate reports of the failure that
        // is already being handled are dropped until the replacement worker
        // comes up.
        if inner.restart_pending {
            return;
        }
        inner.restart_pending = true;
        log::warn!("engine worker failure: {}", reason);
        inner.alive = false;
        inner.ready = false;
        inner.busy = false;
        inner.probe_deadline = None;
        inner.ready_since = None;
        inner.epoch += 1;
        let transport = inner.transport.take();

        if inner.restart_count < shared.config.max_restarts {
            inner.restart_count += 1;
            inner.state = SupervisorState::Degraded;
            (transport, Some(inner.restart_count))
        } else {
            inner.state = SupervisorState::Dead;
            (transport, None)
        }
    };
    shared.cond.notify_all();
    if let Some(transport) = transport {
        transport.terminate();
    }

    match outcome {
        Some(attempt) => {
            log::info!(
                "restarting engine worker (attempt {}/{})",
                attempt,
                shared.config.max_restarts
            );
            shared
                .bus
                .emit(EngineEvent::EngineDegraded { restarts: attempt });
            let backoff = shared.config.restart_backoff;
            let restart_shared = Arc::clone(shared);
            thread::spawn(move || {
                thread::sleep(backoff);
                {
                    let inner = lock(&restart_shared);
                    if matches!(
                        inner.state,
                        SupervisorState::Terminated | SupervisorState::Dead
                    ) {
                        return;
                    }
                }
                spawn_worker(&restart_shared);
            });
        }
        None => {
            let restarts = lock(shared).restart_count;
            log::error!("engine restart budget exhausted; worker is dead");
            shared.bus.emit(EngineEvent::EngineDead { restarts });
        }
    }
}

/// Immutable snapshot of the fields the health policy looks at.
struct HealthView {
    alive: bool,
    ready: bool,
    busy: bool,
    restart_count: u32,
    last_activity: Instant,
    ready_since: Option<Instant>,
    probe_deadline: Option<Instant>,
}

impl SupervisorInner {
    fn health_view(&self) -> HealthView {
        HealthView {
            alive: self.alive,
            ready: self.ready,
            busy: self.busy,
            restart_count: self.restart_count,
            last_activity: self.last_activity,
            ready_since: self.ready_since,
            probe_deadline: self.probe_deadline,
        }
    }
}

enum HealthAction {
    /// Send the liveness probe and arm a response deadline.
    Probe { deadline: Instant },
    /// The armed deadline expired: drive the failure path.
    Fail(&'static str),
    /// Sustained readiness: refund the restart budget.
    ResetRestarts,
}

/// Pure health policy, separated from the timer thread so it can be tested
/// against fabricated instants.
fn evaluate_health(view: &HealthView, config: &SupervisorConfig, now: Instant) -> Vec<HealthAction> {
    let mut actions = Vec::new();
    if !view.alive {
        return actions;
    }

    if let Some(deadline) = view.probe_deadline {
        if now >= deadline {
            actions.push(HealthAction::Fail("health check timed out"));
        }
        // Probe in flight; nothing else to decide until it resolves.
        return actions;
    }

    if view.ready && view.restart_count > 0 {
        if let Some(since) = view.ready_since {
            if now.duration_since(since) >= config.readiness_grace {
                actions.push(HealthAction::ResetRestarts);
            }
        }
    }

    let silence = now.duration_since(view.last_activity);
    let (threshold, response_budget) = if view.busy {
        (config.busy_silence_threshold, config.busy_health_check_timeout)
    } else {
        (config.idle_silence_threshold, config.health_check_timeout)
    };
    if silence >= threshold {
        actions.push(HealthAction::Probe {
            deadline: now + response_budget,
        });
    }

    actions
}

/// Health timer thread: one per supervisor, runs until termination.
fn run_health_loop(shared: Arc<Shared>) {
    let mut inner = lock(&shared);
    loop {
        if inner.state == SupervisorState::Terminated {
            return;
        }

        let now = Instant::now();
        let actions = evaluate_health(&inner.health_view(), &shared.config, now);
        let mut probe = None;
        let mut failure = None;
        for action in actions {
            match action {
                HealthAction::ResetRestarts => {
                    log::info!("engine stable; restart budget reset");
                    inner.restart_count = 0;
                }
                HealthAction::Probe { deadline } => {
                    inner.probe_deadline = Some(deadline);
                    probe = Some(shared.config.liveness_probe.clone());
                }
                HealthAction::Fail(reason) => failure = Some(reason),
            }
        }

        if let Some(reason) = failure {
            drop(inner);
            handle_failure(&shared, reason);
            inner = lock(&shared);
        } else if let Some(cmd) = probe {
            log::debug!("liveness probe: {}", cmd);
            log_line(&shared.transcript, "SEND", &cmd);
            let send_failed = match inner.transport.as_ref() {
                Some(transport) => transport.send(&cmd).is_err(),
                None => false,
            };
            if send_failed {
                drop(inner);
                handle_failure(&shared, "liveness probe send failed");
                inner = lock(&shared);
            }
        }

        // Wake early for an armed probe deadline; otherwise tick on the
        // configured interval. The condvar also wakes us on activity.
        let now = Instant::now();
        let mut sleep_for = shared.config.health_check_interval;
        if let Some(deadline) = inner.probe_deadline {
            sleep_for = sleep_for.min(deadline.saturating_duration_since(now));
            sleep_for = sleep_for.max(Duration::from_millis(1));
        }
        let (guard, _) = shared
            .cond
            .wait_timeout(inner, sleep_for)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner = guard;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{wait_until, MockFactory};

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            restart_backoff: Duration::from_millis(5),
            health_check_interval: Duration::from_millis(10),
            health_check_timeout: Duration::from_millis(40),
            busy_health_check_timeout: Duration::from_millis(80),
            // Long enough that only tests that want probes see them.
            idle_silence_threshold: Duration::from_secs(60),
            busy_silence_threshold: Duration::from_secs(120),
            readiness_grace: Duration::from_secs(60),
            ..SupervisorConfig::default()
        }
    }

    fn start_ready_supervisor(config: SupervisorConfig) -> (EngineSupervisor, MockFactory) {
        let factory = MockFactory::default();
        let supervisor =
            EngineSupervisor::start(Box::new(factory.clone()), config, Arc::new(EventBus::new()));
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 1));
        factory.worker(0).emit("uciok");
        assert!(wait_until(Duration::from_secs(1), || supervisor.is_ready()));
        (supervisor, factory)
    }

    #[test]
    fn init_command_sent_and_readiness_detected() {
        let (supervisor, factory) = start_ready_supervisor(test_config());
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert_eq!(factory.worker(0).sent_lines(), vec!["uci"]);
        supervisor.terminate();
    }

    #[test]
    fn send_forwards_and_records_output() {
        let (supervisor, factory) = start_ready_supervisor(test_config());

        supervisor.send("isready").unwrap();
        let worker = factory.worker(0);
        assert!(worker.sent_lines().contains(&"isready".to_string()));
        worker.emit("readyok");

        let (lines, next) = supervisor.wait_output(0, Duration::from_secs(1));
        assert_eq!(lines[0], "uciok");
        let more = if lines.len() > 1 {
            lines[1..].to_vec()
        } else {
            supervisor.wait_output(next, Duration::from_secs(1)).0
        };
        assert_eq!(more, vec!["readyok"]);
        supervisor.terminate();
    }

    #[test]
    fn send_fails_when_not_alive() {
        let factory = MockFactory::default();
        let config = SupervisorConfig {
            max_restarts: 0,
            ..test_config()
        };
        let supervisor =
            EngineSupervisor::start(Box::new(factory.clone()), config, Arc::new(EventBus::new()));
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 1));
        factory.worker(0).crash();
        assert!(wait_until(Duration::from_secs(1), || {
            supervisor.state() == SupervisorState::Dead
        }));

        assert!(matches!(
            supervisor.send("isready"),
            Err(SupervisorError::NotAlive)
        ));
        supervisor.terminate();
    }

    #[test]
    fn crash_triggers_restart_with_fresh_worker() {
        let (supervisor, factory) = start_ready_supervisor(test_config());

        factory.worker(0).crash();
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 2));
        assert_eq!(supervisor.restart_count(), 1);

        // Readiness is re-armed on the replacement worker.
        assert!(!supervisor.is_ready());
        factory.worker(1).emit("uciok");
        assert!(wait_until(Duration::from_secs(1), || supervisor.is_ready()));
        supervisor.terminate();
    }

    #[test]
    fn restart_budget_exhaustion_is_fatal() {
        let factory = MockFactory::default();
        let config = SupervisorConfig {
            max_restarts: 2,
            ..test_config()
        };
        let supervisor =
            EngineSupervisor::start(Box::new(factory.clone()), config, Arc::new(EventBus::new()));

        for i in 0..3 {
            assert!(wait_until(Duration::from_secs(1), || {
                factory.worker_count() == i + 1
            }));
            factory.worker(i).crash();
        }

        assert!(wait_until(Duration::from_secs(1), || {
            supervisor.state() == SupervisorState::Dead
        }));
        // No further restart attempt occurs.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(factory.worker_count(), 3);
        supervisor.terminate();
    }

    #[test]
    fn dead_is_announced_on_the_bus() {
        let factory = MockFactory::default();
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let config = SupervisorConfig {
            max_restarts: 0,
            ..test_config()
        };
        let supervisor =
            EngineSupervisor::start(Box::new(factory.clone()), config, Arc::clone(&bus));
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 1));
        factory.worker(0).crash();
        assert!(wait_until(Duration::from_secs(1), || {
            supervisor.state() == SupervisorState::Dead
        }));

        let mut saw_dead = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::EngineDead { restarts: 0 }) {
                saw_dead = true;
            }
        }
        assert!(saw_dead);
        supervisor.terminate();
    }

    #[test]
    fn sustained_readiness_resets_restart_budget() {
        let factory = MockFactory::default();
        let config = SupervisorConfig {
            max_restarts: 1,
            readiness_grace: Duration::from_millis(30),
            ..test_config()
        };
        let supervisor =
            EngineSupervisor::start(Box::new(factory.clone()), config, Arc::new(EventBus::new()));

        // First failure spends the whole budget.
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 1));
        factory.worker(0).crash();
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 2));
        assert_eq!(supervisor.restart_count(), 1);

        // A grace window of sustained readiness refunds it.
        factory.worker(1).emit("uciok");
        assert!(wait_until(Duration::from_secs(1), || {
            supervisor.restart_count() == 0
        }));

        // So a second failure still gets a restart: the worker survives
        // max_restarts + 1 failures spread across two grace windows.
        factory.worker(1).crash();
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 3));
        assert_ne!(supervisor.state(), SupervisorState::Dead);
        supervisor.terminate();
    }

    #[test]
    fn idle_silence_triggers_probe_and_response_cancels_it() {
        let factory = MockFactory::default();
        let config = SupervisorConfig {
            idle_silence_threshold: Duration::from_millis(20),
            health_check_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let supervisor =
            EngineSupervisor::start(Box::new(factory.clone()), config, Arc::new(EventBus::new()));
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 1));
        factory.worker(0).emit("uciok");

        assert!(wait_until(Duration::from_secs(1), || {
            factory.worker(0).sent_lines().contains(&"isready".to_string())
        }));

        // Answering the probe keeps the worker alive.
        factory.worker(0).emit("readyok");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(factory.worker_count(), 1);
        assert_ne!(supervisor.state(), SupervisorState::Dead);
        supervisor.terminate();
    }

    #[test]
    fn unanswered_probe_restarts_the_worker() {
        let factory = MockFactory::default();
        let config = SupervisorConfig {
            idle_silence_threshold: Duration::from_millis(20),
            health_check_timeout: Duration::from_millis(30),
            ..test_config()
        };
        let supervisor =
            EngineSupervisor::start(Box::new(factory.clone()), config, Arc::new(EventBus::new()));
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 1));
        factory.worker(0).emit("uciok");

        // The probe goes out, never gets answered, and the worker is replaced.
        assert!(wait_until(Duration::from_secs(2), || factory.worker_count() >= 2));
        assert!(supervisor.restart_count() >= 1);
        supervisor.terminate();
    }

    #[test]
    fn duplicate_failure_report_spends_one_restart() {
        let config = SupervisorConfig {
            restart_backoff: Duration::from_millis(50),
            ..test_config()
        };
        let (supervisor, factory) = start_ready_supervisor(config);

        // Two reporters of the same fault: the exit watcher and a probe
        // deadline can both observe one dead worker.
        handle_failure(&supervisor.shared, "engine exited with code 137");
        handle_failure(&supervisor.shared, "health check timed out");
        assert_eq!(supervisor.restart_count(), 1);

        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 2));
        // One fault, one replacement, one budget unit.
        thread::sleep(Duration::from_millis(120));
        assert_eq!(factory.worker_count(), 2);
        assert_eq!(supervisor.restart_count(), 1);
        supervisor.terminate();
    }

    #[test]
    fn replacement_worker_starts_with_a_clean_output_window() {
        let (supervisor, factory) = start_ready_supervisor(test_config());
        assert_eq!(supervisor.output_end(), 1);

        factory.worker(0).crash();
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 2));
        factory.worker(1).emit("uciok");
        assert!(wait_until(Duration::from_secs(1), || supervisor.is_ready()));

        // The old worker's lines are gone but indices stay monotonic, so a
        // stale cursor resumes at the replacement's first line.
        let (lines, next) = supervisor.read_output(0);
        assert_eq!(lines, vec!["uciok"]);
        assert_eq!(next, 2);
        supervisor.terminate();
    }

    #[test]
    fn manual_restart_recovers_a_dead_supervisor() {
        let factory = MockFactory::default();
        let config = SupervisorConfig {
            max_restarts: 0,
            ..test_config()
        };
        let supervisor =
            EngineSupervisor::start(Box::new(factory.clone()), config, Arc::new(EventBus::new()));
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 1));
        factory.worker(0).crash();
        assert!(wait_until(Duration::from_secs(1), || {
            supervisor.state() == SupervisorState::Dead
        }));

        supervisor.restart();
        assert!(wait_until(Duration::from_secs(1), || factory.worker_count() == 2));
        factory.worker(1).emit("uciok");
        assert!(wait_until(Duration::from_secs(1), || supervisor.is_ready()));
        supervisor.terminate();
    }

    #[test]
    fn terminate_is_idempotent() {
        let (supervisor, factory) = start_ready_supervisor(test_config());
        supervisor.terminate();
        supervisor.terminate();
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert!(!supervisor.is_alive());

        // No replacement worker is spawned after termination.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(factory.worker_count(), 1);
    }

    mod health_policy {
        use super::*;

        fn view(base: Instant) -> HealthView {
            HealthView {
                alive: true,
                ready: true,
                busy: false,
                restart_count: 0,
                last_activity: base,
                ready_since: Some(base),
                probe_deadline: None,
            }
        }

        fn config() -> SupervisorConfig {
            SupervisorConfig::default()
        }

        #[test]
        fn quiet_idle_worker_gets_probed_after_threshold() {
            let base = Instant::now();
            let now = base + Duration::from_secs(301);
            let actions = evaluate_health(&view(base), &config(), now);
            assert!(matches!(actions[..], [HealthAction::Probe { deadline }]
                if deadline == now + config().health_check_timeout));
        }

        #[test]
        fn recently_active_worker_is_left_alone() {
            let base = Instant::now();
            let now = base + Duration::from_secs(299);
            assert!(evaluate_health(&view(base), &config(), now).is_empty());
        }

        #[test]
        fn busy_worker_uses_long_threshold_and_budget() {
            let base = Instant::now();
            let mut v = view(base);
            v.busy = true;

            // Past the idle threshold but under the busy one: no probe.
            let now = base + Duration::from_secs(400);
            assert!(evaluate_health(&v, &config(), now).is_empty());

            // Past the busy threshold: probe with the longer budget.
            let now = base + Duration::from_secs(601);
            let actions = evaluate_health(&v, &config(), now);
            assert!(matches!(actions[..], [HealthAction::Probe { deadline }]
                if deadline == now + config().busy_health_check_timeout));
        }

        #[test]
        fn expired_probe_deadline_fails_the_worker() {
            let base = Instant::now();
            let mut v = view(base);
            v.probe_deadline = Some(base + Duration::from_secs(10));
            let actions = evaluate_health(&v, &config(), base + Duration::from_secs(11));
            assert!(matches!(actions[..], [HealthAction::Fail(_)]));
        }

        #[test]
        fn pending_probe_suppresses_further_probes() {
            let base = Instant::now();
            let mut v = view(base);
            v.probe_deadline = Some(base + Duration::from_secs(10));
            // Silent way past every threshold, but a probe is already out.
            let actions = evaluate_health(&v, &config(), base + Duration::from_secs(5));
            assert!(actions.is_empty());
        }

        #[test]
        fn grace_window_refunds_restart_budget() {
            let base = Instant::now();
            let mut v = view(base);
            v.restart_count = 2;
            v.last_activity = base + Duration::from_secs(25);

            let actions = evaluate_health(&v, &config(), base + Duration::from_secs(31));
            assert!(matches!(actions[..], [HealthAction::ResetRestarts]));
        }

        #[test]
        fn no_refund_before_grace_elapses() {
            let base = Instant::now();
            let mut v = view(base);
            v.restart_count = 2;
            v.last_activity = base + Duration::from_secs(20);
            let actions = evaluate_health(&v, &config(), base + Duration::from_secs(29));
            assert!(actions.is_empty());
        }

        #[test]
        fn dead_or_restarting_worker_is_not_probed() {
            let base = Instant::now();
            let mut v = view(base);
            v.alive = false;
            let actions = evaluate_health(&v, &config(), base + Duration::from_secs(1000));
            assert!(actions.is_empty());
        }
    }
}
