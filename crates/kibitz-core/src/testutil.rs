//! Scripted transports for tests.
//!
//! A [`MockFactory`] hands the supervisor fully scripted workers: the test
//! drives output lines and crashes by hand, inspects every line the
//! supervisor sent, and can attach an auto-responder that answers the UCI
//! handshake like a real engine.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::transport::{EngineExit, Transport, TransportEvent, TransportFactory};

pub(crate) struct MockTransport {
    sent: Arc<Mutex<Vec<String>>>,
    cmd_tx: Sender<String>,
    open: Arc<Mutex<bool>>,
}

impl Transport for MockTransport {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        if !*self.open.lock().unwrap() {
            return Err(TransportError::NotRunning);
        }
        self.sent.lock().unwrap().push(line.to_string());
        let _ = self.cmd_tx.send(line.to_string());
        Ok(())
    }

    fn terminate(&self) {
        *self.open.lock().unwrap() = false;
    }
}

/// One scripted worker instance, as seen by the test.
pub(crate) struct MockWorker {
    line_tx: Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    cmd_rx: Mutex<Option<Receiver<String>>>,
}

impl MockWorker {
    /// Deliver one line of engine output.
    pub fn emit(&self, line: &str) {
        let _ = self.line_tx.send(TransportEvent::Line(line.to_string()));
    }

    /// Simulate a process crash.
    pub fn crash(&self) {
        let _ = self.line_tx.send(TransportEvent::Closed(EngineExit {
            code: 137,
            signal: None,
        }));
    }

    /// Every line the supervisor has sent to this worker so far.
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Take the command stream for an auto-responder. Panics on second call.
    pub fn take_commands(&self) -> Receiver<String> {
        self.cmd_rx
            .lock()
            .unwrap()
            .take()
            .expect("command stream already taken")
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockFactory {
    workers: Arc<Mutex<Vec<Arc<MockWorker>>>>,
}

impl MockFactory {
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn worker(&self, index: usize) -> Arc<MockWorker> {
        Arc::clone(&self.workers.lock().unwrap()[index])
    }
}

impl TransportFactory for MockFactory {
    fn connect(&self) -> Result<(Box<dyn Transport>, Receiver<TransportEvent>), TransportError> {
        let (line_tx, line_rx) = mpsc::channel();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.workers.lock().unwrap().push(Arc::new(MockWorker {
            line_tx,
            sent: Arc::clone(&sent),
            cmd_rx: Mutex::new(Some(cmd_rx)),
        }));
        Ok((
            Box::new(MockTransport {
                sent,
                cmd_tx,
                open: Arc::new(Mutex::new(true)),
            }),
            line_rx,
        ))
    }
}

/// Poll `pred` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    pred()
}

/// Answer the UCI handshake (`uci` -> `uciok`, `isready` -> `readyok`) so
/// higher layers can run against the mock as if it were a real engine.
/// Other commands are swallowed; the test scripts search output itself.
pub(crate) fn auto_respond(worker: Arc<MockWorker>) {
    let commands = worker.take_commands();
    thread::spawn(move || {
        for cmd in commands {
            match cmd.as_str() {
                "uci" => worker.emit("uciok"),
                "isready" => worker.emit("readyok"),
                _ => {}
            }
        }
    });
}
