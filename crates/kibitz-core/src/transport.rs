//! Engine transport: an asynchronous, line-oriented channel to a worker.
//!
//! The supervisor only needs three things from a transport: write a line,
//! receive whole output lines as they arrive, and tear the worker down. The
//! default implementation spawns a child process (a UCI engine) with piped
//! stdio and pumps its stdout on a background thread, but anything
//! line-shaped (a socket, a sandboxed script host) can implement
//! [`Transport`]. The supervisor never assumes a maximum line rate or a
//! minimum inter-line delay.
//!
//! Because the supervisor replaces crashed workers, it holds a
//! [`TransportFactory`] rather than a single transport.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::TransportError;

/// Exit status reported when an engine process terminates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineExit {
    pub code: i32,
    pub signal: Option<i32>,
}

/// Events delivered by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One whole line of engine output.
    Line(String),
    /// The worker terminated or the channel failed fatally.
    Closed(EngineExit),
}

/// A live, line-oriented channel to one worker instance.
pub trait Transport: Send {
    /// Forward one line to the worker. Fire-and-forget.
    fn send(&self, line: &str) -> Result<(), TransportError>;

    /// Tear the worker down. Idempotent; safe while lines are in flight.
    fn terminate(&self);
}

/// Source of fresh transports, used on every (re)start.
pub trait TransportFactory: Send + Sync {
    fn connect(&self) -> Result<(Box<dyn Transport>, Receiver<TransportEvent>), TransportError>;
}

/// How to launch an engine process.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Parse a full command line ("stockfish --threads 2") into program + args.
    pub fn parse(command_line: &str) -> Result<Self, TransportError> {
        let parts = shlex::split(command_line)
            .ok_or_else(|| TransportError::InvalidCommand(command_line.to_string()))?;
        let mut iter = parts.into_iter();
        let program = iter
            .next()
            .ok_or_else(|| TransportError::InvalidCommand(command_line.to_string()))?;
        Ok(Self {
            program,
            args: iter.collect(),
            working_dir: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl TransportFactory for EngineCommand {
    fn connect(&self) -> Result<(Box<dyn Transport>, Receiver<TransportEvent>), TransportError> {
        let (transport, events) = ProcessTransport::spawn(self)?;
        Ok((Box::new(transport), events))
    }
}

/// A worker backed by a child process with piped stdio.
pub struct ProcessTransport {
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl ProcessTransport {
    /// Spawn the engine and start the stdout/stderr/exit pump threads.
    pub fn spawn(command: &EngineCommand) -> Result<(Self, Receiver<TransportEvent>), TransportError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(TransportError::Spawn)?;

        let child_stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::NotRunning)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::NotRunning)?;

        let (tx, rx) = mpsc::channel();

        let child_arc = Arc::new(Mutex::new(Some(child)));
        let stdin_arc = Arc::new(Mutex::new(child_stdin));

        // Stdout pump: one TransportEvent per whole line.
        let tx_stdout = tx.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines().map_while(Result::ok) {
                if tx_stdout.send(TransportEvent::Line(line)).is_err() {
                    break;
                }
            }
        });

        // Stderr is diagnostic only; it never enters the protocol stream.
        let program = command.program.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                log::warn!("engine stderr [{}]: {}", program, line);
            }
        });

        // Exit watcher: polls the child and reports the terminal event.
        let child_exit = Arc::clone(&child_arc);
        let stdin_exit = Arc::clone(&stdin_arc);
        thread::spawn(move || loop {
            let mut guard = match child_exit.lock() {
                Ok(guard) => guard,
                Err(_) => break,
            };
            match guard.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        let _ = tx.send(TransportEvent::Closed(EngineExit {
                            code: status.code().unwrap_or_default(),
                            signal: None,
                        }));
                        guard.take();
                        if let Ok(mut stdin) = stdin_exit.lock() {
                            stdin.take();
                        }
                        break;
                    }
                    Ok(None) => {}
                    Err(_) => {
                        let _ = tx.send(TransportEvent::Closed(EngineExit {
                            code: -1,
                            signal: None,
                        }));
                        guard.take();
                        break;
                    }
                },
                None => break,
            }
            drop(guard);
            thread::sleep(Duration::from_millis(100));
        });

        Ok((
            Self {
                child: child_arc,
                stdin: stdin_arc,
            },
            rx,
        ))
    }
}

impl Transport for ProcessTransport {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().map_err(|_| TransportError::NotRunning)?;
        match guard.as_mut() {
            Some(stdin) => {
                writeln!(stdin, "{}", line).map_err(TransportError::Write)?;
                stdin.flush().map_err(TransportError::Write)?;
                Ok(())
            }
            None => Err(TransportError::NotRunning),
        }
    }

    fn terminate(&self) {
        // Closing stdin first: UCI engines exit cleanly on EOF.
        if let Ok(mut stdin) = self.stdin.lock() {
            stdin.take();
        }

        let mut guard = match self.child.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(ref mut child) = *guard {
            #[cfg(unix)]
            {
                let pid = child.id();
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }
                // Bounded grace period before the hard kill.
                for _ in 0..20 {
                    thread::sleep(Duration::from_millis(50));
                    match child.try_wait() {
                        Ok(Some(_)) => {
                            guard.take();
                            return;
                        }
                        Ok(None) => continue,
                        Err(_) => break,
                    }
                }
            }

            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_program_and_args() {
        let cmd = EngineCommand::parse("stockfish --threads 2").unwrap();
        assert_eq!(cmd.program, "stockfish");
        assert_eq!(cmd.args, vec!["--threads", "2"]);
    }

    #[test]
    fn parse_honors_quoting() {
        let cmd = EngineCommand::parse("'/opt/my engines/sf' bench").unwrap();
        assert_eq!(cmd.program, "/opt/my engines/sf");
        assert_eq!(cmd.args, vec!["bench"]);
    }

    #[test]
    fn parse_rejects_empty_command() {
        assert!(EngineCommand::parse("").is_err());
    }

    #[test]
    fn builder_collects_args() {
        let cmd = EngineCommand::new("stockfish").arg("bench").working_dir("/tmp");
        assert_eq!(cmd.args, vec!["bench"]);
        assert_eq!(cmd.working_dir, Some("/tmp".to_string()));
    }

    #[test]
    #[cfg(unix)]
    fn spawn_delivers_lines_then_closed() {
        let cmd = EngineCommand::new("sh")
            .arg("-c")
            .arg("echo hello; echo world");
        let (_transport, events) = ProcessTransport::spawn(&cmd).unwrap();

        let first = events.recv().unwrap();
        assert!(matches!(first, TransportEvent::Line(ref l) if l == "hello"));
        let second = events.recv().unwrap();
        assert!(matches!(second, TransportEvent::Line(ref l) if l == "world"));
        let third = events.recv().unwrap();
        assert!(matches!(third, TransportEvent::Closed(ref e) if e.code == 0));
    }

    #[test]
    #[cfg(unix)]
    fn send_reaches_process_stdin() {
        let cmd = EngineCommand::new("cat");
        let (transport, events) = ProcessTransport::spawn(&cmd).unwrap();

        transport.send("ping").unwrap();
        let event = events.recv().unwrap();
        assert!(matches!(event, TransportEvent::Line(ref l) if l == "ping"));

        transport.terminate();
    }

    #[test]
    #[cfg(unix)]
    fn send_after_terminate_fails() {
        let cmd = EngineCommand::new("cat");
        let (transport, _events) = ProcessTransport::spawn(&cmd).unwrap();

        transport.terminate();
        assert!(matches!(
            transport.send("ping"),
            Err(TransportError::NotRunning)
        ));
    }

    #[test]
    fn spawn_missing_binary_is_an_error() {
        let cmd = EngineCommand::new("/nonexistent/kibitz-engine");
        assert!(matches!(
            ProcessTransport::spawn(&cmd),
            Err(TransportError::Spawn(_))
        ));
    }

    #[test]
    fn engine_exit_serializes() {
        let exit = EngineExit {
            code: 1,
            signal: None,
        };
        let json = serde_json::to_string(&exit).unwrap();
        assert!(json.contains("\"code\":1"));
    }
}
