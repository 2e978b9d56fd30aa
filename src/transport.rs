//! The framed-message duplex pipe to the prover subprocess.
//!
//! [`PipeTransport`] owns the child process end to end: it spawns
//! `sertop`, runs a dedicated reader thread that turns the child's stdout
//! into a stream of raw message lines on an `mpsc` channel, and exposes a
//! synchronous writer plus interrupt/kill signalling. Everything above this
//! module talks to a [`Transport`] trait object instead, so the executor and
//! its tests can run against [`ScriptedTransport`] without ever forking a
//! real prover — the same "swap the backend behind a trait, don't reach for
//! a process-wide global" discipline this crate's `Executor`/`Promise` pair
//! used for dispatching work onto a thread pool.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::DriverError;

/// Abstraction over the duplex connection to the prover, so the rest of the
/// crate (and its tests) need not depend on a real child process.
pub trait Transport {
    /// Write one sentence (without a trailing newline; the implementation
    /// adds it) and flush.
    fn send_line(&mut self, line: &str) -> Result<(), DriverError>;

    /// Block for up to `timeout` waiting for the next raw message line.
    /// Returns `Ok(None)` on timeout, `Ok(Some(line))` on a message, and an
    /// error if the pipe is known to be broken.
    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, DriverError>;

    /// Forward an interrupt signal to the child.
    fn interrupt(&mut self) -> Result<(), DriverError>;

    /// Terminate the child unconditionally.
    fn kill(&mut self) -> Result<(), DriverError>;
}

/// A real pipe to a spawned prover subprocess.
pub struct PipeTransport {
    child: Child,
    stdin: ChildStdin,
    rx: mpsc::Receiver<io::Result<String>>,
    reader_alive: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
}

impl PipeTransport {
    /// Spawn `argv[0] argv[1..]` with `cwd` as its working directory, piping
    /// stdin/stdout/stderr, and start the reader thread.
    pub fn spawn(argv: &[String], cwd: &std::path::Path) -> Result<Self, DriverError> {
        assert!(!argv.is_empty(), "coq_command must name at least the executable");
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let reader_alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let alive_for_reader = reader_alive.clone();
        let reader_handle = thread::spawn(move || {
            let mut lines = BufReader::new(stdout).lines();
            while alive_for_reader.load(Ordering::Acquire) {
                match lines.next() {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if !line.trim_start().starts_with('(') && line.trim() != "Sys.Break" {
                            log::warn!("ignoring non-sentence line from prover: {}", line);
                            continue;
                        }
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                    None => break,
                }
            }
        });

        // stderr is drained on its own thread purely to avoid filling its
        // pipe buffer and deadlocking the child; its contents are logged,
        // not surfaced to callers.
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().flatten() {
                log::debug!("sertop stderr: {}", line);
            }
        });

        Ok(PipeTransport { child, stdin, rx, reader_alive, reader_handle: Some(reader_handle) })
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    #[cfg(unix)]
    fn send_signal(&self, sig: nix::sys::signal::Signal) -> Result<(), DriverError> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(self.pid() as i32), sig)
            .map_err(|e| DriverError::BrokenPipe(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }

    #[cfg(not(unix))]
    fn send_signal(&self, _sig: ()) -> Result<(), DriverError> {
        Err(DriverError::BrokenPipe(io::Error::new(
            io::ErrorKind::Unsupported,
            "signal forwarding is only implemented on unix",
        )))
    }
}

impl Transport for PipeTransport {
    fn send_line(&mut self, line: &str) -> Result<(), DriverError> {
        writeln!(self.stdin, "{}", line).map_err(DriverError::BrokenPipe)?;
        self.stdin.flush().map_err(DriverError::BrokenPipe)
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, DriverError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(line)) => Ok(Some(line)),
            Ok(Err(e)) => Err(DriverError::BrokenPipe(e)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::BrokenPipe(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "reader thread terminated",
            ))),
        }
    }

    fn interrupt(&mut self) -> Result<(), DriverError> {
        #[cfg(unix)]
        {
            self.send_signal(nix::sys::signal::Signal::SIGINT)
        }
        #[cfg(not(unix))]
        {
            self.send_signal(())
        }
    }

    fn kill(&mut self) -> Result<(), DriverError> {
        self.reader_alive.store(false, Ordering::Release);
        self.child.kill().map_err(DriverError::BrokenPipe)
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.reader_alive.store(false, Ordering::Release);
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
    }
}

/// A fake transport that plays back a fixed sequence of response lines,
/// grouped per sent command. Used by tests so the whole executor/mirror
/// state machine can be exercised without a real `sertop` on `PATH`.
pub struct ScriptedTransport {
    /// One entry per expected `send_line` call, in order: the lines that
    /// should be "received" in response.
    responses: std::collections::VecDeque<Vec<String>>,
    pending: std::collections::VecDeque<String>,
    pub sent: Vec<String>,
    interrupts: usize,
    killed: bool,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Vec<&str>>) -> Self {
        ScriptedTransport {
            responses: responses
                .into_iter()
                .map(|batch| batch.into_iter().map(str::to_string).collect())
                .collect(),
            pending: std::collections::VecDeque::new(),
            sent: Vec::new(),
            interrupts: 0,
            killed: false,
        }
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts
    }

    pub fn was_killed(&self) -> bool {
        self.killed
    }
}

impl Transport for ScriptedTransport {
    fn send_line(&mut self, line: &str) -> Result<(), DriverError> {
        self.sent.push(line.to_string());
        if let Some(batch) = self.responses.pop_front() {
            self.pending.extend(batch);
        }
        Ok(())
    }

    fn recv_line(&mut self, _timeout: Duration) -> Result<Option<String>, DriverError> {
        Ok(self.pending.pop_front())
    }

    fn interrupt(&mut self) -> Result<(), DriverError> {
        self.interrupts += 1;
        Ok(())
    }

    fn kill(&mut self) -> Result<(), DriverError> {
        self.killed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_transport_replays_per_send_batches() {
        let mut t = ScriptedTransport::new(vec![vec!["(Answer 0 Ack)", "(Answer 0 (Added 2 () ()))"]]);
        t.send_line("(Add () \"Lemma l : True.\")").unwrap();
        assert_eq!(t.recv_line(Duration::from_millis(0)).unwrap(), Some("(Answer 0 Ack)".to_string()));
        assert_eq!(
            t.recv_line(Duration::from_millis(0)).unwrap(),
            Some("(Answer 0 (Added 2 () ()))".to_string())
        );
        assert_eq!(t.recv_line(Duration::from_millis(0)).unwrap(), None);
    }

    #[test]
    fn scripted_transport_tracks_interrupts_and_kill() {
        let mut t = ScriptedTransport::new(vec![]);
        t.interrupt().unwrap();
        t.interrupt().unwrap();
        t.kill().unwrap();
        assert_eq!(t.interrupt_count(), 2);
        assert!(t.was_killed());
    }
}
