//! Bounded subprocess execution
//!
//! Both transports drive external binaries (`adb`, the libmtp tools). Every
//! invocation goes through [`CommandRunner`], which kills the child once its
//! timeout elapses so no caller can block on a wedged driver.

use crate::core::error::{ExtractionError, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, trace, warn};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How often the child is polled for exit
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Grace period for the pipe readers after the child exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by a signal)
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, for error matching
    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else if self.stdout.trim().is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs one external program with a per-call timeout
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
    timeout: Duration,
}

enum Stream {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the program can be started at all
    pub fn is_available(&self, probe_args: &[&str]) -> bool {
        match self.run(probe_args) {
            Ok(_) => true,
            Err(e) => {
                debug!("{} unavailable: {}", self.program.display(), e);
                false
            }
        }
    }

    /// Run with the default timeout
    pub fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        self.run_with_timeout(args, self.timeout)
    }

    /// Run and wait at most `timeout`; the child is killed when it elapses
    pub fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let description = self.describe(args);
        trace!("exec: {}", description);

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ExtractionError::BackendUnavailable(format!(
                    "'{}' not found (is it installed and on PATH?)",
                    self.program.display()
                )),
                _ => ExtractionError::IoError(format!(
                    "Failed to start '{}': {}",
                    self.program.display(),
                    e
                )),
            })?;

        let (tx, rx) = bounded::<Stream>(2);
        if let Some(mut stdout) = child.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stdout.read_to_end(&mut buf);
                let _ = tx.send(Stream::Stdout(buf));
            });
        }
        if let Some(mut stderr) = child.stderr.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                let _ = tx.send(Stream::Stderr(buf));
            });
        }
        drop(tx);

        let code = self.wait_bounded(&mut child, &description, timeout)?;

        let mut output = CommandOutput {
            code,
            ..CommandOutput::default()
        };
        for _ in 0..2 {
            match rx.recv_timeout(DRAIN_TIMEOUT) {
                Ok(Stream::Stdout(buf)) => output.stdout = String::from_utf8_lossy(&buf).into_owned(),
                Ok(Stream::Stderr(buf)) => output.stderr = String::from_utf8_lossy(&buf).into_owned(),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Output of '{}' not fully drained", description);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(output)
    }

    fn wait_bounded(
        &self,
        child: &mut Child,
        description: &str,
        timeout: Duration,
    ) -> Result<Option<i32>> {
        let started = Instant::now();
        loop {
            match child.try_wait()? {
                Some(status) => return Ok(status.code()),
                None if started.elapsed() >= timeout => {
                    warn!(
                        "'{}' exceeded {} ms, killing it",
                        description,
                        timeout.as_millis()
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExtractionError::TransportTimeout {
                        operation: description.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        let program = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());
        if args.is_empty() {
            program
        } else {
            format!("{} {}", program, args.join(" "))
        }
    }
}

/// Quote a value for a POSIX shell (device side `sh`)
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
