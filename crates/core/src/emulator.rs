// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::console::ConsoleStream;
use picocheck_config::EmulatorConfig;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// `Ctrl-A x`: quit sequence of QEMU's stdio multiplexer under `-nographic`.
const QEMU_MUX_QUIT: &[u8] = b"\x01x";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum EmulatorError {
    #[error("Emulator is already running")]
    AlreadyRunning,
    #[error("Emulator is not running")]
    NotRunning,
    #[error("Failed to launch {binary:?}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to stop emulator: {0}")]
    Shutdown(#[source] io::Error),
}

/// A machine emulator driven as an external process.
pub trait EmulatorHandle {
    fn add_arg(&mut self, arg: &str);

    fn add_args(&mut self, args: &[&str]) {
        for arg in args {
            self.add_arg(arg);
        }
    }

    /// Drops arguments added since construction, keeping configured ones.
    fn reset_args(&mut self);

    /// Full command line, binary first.
    fn command_line(&self) -> Vec<String>;

    fn launch(&mut self) -> Result<(), EmulatorError>;

    /// Console of the running instance, `None` before launch.
    fn console(&self) -> Option<&ConsoleStream>;

    fn is_running(&mut self) -> bool;

    /// Stops the instance. Calling it on a stopped instance is a no-op.
    fn shutdown(&mut self) -> Result<(), EmulatorError>;
}

/// QEMU system emulator instance.
pub struct QemuMachine {
    binary: String,
    args: Vec<String>,
    /// Number of leading `args` that come from configuration.
    base_len: usize,
    shutdown_timeout: Duration,
    child: Option<Child>,
    console: Option<ConsoleStream>,
    exit_status: Option<ExitStatus>,
}

impl QemuMachine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            base_len: 0,
            shutdown_timeout: Duration::from_millis(picocheck_config::DEFAULT_SHUTDOWN_TIMEOUT_MS),
            child: None,
            console: None,
            exit_status: None,
        }
    }

    pub fn from_config(config: &EmulatorConfig) -> Self {
        let mut machine = Self::new(config.binary.clone());
        machine.args.extend(config.args.iter().cloned());
        if let Some(name) = &config.machine {
            machine.args.push("-machine".to_string());
            machine.args.push(name.clone());
        }
        machine.base_len = machine.args.len();
        machine
    }

    /// Grace period between the quit request and a hard kill.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Exit status of the last instance, once it has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    fn wait_for_exit(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl EmulatorHandle for QemuMachine {
    fn add_arg(&mut self, arg: &str) {
        self.args.push(arg.to_string());
    }

    fn reset_args(&mut self) {
        self.args.truncate(self.base_len);
    }

    fn command_line(&self) -> Vec<String> {
        std::iter::once(self.binary.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    fn launch(&mut self) -> Result<(), EmulatorError> {
        if self.child.is_some() {
            return Err(EmulatorError::AlreadyRunning);
        }

        debug!("Launching: {}", self.command_line().join(" "));
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EmulatorError::Launch {
                binary: self.binary.clone(),
                source,
            })?;

        let mut readers: Vec<Box<dyn Read + Send>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(Box::new(stderr));
        }

        info!("Emulator {} started (pid {})", self.binary, child.id());
        self.console = Some(ConsoleStream::from_readers(readers));
        self.exit_status = None;
        self.child = Some(child);
        Ok(())
    }

    fn console(&self) -> Option<&ConsoleStream> {
        self.console.as_ref()
    }

    fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to query emulator state: {}", e);
                false
            }
        }
    }

    fn shutdown(&mut self) -> Result<(), EmulatorError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let status = match child.try_wait().map_err(EmulatorError::Shutdown)? {
            Some(status) => status,
            None => {
                if let Some(mut stdin) = child.stdin.take() {
                    // The instance may already be on its way out; a broken pipe is fine here.
                    let _ = stdin.write_all(QEMU_MUX_QUIT);
                    let _ = stdin.flush();
                }
                match Self::wait_for_exit(&mut child, self.shutdown_timeout)
                    .map_err(EmulatorError::Shutdown)?
                {
                    Some(status) => status,
                    None => {
                        warn!(
                            "Emulator ignored quit request for {:?}, killing pid {}",
                            self.shutdown_timeout,
                            child.id()
                        );
                        if let Err(e) = child.kill() {
                            if e.kind() != io::ErrorKind::InvalidInput {
                                return Err(EmulatorError::Shutdown(e));
                            }
                        }
                        child.wait().map_err(EmulatorError::Shutdown)?
                    }
                }
            }
        };

        info!("Emulator stopped ({})", status);
        self.exit_status = Some(status);
        Ok(())
    }
}

impl Drop for QemuMachine {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A launched emulator that is shut down when the guard goes out of scope.
///
/// [`RunningEmulator::shutdown`] reports shutdown errors; dropping the guard
/// only logs them.
pub struct RunningEmulator<'a, E: EmulatorHandle> {
    emulator: &'a mut E,
    stopped: bool,
}

impl<'a, E: EmulatorHandle> RunningEmulator<'a, E> {
    pub fn launch(emulator: &'a mut E) -> Result<Self, EmulatorError> {
        emulator.launch()?;
        Ok(Self {
            emulator,
            stopped: false,
        })
    }

    pub fn shutdown(mut self) -> Result<(), EmulatorError> {
        self.stopped = true;
        self.emulator.shutdown()
    }
}

impl<E: EmulatorHandle> Deref for RunningEmulator<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.emulator
    }
}

impl<E: EmulatorHandle> DerefMut for RunningEmulator<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.emulator
    }
}

impl<E: EmulatorHandle> Drop for RunningEmulator<'_, E> {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        if let Err(e) = self.emulator.shutdown() {
            warn!("Emulator shutdown failed: {}", e);
        }
    }
}
