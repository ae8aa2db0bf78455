// PicoCheck - QEMU Board Smoke Tests
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Emulator console capture and pattern matching.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;

/// Result of polling a [`ConsoleStream`].
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleRead {
    Data(Vec<u8>),
    /// Nothing arrived before the poll timeout.
    Idle,
    /// Every producer has hung up.
    Closed,
}

/// Byte stream produced by an emulator's serial console.
pub struct ConsoleStream {
    rx: Receiver<Vec<u8>>,
}

impl ConsoleStream {
    /// In-process stream; the stream closes once every sender is dropped.
    pub fn channel() -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }

    /// Spawns one forwarding thread per reader (typically a child's stdout and stderr).
    pub fn from_readers(readers: Vec<Box<dyn Read + Send>>) -> Self {
        let (tx, stream) = Self::channel();
        for (idx, reader) in readers.into_iter().enumerate() {
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("console-reader-{}", idx))
                .spawn(move || forward(reader, tx));
            if let Err(e) = spawned {
                warn!("Failed to spawn console reader thread: {}", e);
            }
        }
        stream
    }

    pub fn next_chunk(&self, timeout: Duration) -> ConsoleRead {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => ConsoleRead::Data(chunk),
            Err(RecvTimeoutError::Timeout) => ConsoleRead::Idle,
            Err(RecvTimeoutError::Disconnected) => ConsoleRead::Closed,
        }
    }
}

fn forward(mut reader: Box<dyn Read + Send>, tx: Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Console reader stopped: {}", e);
                break;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern: String,
    /// Byte offset of the match in the console transcript.
    pub offset: usize,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Timed out after {waited:?} waiting for console pattern {pattern:?}")]
    Timeout { pattern: String, waited: Duration },
    #[error("Failure pattern {pattern:?} appeared on the console at offset {offset}")]
    FailurePattern { pattern: String, offset: usize },
    #[error("Console closed before pattern {pattern:?} appeared")]
    StreamClosed { pattern: String },
}

/// Accumulates console output and blocks until literal patterns show up.
///
/// Patterns are matched against the whole transcript, so a pattern split
/// across reads is still found. Successive waits only look past the end of
/// the previous match, which makes a list of patterns an ordered sequence.
#[derive(Default)]
pub struct ConsoleWatcher {
    transcript: Vec<u8>,
    match_end: usize,
    closed: bool,
    echo_stdout: bool,
}

impl ConsoleWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror console output to stdout as it arrives.
    pub fn set_echo_stdout(&mut self, echo_stdout: bool) {
        self.echo_stdout = echo_stdout;
    }

    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    pub fn transcript_text(&self) -> String {
        String::from_utf8_lossy(&self.transcript).into_owned()
    }

    pub fn wait_for_pattern(
        &mut self,
        stream: &ConsoleStream,
        pattern: &str,
        timeout: Duration,
    ) -> Result<PatternMatch, WatchError> {
        self.wait_for_any(stream, pattern, &[], timeout)
    }

    /// Waits for `success` while failing early on any of `failures`.
    ///
    /// When both appear in the same read, whichever starts first wins.
    pub fn wait_for_any(
        &mut self,
        stream: &ConsoleStream,
        success: &str,
        failures: &[&str],
        timeout: Duration,
    ) -> Result<PatternMatch, WatchError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut scanned = self.match_end;

        loop {
            let found_success = find_from(&self.transcript, success, window(scanned, success, self.match_end));
            let found_failure = failures
                .iter()
                .filter_map(|f| {
                    find_from(&self.transcript, f, window(scanned, f, self.match_end))
                        .map(|offset| (offset, *f))
                })
                .min_by_key(|(offset, _)| *offset);
            scanned = self.transcript.len();

            match (found_success, found_failure) {
                (Some(ok), Some((bad, pattern))) if bad < ok => {
                    return Err(self.failed(pattern, bad));
                }
                (None, Some((bad, pattern))) => return Err(self.failed(pattern, bad)),
                (Some(offset), _) => {
                    self.match_end = offset + success.len();
                    let elapsed = start.elapsed();
                    debug!("Matched {:?} at offset {} after {:?}", success, offset, elapsed);
                    return Ok(PatternMatch {
                        pattern: success.to_string(),
                        offset,
                        elapsed,
                    });
                }
                (None, None) => {}
            }

            if self.closed {
                return Err(WatchError::StreamClosed {
                    pattern: success.to_string(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WatchError::Timeout {
                    pattern: success.to_string(),
                    waited: now - start,
                });
            }

            match stream.next_chunk(deadline - now) {
                ConsoleRead::Data(chunk) => self.append(&chunk),
                ConsoleRead::Idle => {}
                ConsoleRead::Closed => self.closed = true,
            }
        }
    }

    fn failed(&mut self, pattern: &str, offset: usize) -> WatchError {
        self.match_end = offset + pattern.len();
        WatchError::FailurePattern {
            pattern: pattern.to_string(),
            offset,
        }
    }

    fn append(&mut self, chunk: &[u8]) {
        debug!("Console: {} bytes", chunk.len());
        self.transcript.extend_from_slice(chunk);
        if self.echo_stdout {
            let mut out = io::stdout().lock();
            let _ = out.write_all(chunk);
            let _ = out.flush();
        }
    }
}

/// First offset worth searching for `pattern` once `scanned` bytes were already checked.
fn window(scanned: usize, pattern: &str, floor: usize) -> usize {
    scanned
        .saturating_sub(pattern.len().saturating_sub(1))
        .max(floor)
}

fn find_from(haystack: &[u8], needle: &str, from: usize) -> Option<usize> {
    let needle = needle.as_bytes();
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
