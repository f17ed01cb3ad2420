//! Non-blocking draining of a child's stdout and stderr.
//!
//! Each stream gets its own reader task feeding a bounded queue, so a
//! child that floods one stream can never stall reads of the other. The
//! consumer polls stdout with a short timeout and takes whatever stderr
//! has queued up without waiting.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

/// Number of stderr lines kept for diagnostics.
pub const STDERR_TAIL_LINES: usize = 50;

const QUEUE_CAPACITY: usize = 1024;

/// One item produced by a stream reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Line(String),
    /// The read failed; `Closed` follows.
    Failed(String),
    /// End of stream. Always the last item.
    Closed,
}

/// The two output queues of one child process.
#[derive(Debug)]
pub struct OutputStreams {
    stdout: mpsc::Receiver<StreamItem>,
    stderr: mpsc::Receiver<StreamItem>,
    stdout_closed: bool,
    stderr_closed: bool,
    stderr_tail: VecDeque<String>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputStreams {
    /// Start one reader task per stream.
    pub fn spawn<O, E>(stdout: O, stderr: E) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (stdout_tx, stdout_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(QUEUE_CAPACITY);

        let readers = vec![
            tokio::spawn(read_lines(stdout, stdout_tx)),
            tokio::spawn(read_lines(stderr, stderr_tx)),
        ];

        Self {
            stdout: stdout_rx,
            stderr: stderr_rx,
            stdout_closed: false,
            stderr_closed: false,
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
            readers,
        }
    }

    /// Wait up to `wait` for the next stdout item.
    ///
    /// `None` means nothing arrived in time. Once stdout has closed every
    /// call returns `Some(StreamItem::Closed)` immediately.
    pub async fn next_stdout(&mut self, wait: Duration) -> Option<StreamItem> {
        if self.stdout_closed {
            return Some(StreamItem::Closed);
        }
        match tokio::time::timeout(wait, self.stdout.recv()).await {
            Ok(Some(StreamItem::Closed)) | Ok(None) => {
                self.stdout_closed = true;
                Some(StreamItem::Closed)
            }
            Ok(Some(item)) => Some(item),
            Err(_) => None,
        }
    }

    /// Take every stderr line queued so far without waiting.
    pub fn drain_stderr(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while !self.stderr_closed {
            match self.stderr.try_recv() {
                Ok(StreamItem::Line(line)) => {
                    self.remember(&line);
                    lines.push(line);
                }
                Ok(StreamItem::Failed(e)) => {
                    tracing::debug!(error = %e, "stderr reader failed");
                }
                Ok(StreamItem::Closed) | Err(TryRecvError::Disconnected) => {
                    self.stderr_closed = true;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        lines
    }

    /// Wait (bounded) for stderr to reach end of stream, then drain it.
    pub async fn drain_stderr_to_end(&mut self, wait: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut lines = self.drain_stderr();
        while !self.stderr_closed {
            match tokio::time::timeout_at(deadline, self.stderr.recv()).await {
                Ok(Some(item)) => {
                    let closed = item == StreamItem::Closed;
                    if let StreamItem::Line(line) = item {
                        self.remember(&line);
                        lines.push(line);
                    }
                    self.stderr_closed = closed;
                }
                Ok(None) => self.stderr_closed = true,
                Err(_) => break,
            }
        }
        lines
    }

    fn remember(&mut self, line: &str) {
        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line.to_string());
    }

    pub fn stdout_closed(&self) -> bool {
        self.stdout_closed
    }

    /// The most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.iter().cloned().collect()
    }
}

impl Drop for OutputStreams {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Read `reader` line by line into `tx`, then send [`StreamItem::Closed`].
async fn read_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<StreamItem>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(StreamItem::Line(decode_line(&buf))).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(StreamItem::Failed(e.to_string())).await;
                break;
            }
        }
    }

    let _ = tx.send(StreamItem::Closed).await;
}

/// Decode one raw line as UTF-8 (lossily) without its line terminator.
pub fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}
