//! Buffer-backed managed shell process with process group and PTY support.
//!
//! A [`ManagedSession`] wraps a shell whose output is written to an
//! [`OutputBuffer`] and published on the UI event channel instead of being
//! coupled to one observer. Observers can come and go; the buffer keeps the
//! recent tail for replay.
//!
//! ## Process groups
//!
//! Pipe shells are spawned as process group leaders and PTY shells as session
//! leaders, so signals sent to `-pgid` reach the whole process tree.
//!
//! ## Exit
//!
//! The exit watcher records the exit code, publishes
//! [`UiEvent::SessionExit`] exactly once, and then runs the caller-supplied
//! exit hook (the registry uses it to drop its entry).

use std::future::Future;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::buffer::{OutputBuffer, OutputEntry, OutputStream};
use crate::error::SessionError;
use crate::events::{EventSender, UiEvent};
use crate::shell::pty;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Where a session's output goes: its replay buffer, then the UI channel.
///
/// The event is sent while the buffer lock is held, so the buffer order and
/// the live event order are the same.
#[derive(Clone)]
pub struct OutputSink {
    session_id: String,
    buffer: Arc<Mutex<OutputBuffer>>,
    events: EventSender,
    last_output_ms: Arc<AtomicU64>,
}

impl OutputSink {
    pub fn new(session_id: String, buffer_size: usize, events: EventSender) -> Self {
        Self {
            session_id,
            buffer: Arc::new(Mutex::new(OutputBuffer::new(buffer_size))),
            events,
            last_output_ms: Arc::new(AtomicU64::new(now_ms())),
        }
    }

    /// Record one chunk of output.
    pub async fn record(&self, stream: OutputStream, data: String) {
        let mut buf = self.buffer.lock().await;
        let entry = buf.push(stream, data);
        // No receivers just means no UI is attached right now.
        let _ = self.events.send(UiEvent::SessionOutput {
            session_id: self.session_id.clone(),
            seq: entry.seq,
            stream: entry.stream,
            data: entry.data.clone(),
        });
        self.last_output_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> Vec<OutputEntry> {
        self.buffer.lock().await.snapshot()
    }

    pub fn last_output_ms(&self) -> u64 {
        self.last_output_ms.load(Ordering::Relaxed)
    }
}

/// A running shell process with buffer-backed output.
pub struct ManagedSession {
    /// OS process ID of the shell.
    pub pid: u32,
    /// Process group ID (equals pid since the shell is the group leader).
    pub pgid: u32,
    pub sink: OutputSink,
    /// Set by the exit watcher; checked before signalling so a recycled pid
    /// is never hit.
    exited: Arc<AtomicBool>,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    /// stdin writer and output readers; aborted on kill.
    io_tasks: Vec<JoinHandle<()>>,
    /// Exit watcher; left running on kill so the exit event is still published.
    exit_task: JoinHandle<()>,
    /// PTY master fd (PTY sessions only), kept alive for resize.
    pty_master: Option<OwnedFd>,
}

impl ManagedSession {
    /// Wrap a pipe-backed child. Spawns stdin writer, stdout/stderr readers and
    /// the exit watcher.
    pub fn spawn<F, Fut>(mut child: Child, sink: OutputSink, on_exit: F) -> Result<Self, SessionError>
    where
        F: FnOnce(Option<i32>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let process_id = child.id().unwrap_or(0);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Io("Failed to take stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Io("Failed to take stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Io("Failed to take stderr pipe".into()))?;

        let (stdin_tx, stdin_task) = spawn_writer(stdin);
        let stdout_task = spawn_reader(stdout, sink.clone(), OutputStream::Stdout);
        let stderr_task = spawn_reader(stderr, sink.clone(), OutputStream::Stderr);

        let exited = Arc::new(AtomicBool::new(false));
        let exit_task = spawn_exit_watcher(child, sink.clone(), Arc::clone(&exited), on_exit);

        Ok(ManagedSession {
            pid: process_id,
            pgid: process_id,
            sink,
            exited,
            stdin_tx,
            io_tasks: vec![stdin_task, stdout_task, stderr_task],
            exit_task,
            pty_master: None,
        })
    }

    /// Wrap a PTY-backed child. Output is a single merged stream.
    pub fn spawn_pty<F, Fut>(
        child: Child,
        pty_master: OwnedFd,
        sink: OutputSink,
        on_exit: F,
    ) -> Result<Self, SessionError>
    where
        F: FnOnce(Option<i32>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let process_id = child.id().unwrap_or(0);

        // One dup for writing, one for reading; the original stays for resize.
        let master_write =
            tokio::fs::File::from_std(std::fs::File::from(pty::dup_master(&pty_master)?));
        let master_read =
            tokio::fs::File::from_std(std::fs::File::from(pty::dup_master(&pty_master)?));

        let (stdin_tx, stdin_task) = spawn_writer(master_write);
        let output_task = spawn_reader(master_read, sink.clone(), OutputStream::Stdout);

        let exited = Arc::new(AtomicBool::new(false));
        let exit_task = spawn_exit_watcher(child, sink.clone(), Arc::clone(&exited), on_exit);

        Ok(ManagedSession {
            pid: process_id,
            pgid: process_id,
            sink,
            exited,
            stdin_tx,
            io_tasks: vec![stdin_task, output_task],
            exit_task,
            pty_master: Some(pty_master),
        })
    }

    /// Resize the PTY (error for pipe sessions).
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), String> {
        if let Some(ref master) = self.pty_master {
            pty::resize_pty(master, rows, cols).map_err(|e| e.to_string())
        } else {
            Err("Not a PTY session".into())
        }
    }

    pub fn is_pty(&self) -> bool {
        self.pty_master.is_some()
    }

    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::Acquire) && !self.exit_task.is_finished()
    }

    /// A handle for queueing stdin writes without holding the registry lock.
    pub fn stdin(&self) -> mpsc::Sender<Vec<u8>> {
        self.stdin_tx.clone()
    }

    /// Kill immediately: SIGKILL to the process group and abort the I/O tasks.
    pub fn kill(&self) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pgid as i32;
        if pgid > 0 && self.is_running() {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        self.abort_io();
    }

    /// Gracefully kill: SIGTERM, wait up to 3 s for the exit watcher to see
    /// the process go, then SIGKILL.
    pub async fn graceful_kill(&self) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pgid as i32;
        if pgid <= 0 || !self.is_running() {
            self.abort_io();
            return;
        }

        unsafe {
            libc::kill(-pgid, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(3);
        loop {
            if !self.is_running() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("pgid {pgid} ignored SIGTERM, sending SIGKILL");
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }

        self.abort_io();
    }

    fn abort_io(&self) {
        for task in &self.io_tasks {
            task.abort();
        }
    }
}

fn spawn_writer<W>(writer: W) -> (mpsc::Sender<Vec<u8>>, JoinHandle<()>)
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(data) = rx.recv().await {
            if writer.write_all(&data).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });
    (tx, task)
}

/// Chunk-based reader so output is delivered as soon as it is produced.
///
/// A multi-byte character split across two reads is held back and decoded
/// with the next read.
fn spawn_reader<R>(reader: R, sink: OutputSink, stream: OutputStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut tmp = [0u8; 4096];
        let mut carry: Vec<u8> = Vec::new();
        loop {
            match reader.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    carry.extend_from_slice(&tmp[..n]);
                    let data = take_utf8(&mut carry);
                    if !data.is_empty() {
                        sink.record(stream, data).await;
                    }
                }
            }
        }
        if !carry.is_empty() {
            sink.record(stream, String::from_utf8_lossy(&carry).into_owned())
                .await;
        }
        debug!("Session {} {} closed", sink.session_id, stream.as_str());
    })
}

/// Decode `buf`, leaving an incomplete trailing character in it.
/// Invalid bytes elsewhere become U+FFFD.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    let keep = match std::str::from_utf8(buf) {
        Err(e) if e.error_len().is_none() => buf.len() - e.valid_up_to(),
        _ => 0,
    };
    let tail = buf.split_off(buf.len() - keep);
    let text = String::from_utf8_lossy(buf).into_owned();
    *buf = tail;
    text
}

fn spawn_exit_watcher<F, Fut>(
    mut child: Child,
    sink: OutputSink,
    exited: Arc<AtomicBool>,
    on_exit: F,
) -> JoinHandle<()>
where
    F: FnOnce(Option<i32>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(s) => {
                let code = s.code();
                info!("Session {} exited with code {code:?}", sink.session_id);
                sink.record(
                    OutputStream::System,
                    format!("Process exited with code {}", code.unwrap_or(-1)),
                )
                .await;
                code
            }
            Err(e) => {
                error!("Session {} wait error: {e}", sink.session_id);
                sink.record(OutputStream::System, format!("Process wait error: {e}"))
                    .await;
                None
            }
        };
        exited.store(true, Ordering::Release);
        let _ = sink.events.send(UiEvent::SessionExit {
            session_id: sink.session_id.clone(),
            exit_code: code,
        });
        on_exit(code).await;
    })
}
