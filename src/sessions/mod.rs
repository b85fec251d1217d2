//! Pane-keyed shell session registry.
//!
//! [`SessionRegistry`] is the single authority for creating, re-attaching and
//! destroying shell sessions. A caller-supplied *pane id* maps to at most one
//! live session; asking for the same pane again returns the existing session.
//!
//! A session is destroyed by an explicit [`SessionRegistry::kill`], by its
//! process exiting, or by its idle timer (see [`reaper`]). All three paths
//! remove the pane mapping, the session entry and the timer under one write
//! lock.
//!
//! ## Concurrency
//!
//! Both maps live behind one `RwLock`. `create_or_get` holds the write lock
//! across check, spawn and insert, so two concurrent calls for the same pane
//! create exactly one session. Slow work (graceful kills, stdin writes)
//! happens after the lock is released.

pub mod buffer;
pub mod reaper;
pub mod session;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionsConfig;
use crate::error::SessionError;
use crate::events::{EventSender, UiEvent};
use crate::shell::process::spawn_shell_pgroup;
use crate::shell::pty::{allocate_pty, spawn_shell_pty};
use buffer::OutputEntry;
use reaper::IdleTimer;
use session::{now_ms, ManagedSession, OutputSink};

/// Registry settings, resolved from [`SessionsConfig`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: String,
    pub pty: bool,
    pub buffer_size: usize,
    /// `None` disables idle eviction.
    pub idle_timeout: Option<Duration>,
    pub max_sessions: usize,
    pub rows: u16,
    pub cols: u16,
}

impl From<&SessionsConfig> for SessionOptions {
    fn from(cfg: &SessionsConfig) -> Self {
        Self {
            shell: crate::shell::resolve_shell(&cfg.shell),
            pty: cfg.pty,
            buffer_size: cfg.buffer_size,
            idle_timeout: (cfg.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(cfg.idle_timeout_secs)),
            max_sessions: cfg.max_sessions,
            rows: cfg.default_rows,
            cols: cfg.default_cols,
        }
    }
}

/// Result of [`SessionRegistry::create_or_get`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub pid: u32,
    pub is_existing: bool,
}

/// Result of [`SessionRegistry::attach`].
#[derive(Debug, Clone, Serialize)]
pub struct AttachSnapshot {
    pub pid: u32,
    pub buffered_output: Vec<OutputEntry>,
}

/// Summary of a session returned by [`SessionRegistry::list_sessions`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionListItem {
    pub session_id: String,
    pub pane_id: String,
    pub cwd: String,
    pub pid: u32,
    pub pty: bool,
    /// Epoch milliseconds when the session was created.
    pub created_at: u64,
    /// Seconds since the last touch or output, whichever is more recent.
    pub idle_secs: u64,
}

/// Registry bookkeeping for one session.
struct SessionEntry {
    session: ManagedSession,
    pane_id: String,
    cwd: PathBuf,
    created_at: u64,
    /// Last create-or-get, attach, detach or write.
    last_activity: Instant,
    idle: IdleTimer,
}

#[derive(Default)]
struct RegistryMaps {
    panes: HashMap<String, String>,
    sessions: HashMap<String, SessionEntry>,
}

impl RegistryMaps {
    /// Remove a session and, if it still points at it, its pane mapping.
    fn take(&mut self, session_id: &str) -> Option<SessionEntry> {
        let entry = self.sessions.remove(session_id)?;
        if self.panes.get(&entry.pane_id).map(String::as_str) == Some(session_id) {
            self.panes.remove(&entry.pane_id);
        }
        Some(entry)
    }
}

struct RegistryInner {
    maps: RwLock<RegistryMaps>,
    options: SessionOptions,
    events: EventSender,
}

/// Manages the pane-keyed pool of interactive shell sessions.
///
/// Cloneable; all clones share the same state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(options: SessionOptions, events: EventSender) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                maps: RwLock::new(RegistryMaps::default()),
                options,
                events,
            }),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Return the live session for `pane_id`, or spawn one rooted at `cwd`.
    ///
    /// An existing session has its idle timer reset and `is_existing = true`.
    /// On spawn failure nothing is registered.
    pub async fn create_or_get(
        &self,
        pane_id: &str,
        cwd: &str,
    ) -> Result<SessionHandle, SessionError> {
        let mut maps = self.inner.maps.write().await;

        if let Some(session_id) = maps.panes.get(pane_id).cloned() {
            let live = match maps.sessions.get(&session_id) {
                Some(entry) => entry.session.is_running(),
                None => false,
            };
            if live {
                if let Some(entry) = maps.sessions.get_mut(&session_id) {
                    self.touch(&session_id, entry);
                    debug!("Pane {pane_id} reusing session {session_id}");
                    return Ok(SessionHandle {
                        session_id,
                        pid: entry.session.pid,
                        is_existing: true,
                    });
                }
            }
            warn!("Pane {pane_id} had a dangling mapping to {session_id}, replacing");
            maps.panes.remove(pane_id);
            if let Some(entry) = maps.take(&session_id) {
                self.discard(&session_id, entry, "exited");
            }
        }

        if maps.sessions.len() >= self.inner.options.max_sessions {
            return Err(SessionError::LimitReached(self.inner.options.max_sessions));
        }

        let session_id = Uuid::new_v4().to_string();
        let cwd = PathBuf::from(crate::util::expand_tilde(cwd).as_ref());
        let session = self.spawn_session(&session_id, &cwd)?;
        let pid = session.pid;

        let mut entry = SessionEntry {
            session,
            pane_id: pane_id.to_string(),
            cwd,
            created_at: now_ms(),
            last_activity: Instant::now(),
            idle: IdleTimer::new(),
        };
        self.touch(&session_id, &mut entry);

        let mode = if entry.session.is_pty() { "pty" } else { "pipe" };
        maps.panes.insert(pane_id.to_string(), session_id.clone());
        maps.sessions.insert(session_id.clone(), entry);
        info!(
            "Session {session_id} created for pane {pane_id} ({mode}, pid {pid}), total: {}",
            maps.sessions.len()
        );

        Ok(SessionHandle {
            session_id,
            pid,
            is_existing: false,
        })
    }

    fn spawn_session(&self, session_id: &str, cwd: &Path) -> Result<ManagedSession, SessionError> {
        let opts = &self.inner.options;
        let sink = OutputSink::new(
            session_id.to_string(),
            opts.buffer_size,
            self.inner.events.clone(),
        );

        let weak = Arc::downgrade(&self.inner);
        let sid = session_id.to_string();
        let on_exit = move |_code: Option<i32>| async move {
            if let Some(inner) = weak.upgrade() {
                SessionRegistry { inner }.remove_exited(&sid).await;
            }
        };

        let spawn_err = |source: std::io::Error| SessionError::Spawn {
            shell: opts.shell.clone(),
            cwd: cwd.display().to_string(),
            source,
        };

        if opts.pty {
            let pair = allocate_pty(opts.rows, opts.cols)?;
            let env = HashMap::from([("TERM".to_string(), "xterm-256color".to_string())]);
            let child = spawn_shell_pty(&pair, &opts.shell, cwd, Some(&env)).map_err(spawn_err)?;
            // The child holds its own copy of the slave; ours closes here.
            ManagedSession::spawn_pty(child, pair.master, sink, on_exit)
        } else {
            let child = spawn_shell_pgroup(&opts.shell, cwd, None).map_err(spawn_err)?;
            ManagedSession::spawn(child, sink, on_exit)
        }
    }

    /// Record activity and restart the idle timer.
    fn touch(&self, session_id: &str, entry: &mut SessionEntry) {
        entry.last_activity = Instant::now();
        let weak = Arc::downgrade(&self.inner);
        let sid = session_id.to_string();
        entry
            .idle
            .reschedule(self.inner.options.idle_timeout, move |generation| async move {
                if let Some(inner) = weak.upgrade() {
                    SessionRegistry { inner }.evict_idle(&sid, generation).await;
                }
            });
    }

    /// Reset the idle timer and return the buffered output in order.
    /// `None` if the session does not exist.
    pub async fn attach(&self, session_id: &str) -> Option<AttachSnapshot> {
        let mut maps = self.inner.maps.write().await;
        let entry = maps.sessions.get_mut(session_id)?;
        self.touch(session_id, entry);
        Some(AttachSnapshot {
            pid: entry.session.pid,
            buffered_output: entry.session.sink.snapshot().await,
        })
    }

    /// An observer went away. Counts as activity; the session stays live.
    pub async fn detach(&self, session_id: &str) -> bool {
        let mut maps = self.inner.maps.write().await;
        match maps.sessions.get_mut(session_id) {
            Some(entry) => {
                self.touch(session_id, entry);
                true
            }
            None => false,
        }
    }

    /// Forward input to the session and reset its idle timer.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> bool {
        let stdin = {
            let mut maps = self.inner.maps.write().await;
            let Some(entry) = maps.sessions.get_mut(session_id) else {
                return false;
            };
            self.touch(session_id, entry);
            entry.session.stdin()
        };
        match stdin.send(data.to_vec()).await {
            Ok(()) => true,
            Err(_) => {
                debug!("Session {session_id} stdin closed, dropping write");
                false
            }
        }
    }

    /// Resize the session's PTY. Not an activity signal.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        let maps = self.inner.maps.read().await;
        let Some(entry) = maps.sessions.get(session_id) else {
            return false;
        };
        match entry.session.resize(rows, cols) {
            Ok(()) => true,
            Err(e) => {
                debug!("Session {session_id} resize to {cols}x{rows} ignored: {e}");
                false
            }
        }
    }

    /// Remove the session and terminate its process group. Returns whether
    /// the session existed.
    ///
    /// Returns once both mappings are gone; the SIGTERM/SIGKILL sequence runs
    /// in the background.
    pub async fn kill(&self, session_id: &str) -> bool {
        let entry = self.inner.maps.write().await.take(session_id);
        let Some(mut entry) = entry else {
            return false;
        };
        entry.idle.cancel();
        info!("Session {session_id} killed");
        self.destroyed(session_id, "killed");
        let sid = session_id.to_string();
        tokio::spawn(async move {
            entry.session.graceful_kill().await;
            debug!("Session {sid} process group terminated");
        });
        true
    }

    /// Live session for `pane_id`. A mapping to a gone or exited session is
    /// cleared and reported as `None`.
    pub async fn get_session_for_pane(&self, pane_id: &str) -> Option<String> {
        let mut maps = self.inner.maps.write().await;
        let session_id = maps.panes.get(pane_id).cloned()?;
        let live = match maps.sessions.get(&session_id) {
            Some(entry) => entry.session.is_running(),
            None => false,
        };
        if live {
            return Some(session_id);
        }
        debug!("Pane {pane_id} mapping to {session_id} is dangling, clearing");
        maps.panes.remove(pane_id);
        if let Some(entry) = maps.take(&session_id) {
            self.discard(&session_id, entry, "exited");
        }
        None
    }

    pub async fn session_count(&self) -> usize {
        self.inner.maps.read().await.sessions.len()
    }

    pub async fn list_sessions(&self) -> Vec<SessionListItem> {
        let maps = self.inner.maps.read().await;
        let now = now_ms();
        let mut items: Vec<SessionListItem> = maps
            .sessions
            .iter()
            .map(|(id, entry)| {
                let since_output = Duration::from_millis(
                    now.saturating_sub(entry.session.sink.last_output_ms()),
                );
                SessionListItem {
                    session_id: id.clone(),
                    pane_id: entry.pane_id.clone(),
                    cwd: entry.cwd.display().to_string(),
                    pid: entry.session.pid,
                    pty: entry.session.is_pty(),
                    created_at: entry.created_at,
                    idle_secs: entry.last_activity.elapsed().min(since_output).as_secs(),
                }
            })
            .collect();
        items.sort_by_key(|item| item.created_at);
        items
    }

    /// Kill every session (used during shutdown).
    ///
    /// Sends SIGTERM to all at once, waits up to 3 s, then SIGKILLs the rest.
    pub async fn kill_all(&self) {
        let entries: Vec<(String, SessionEntry)> = {
            let mut maps = self.inner.maps.write().await;
            maps.panes.clear();
            maps.sessions.drain().collect()
        };
        let count = entries.len();
        if count == 0 {
            return;
        }

        let kills = entries.into_iter().map(|(id, mut entry)| async move {
            entry.idle.cancel();
            entry.session.graceful_kill().await;
            info!("Session {id} killed (shutdown)");
        });
        futures::future::join_all(kills).await;
        info!("Shut down {count} session(s)");
    }

    /// Exit hook: the process is gone, drop whatever is still registered.
    async fn remove_exited(&self, session_id: &str) {
        let entry = self.inner.maps.write().await.take(session_id);
        if let Some(entry) = entry {
            self.discard(session_id, entry, "exited");
        }
    }

    /// Idle timer callback. Evicts only if `generation` is still current.
    async fn evict_idle(&self, session_id: &str, generation: u64) -> bool {
        let entry = {
            let mut maps = self.inner.maps.write().await;
            let current = maps.sessions.get(session_id).map(|e| e.idle.generation());
            if current != Some(generation) {
                debug!("Stale idle timer for {session_id} (generation {generation}), ignoring");
                return false;
            }
            maps.take(session_id)
        };
        let Some(mut entry) = entry else { return false };
        // This runs inside the timer task itself; aborting it would cut the kill short.
        entry.idle.disarm();
        info!(
            "Session {session_id} idle for {}s, evicting",
            entry.last_activity.elapsed().as_secs()
        );
        entry.session.graceful_kill().await;
        self.destroyed(session_id, "idle_timeout");
        true
    }

    /// Tear down an entry that was removed while holding the lock.
    fn discard(&self, session_id: &str, mut entry: SessionEntry, reason: &str) {
        entry.idle.cancel();
        entry.session.kill();
        info!("Session {session_id} removed ({reason})");
        self.destroyed(session_id, reason);
    }

    fn destroyed(&self, session_id: &str, reason: &str) {
        let _ = self.inner.events.send(UiEvent::SessionDestroyed {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        });
    }

    #[cfg(test)]
    async fn sink(&self, session_id: &str) -> Option<OutputSink> {
        let maps = self.inner.maps.read().await;
        maps.sessions.get(session_id).map(|e| e.session.sink.clone())
    }

    #[cfg(test)]
    async fn idle_generation(&self, session_id: &str) -> Option<u64> {
        let maps = self.inner.maps.read().await;
        maps.sessions.get(session_id).map(|e| e.idle.generation())
    }
}
