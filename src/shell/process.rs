//! Pipe-backed shell spawning.
//!
//! Used when PTY mode is disabled (`sessions.pty = false`). The shell has no
//! controlling terminal, so `resize` is a no-op for these sessions.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

/// Spawn an interactive shell in its own process group with piped I/O.
///
/// Calls `setpgid(0, 0)` via `pre_exec` so the shell becomes a process group
/// leader and the whole tree can be signalled via `kill(-pgid, signal)`.
/// `kill_on_drop(true)` reaps the shell if its owner is dropped.
pub fn spawn_shell_pgroup(
    shell: &str,
    working_dir: &Path,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(shell);
    cmd.current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(vars) = env {
        cmd.envs(vars);
    }
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}
