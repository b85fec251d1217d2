//! Shell discovery and process spawning.
//!
//! - [`process`] spawns pipe-backed shells in their own process group.
//! - [`pty`] allocates a PTY, spawns a shell on its slave side, and resizes it.
//!
//! [`resolve_shell`] picks the binary a new session runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub mod process;
pub mod pty;

/// Detect available shells on this system.
///
/// Reads `/etc/shells` first (filtering comments and blank lines), then falls
/// back to probing a hardcoded list of common paths. Results are deduplicated
/// by canonical path and sorted by preference: zsh > fish > bash > dash > ash > sh.
pub fn detect_shells() -> Vec<String> {
    let candidates = if let Ok(contents) = std::fs::read_to_string("/etc/shells") {
        let from_file: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter(|l| Path::new(l).exists())
            .map(ToString::to_string)
            .collect();
        if from_file.is_empty() {
            fallback_candidates()
        } else {
            from_file
        }
    } else {
        fallback_candidates()
    };

    let mut seen = HashSet::new();
    let mut shells: Vec<String> = candidates
        .into_iter()
        .filter(|p| {
            let canonical = std::fs::canonicalize(p).unwrap_or_else(|_| PathBuf::from(p));
            seen.insert(canonical)
        })
        .collect();

    shells.sort_by_key(|s| shell_rank(s));
    shells
}

/// Pick the shell for new sessions.
///
/// A non-empty `configured` value wins, then `$SHELL`, then the best detected
/// shell, and finally `/bin/sh`.
pub fn resolve_shell(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() && Path::new(&shell).exists() {
            return shell;
        }
    }
    detect_shells()
        .into_iter()
        .next()
        .unwrap_or_else(|| "/bin/sh".to_string())
}

fn fallback_candidates() -> Vec<String> {
    [
        "/bin/sh",
        "/bin/bash",
        "/bin/zsh",
        "/bin/ash",
        "/bin/dash",
        "/usr/bin/fish",
        "/usr/bin/zsh",
        "/usr/bin/bash",
    ]
    .iter()
    .filter(|p| Path::new(p).exists())
    .map(|p| (*p).to_string())
    .collect()
}

fn shell_rank(path: &str) -> u8 {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name {
        "zsh" => 0,
        "fish" => 1,
        "bash" => 2,
        "dash" => 3,
        "ash" => 4,
        "sh" => 5,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_rank_orders_known_shells() {
        assert!(shell_rank("/bin/zsh") < shell_rank("/usr/bin/bash"));
        assert!(shell_rank("/bin/bash") < shell_rank("/bin/sh"));
        assert_eq!(shell_rank("/opt/custom/nu"), 6);
    }

    #[test]
    fn test_resolve_shell_prefers_configured() {
        assert_eq!(resolve_shell("/bin/custom"), "/bin/custom");
    }

    #[test]
    fn test_resolve_shell_falls_back_to_something() {
        assert!(!resolve_shell("").is_empty());
    }
}
