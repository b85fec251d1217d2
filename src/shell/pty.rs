//! PTY allocation, shell spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept alive
//! for the session lifetime so I/O and resize can be performed on it.
//!
//! Every descriptor handed out here is close-on-exec, so a shell spawned
//! later never inherits another session's master.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    set_cloexec(&master)?;
    // dup2 onto 0/1/2 in the child clears the flag on the copies it keeps.
    set_cloexec(&slave)?;
    Ok(PtyPair { master, slave })
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), nix::Error> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Duplicate a PTY master with close-on-exec set atomically.
pub fn dup_master(master: &OwnedFd) -> Result<OwnedFd, nix::Error> {
    let raw = fcntl(master.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0))?;
    // SAFETY: fcntl just returned this descriptor and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Spawn a login shell on the slave side of the PTY.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal; stdin/stdout/stderr are all the slave fd.
pub fn spawn_shell_pty(
    pty: &PtyPair,
    shell: &str,
    working_dir: &Path,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(shell);
    cmd.arg("-l");
    cmd.current_dir(working_dir).kill_on_drop(true);

    // stdio is wired in pre_exec (dup2 onto the slave), so no pipes here.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if let Some(vars) = env {
        cmd.envs(vars);
    }

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let ws = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_updates_window_size() {
        let pair = allocate_pty(24, 80).unwrap();
        resize_pty(&pair.master, 40, 120).unwrap();

        let mut ws = winsize(0, 0);
        // SAFETY: TIOCGWINSZ writes into the provided Winsize.
        let ret = unsafe {
            libc::ioctl(
                pair.master.as_raw_fd(),
                libc::TIOCGWINSZ,
                std::ptr::addr_of_mut!(ws),
            )
        };
        assert_eq!(ret, 0);
        assert_eq!((ws.ws_row, ws.ws_col), (40, 120));
    }

    fn is_cloexec(fd: &OwnedFd) -> bool {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_descriptors_are_close_on_exec() {
        let pair = allocate_pty(24, 80).unwrap();
        assert!(is_cloexec(&pair.master));
        assert!(is_cloexec(&pair.slave));

        let copy = dup_master(&pair.master).unwrap();
        assert_ne!(copy.as_raw_fd(), pair.master.as_raw_fd());
        assert!(is_cloexec(&copy));
    }
}
