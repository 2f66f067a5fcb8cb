//! Console acquisition.
//!
//! Opens the console (retrying while devtmpfs settles), falls back to a
//! serial device, makes it the controlling terminal and rebinds stdio to it.
//! Failing to find any console is degraded, not fatal: the kernel log
//! channel keeps working without one.

use nix::unistd::{close, dup2, getpid, getsid, setsid};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ConsoleConfig;

/// Binds the process's standard streams to a console device.
#[derive(Debug, Clone)]
pub struct ConsoleBinder {
    primary: PathBuf,
    attempts: u32,
    retry_delay: Duration,
    fallbacks: Vec<PathBuf>,
}

impl ConsoleBinder {
    pub fn new(config: &ConsoleConfig) -> Self {
        Self {
            primary: config.path.clone(),
            attempts: config.attempts.max(1),
            retry_delay: config.retry_delay,
            fallbacks: config.fallbacks.clone(),
        }
    }

    /// Open the first available console device.
    ///
    /// The primary device gets the full retry budget; each fallback is tried
    /// once.
    pub fn acquire(&self) -> Option<(PathBuf, File)> {
        if let Some(file) = open_with_retry(&self.primary, self.attempts, self.retry_delay) {
            return Some((self.primary.clone(), file));
        }
        warn!(
            path = %self.primary.display(),
            attempts = self.attempts,
            "Console unavailable, trying fallbacks"
        );

        self.fallbacks
            .iter()
            .find_map(|path| open_console(path).ok().map(|file| (path.clone(), file)))
    }

    /// Acquire a console and make it stdin/stdout/stderr.
    ///
    /// Returns false when no console could be bound; the caller carries on.
    pub fn bind(&self) -> bool {
        let Some((path, file)) = self.acquire() else {
            warn!("No console bound, continuing with kernel log only");
            return false;
        };

        match attach(file) {
            Ok(()) => {
                // stdio writes in this crate go straight to the descriptors;
                // flush anything std buffered before the rebind.
                let _ = io::stdout().flush();
                let _ = io::stderr().flush();
                info!(path = %path.display(), "Console bound");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to rebind stdio to console");
                false
            }
        }
    }
}

/// Open a console device read-write without implicitly acquiring it as the
/// controlling terminal.
pub fn open_console(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
}

/// Try to open `path` up to `attempts` times, sleeping `delay` in between.
pub fn open_with_retry(path: &Path, attempts: u32, delay: Duration) -> Option<File> {
    for attempt in 1..=attempts {
        match open_console(path) {
            Ok(file) => {
                debug!(path = %path.display(), attempt, "Opened console");
                return Some(file);
            }
            Err(e) if attempt == attempts => {
                debug!(path = %path.display(), error = %e, "Giving up on console");
            }
            Err(_) => thread::sleep(delay),
        }
    }
    None
}

/// Make `file` the controlling terminal and duplicate it onto fds 0-2.
fn attach(file: File) -> nix::Result<()> {
    let fd = file.into_raw_fd();

    if let Err(e) = become_session_leader() {
        debug!(error = %e, "setsid failed");
    }
    set_controlling_tty(fd);
    let result = rebind_stdio(fd);

    // The console may have landed on a standard slot if stdio was closed.
    if fd > libc::STDERR_FILENO {
        let _ = close(fd);
    }
    result
}

fn become_session_leader() -> nix::Result<()> {
    let pid = getpid();
    if getsid(None)? != pid {
        setsid()?;
    }
    Ok(())
}

fn set_controlling_tty(fd: RawFd) {
    // SAFETY: TIOCSCTTY takes an integer argument and no pointers.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) };
    if rc == -1 {
        // Not every console is a tty (e.g. some virtio consoles); stdio
        // rebinding still makes it usable.
        debug!(error = %nix::Error::last(), "TIOCSCTTY failed");
    }
}

fn rebind_stdio(fd: RawFd) -> nix::Result<()> {
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if fd != target {
            dup2(fd, target)?;
        }
    }
    Ok(())
}
