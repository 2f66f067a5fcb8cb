//! Log sinks.
//!
//! Every sink owns its own open/write/close cycle per line. Nothing is
//! cached between lines because during early boot a device may appear (or
//! vanish) at any moment.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg};

use super::line::{BoundedLine, MESSAGE_CAPACITY};

/// Tag written in front of every console and stdio line.
pub const PREFIX: &str = "[cf-init] ";

/// Framed line capacity: priority tag, prefix, message and newline.
const FRAME_CAPACITY: usize = MESSAGE_CAPACITY + 32;

/// A delivery channel for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Kernel log ring buffer (`/dev/kmsg`)
    KernelLog,
    /// Console device (`/dev/console`)
    Console,
    /// Process standard output
    Stdout,
    /// Process standard error
    Stderr,
}

impl Channel {
    /// Number of channels.
    pub const COUNT: usize = 4;

    /// All channels in delivery order.
    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::KernelLog,
        Channel::Console,
        Channel::Stdout,
        Channel::Stderr,
    ];

    /// Stable index for per-channel counters.
    pub fn index(self) -> usize {
        match self {
            Channel::KernelLog => 0,
            Channel::Console => 1,
            Channel::Stdout => 2,
            Channel::Stderr => 3,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::KernelLog => write!(f, "kernel-log"),
            Channel::Console => write!(f, "console-device"),
            Channel::Stdout => write!(f, "process-stdout"),
            Channel::Stderr => write!(f, "process-stderr"),
        }
    }
}

/// Kernel log priority of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Err = 3,
    Warning = 4,
    Info = 6,
    Debug = 7,
}

impl From<tracing::Level> for Priority {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => Priority::Err,
            tracing::Level::WARN => Priority::Warning,
            tracing::Level::INFO => Priority::Info,
            _ => Priority::Debug,
        }
    }
}

/// A destination for log lines.
pub trait Sink: Send + Sync {
    /// The channel this sink delivers to.
    fn channel(&self) -> Channel;

    /// Deliver one already-formatted message. Errors are absorbed by the caller.
    fn write_line(&self, priority: Priority, message: &str) -> io::Result<()>;
}

/// Sink that opens a device path for each line.
///
/// The kernel log flavour prefixes `<N>` so the kernel records the line at
/// the requested priority; the console flavour writes the plain prefix.
pub struct DeviceSink {
    channel: Channel,
    path: PathBuf,
}

impl DeviceSink {
    /// Kernel log sink at `path` (normally `/dev/kmsg`).
    pub fn kernel_log(path: impl Into<PathBuf>) -> Self {
        Self {
            channel: Channel::KernelLog,
            path: path.into(),
        }
    }

    /// Console sink at `path` (normally `/dev/console`).
    pub fn console(path: impl Into<PathBuf>) -> Self {
        Self {
            channel: Channel::Console,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for DeviceSink {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn write_line(&self, priority: Priority, message: &str) -> io::Result<()> {
        let mut frame = BoundedLine::<FRAME_CAPACITY>::new();
        if self.channel == Channel::KernelLog {
            use std::fmt::Write as _;
            let _ = write!(frame, "<{}>", priority as u8);
        }
        frame.push_str(PREFIX);
        frame.push_str(message);
        frame.push_str("\n");

        // O_NOCTTY: logging must never make the console our controlling tty.
        let mut file = OpenOptions::new()
            .append(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(&self.path)?;
        file.write_all(frame.as_bytes())
        // file closes on drop
    }
}

/// Sink that writes straight to one of the process's own descriptors.
///
/// Writes bypass `std::io::stdout()` buffering so a line is on the wire
/// before a following `execv` replaces the process image.
pub struct StdioSink {
    channel: Channel,
    fd: RawFd,
}

impl StdioSink {
    pub fn stdout() -> Self {
        Self {
            channel: Channel::Stdout,
            fd: libc::STDOUT_FILENO,
        }
    }

    pub fn stderr() -> Self {
        Self {
            channel: Channel::Stderr,
            fd: libc::STDERR_FILENO,
        }
    }
}

impl Sink for StdioSink {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn write_line(&self, _priority: Priority, message: &str) -> io::Result<()> {
        // Nothing bound to this slot yet: skip rather than write into the void.
        fcntl(self.fd, FcntlArg::F_GETFD)?;

        let mut frame = BoundedLine::<FRAME_CAPACITY>::new();
        frame.push_str(PREFIX);
        frame.push_str(message);
        frame.push_str("\n");
        write_all_fd(self.fd, frame.as_bytes())
    }
}

/// Write an entire buffer to a raw descriptor, retrying on EINTR.
pub(crate) fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => buf = &buf[n..],
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kernel_log_sink_tags_priority() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kmsg");
        std::fs::File::create(&path).unwrap();

        let sink = DeviceSink::kernel_log(&path);
        sink.write_line(Priority::Info, "wrapper starting").unwrap();
        sink.write_line(Priority::Warning, "mount /sys failed").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "<6>[cf-init] wrapper starting\n<4>[cf-init] mount /sys failed\n"
        );
    }

    #[test]
    fn test_console_sink_plain_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("console");
        std::fs::File::create(&path).unwrap();

        let sink = DeviceSink::console(&path);
        sink.write_line(Priority::Err, "x").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[cf-init] x\n");
    }

    #[test]
    fn test_missing_device_is_an_error() {
        let sink = DeviceSink::console("/nonexistent/cf-init/console");
        assert!(sink.write_line(Priority::Info, "x").is_err());
    }

    #[test]
    fn test_channel_indices_are_distinct() {
        let mut seen = [false; Channel::COUNT];
        for channel in Channel::ALL {
            assert!(!seen[channel.index()]);
            seen[channel.index()] = true;
        }
    }

    #[test]
    fn test_priority_from_level() {
        assert_eq!(Priority::from(tracing::Level::ERROR), Priority::Err);
        assert_eq!(Priority::from(tracing::Level::INFO), Priority::Info);
        assert_eq!(Priority::from(tracing::Level::TRACE), Priority::Debug);
    }
}
