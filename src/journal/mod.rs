//! Redundant multi-channel logging.
//!
//! During early boot any single log destination may not exist yet: the
//! kernel log device appears with devtmpfs, the console may still be
//! settling, and stdio may be bound to nothing. The journal therefore
//! formats each message once and offers it to every sink independently.
//! A failing sink is counted and skipped; it never stops the remaining
//! sinks and never surfaces to the caller.

pub mod layer;
pub mod line;
pub mod sink;

pub use layer::JournalLayer;
pub use line::{BoundedLine, MESSAGE_CAPACITY};
pub use sink::{Channel, DeviceSink, Priority, Sink, StdioSink, PREFIX};

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "CF_INIT_LOG";

/// Fan-out logger over a fixed list of sinks.
pub struct Journal {
    sinks: Vec<Box<dyn Sink>>,
    failures: [AtomicU64; Channel::COUNT],
}

impl Journal {
    /// Create a journal over the given sinks.
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self {
            sinks,
            failures: Default::default(),
        }
    }

    /// The standard early-boot sink set: kernel log, console, stdout, stderr.
    pub fn system(kmsg: &Path, console: &Path) -> Self {
        Self::new(vec![
            Box::new(DeviceSink::kernel_log(kmsg)),
            Box::new(DeviceSink::console(console)),
            Box::new(StdioSink::stdout()),
            Box::new(StdioSink::stderr()),
        ])
    }

    /// Log an informational message on every channel.
    pub fn log(&self, message: &str) {
        self.log_fmt(Priority::Info, format_args!("{}", message));
    }

    /// Format once into a bounded buffer, then deliver at `priority`.
    pub fn log_fmt(&self, priority: Priority, args: fmt::Arguments<'_>) {
        let mut line = BoundedLine::<MESSAGE_CAPACITY>::new();
        let _ = fmt::Write::write_fmt(&mut line, args);
        self.dispatch(priority, line.as_str());
    }

    /// Offer a formatted message to each sink in turn.
    pub(crate) fn dispatch(&self, priority: Priority, message: &str) {
        for sink in &self.sinks {
            if sink.write_line(priority, message).is_err() {
                self.failures[sink.channel().index()].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of failed deliveries on `channel` so far.
    pub fn failures(&self, channel: Channel) -> u64 {
        self.failures[channel.index()].load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels: Vec<Channel> = self.sinks.iter().map(|s| s.channel()).collect();
        f.debug_struct("Journal").field("channels", &channels).finish()
    }
}

/// Install a global tracing subscriber that routes events into `journal`.
///
/// Returns false if a subscriber was already installed; logging setup is
/// never fatal.
pub fn init_tracing(journal: Arc<Journal>) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(JournalLayer::new(journal))
        .try_init()
        .is_ok()
}
