//! Lifecycle control: state machine, boot announcement, heartbeat loop and
//! teardown.

use nix::errno::Errno;
use nix::time::{clock_gettime, ClockId};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, ExitCode, Result};
use crate::journal::sink::write_all_fd;
use crate::mount::Bootstrapper;
use crate::signals::ShutdownFlag;

/// Line the external test harness waits for on stdout.
pub const BOOT_COMPLETED: &str = "VIRTUAL_DEVICE_BOOT_COMPLETED";

pub(crate) static BOOT_ANNOUNCED: AtomicBool = AtomicBool::new(false);

/// Lifecycle of the shim process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Bootstrapping the environment
    Starting,
    /// Boot announced, heartbeating or handing off
    Running,
    /// Termination signal received, tearing down
    ShuttingDown,
    /// Teardown finished
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::ShuttingDown => write!(f, "shutting-down"),
            LifecycleState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Forward-only state holder.
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Starting,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Move to `to`, rejecting anything but the next forward step.
    pub fn transition(&mut self, to: LifecycleState) -> Result<()> {
        use LifecycleState::*;

        let allowed = matches!(
            (self.state, to),
            (Starting, Running)
                | (Starting, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Terminated)
        );
        if !allowed {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }

        debug!(from = %self.state, to = %to, "Lifecycle transition");
        self.state = to;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the boot-complete line to stdout, once per process.
///
/// Returns false if it was already written.
pub fn announce_boot_complete() -> bool {
    announce_to(&BOOT_ANNOUNCED, libc::STDOUT_FILENO)
}

/// Write the boot-complete line to `fd` unless `announced` is already set.
pub fn announce_to(announced: &AtomicBool, fd: RawFd) -> bool {
    if announced.swap(true, Ordering::SeqCst) {
        return false;
    }
    if let Err(e) = write_all_fd(fd, format!("{}\n", BOOT_COMPLETED).as_bytes()) {
        warn!(error = %e, "Failed to write boot-complete line");
    }
    true
}

/// Monotonic time source.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// `CLOCK_MONOTONIC`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32),
            Err(_) => Duration::ZERO,
        }
    }
}

/// Result of a single sleep call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Completed,
    /// A signal cut the sleep short with `remaining` left
    Interrupted { remaining: Duration },
}

/// Blocking sleep that reports interruption.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration) -> SleepOutcome;
}

/// `nanosleep(2)`; interruption yields the kernel-computed remainder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NanoSleeper;

impl Sleeper for NanoSleeper {
    fn sleep(&mut self, duration: Duration) -> SleepOutcome {
        let request = libc::timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        };
        let mut remaining = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // SAFETY: both pointers reference live stack values.
        let rc = unsafe { libc::nanosleep(&request, &mut remaining) };
        if rc == 0 || Errno::last() != Errno::EINTR {
            return SleepOutcome::Completed;
        }
        SleepOutcome::Interrupted {
            remaining: Duration::new(remaining.tv_sec as u64, remaining.tv_nsec as u32),
        }
    }
}

/// Sleep for the whole of `duration`, resuming with exactly the remainder
/// after each interruption. Returns the number of interruptions.
pub fn sleep_full<S: Sleeper>(sleeper: &mut S, duration: Duration) -> u32 {
    let mut remaining = duration;
    let mut interruptions = 0;
    loop {
        match sleeper.sleep(remaining) {
            SleepOutcome::Completed => return interruptions,
            SleepOutcome::Interrupted { remaining: left } => {
                interruptions += 1;
                if left.is_zero() {
                    return interruptions;
                }
                remaining = left;
            }
        }
    }
}

/// One emitted heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beat {
    /// 1-based beat number
    pub seq: u64,
    /// Monotonic timestamp
    pub at: Duration,
}

/// Why the heartbeat loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// A termination signal was observed
    Shutdown,
    /// The configured beat count was reached
    BeatLimit,
}

/// Periodic liveness emitter.
pub struct Heartbeat<'a, C: Clock, S: Sleeper> {
    clock: C,
    sleeper: S,
    interval: Duration,
    limit: Option<u32>,
    shutdown: &'a ShutdownFlag,
}

impl<'a, C: Clock, S: Sleeper> Heartbeat<'a, C, S> {
    pub fn new(clock: C, sleeper: S, interval: Duration, shutdown: &'a ShutdownFlag) -> Self {
        Self {
            clock,
            sleeper,
            interval,
            limit: None,
            shutdown,
        }
    }

    /// Stop after `beats` heartbeats.
    pub fn with_limit(mut self, beats: Option<u32>) -> Self {
        self.limit = beats;
        self
    }

    /// Emit heartbeats until shutdown or the beat limit.
    ///
    /// The flag is polled before each beat and again before each sleep. A
    /// signal that lands mid-sleep is only seen once the remainder of the
    /// interval has been slept, so shutdown can lag by up to one interval.
    pub fn run<F: FnMut(Beat)>(&mut self, mut emit: F) -> HeartbeatExit {
        let mut seq = 0u64;
        loop {
            if self.shutdown.is_raised() {
                return HeartbeatExit::Shutdown;
            }

            seq += 1;
            emit(Beat {
                seq,
                at: self.clock.now(),
            });

            if self.limit.is_some_and(|limit| seq >= u64::from(limit)) {
                return HeartbeatExit::BeatLimit;
            }
            if self.shutdown.is_raised() {
                return HeartbeatExit::Shutdown;
            }

            let interruptions = sleep_full(&mut self.sleeper, self.interval);
            if interruptions > 0 {
                debug!(interruptions, "Heartbeat sleep resumed after signal");
            }
        }
    }
}

/// Log a heartbeat through tracing.
pub fn log_beat(beat: Beat) {
    info!(
        "[cf-heartbeat] {}.{:03} seq={}",
        beat.at.as_secs(),
        beat.at.subsec_millis(),
        beat.seq
    );
}

/// Ordered teardown: detach mounts newest-first, wait out the grace delay
/// and report the exit status.
pub fn shutdown(
    lifecycle: &mut Lifecycle,
    bootstrapper: &Bootstrapper,
    flag: &ShutdownFlag,
    grace: Duration,
) -> i32 {
    if lifecycle.state() != LifecycleState::ShuttingDown {
        if let Err(e) = lifecycle.transition(LifecycleState::ShuttingDown) {
            warn!(error = %e, "Unexpected lifecycle state at shutdown");
        }
    }

    match flag.signal() {
        Some(signal) => info!(signal = %signal, "Shutting down"),
        None => info!("Shutting down"),
    }

    bootstrapper.teardown();
    std::thread::sleep(grace);

    if let Err(e) = lifecycle.transition(LifecycleState::Terminated) {
        warn!(error = %e, "Unexpected lifecycle state at exit");
    }
    ExitCode::OK
}
