//! Signal handling.
//!
//! The termination handler only stores the signal number in a single
//! atomic word. All reactions (logging, unmounting, exiting) happen on the
//! main path, which polls the flag between steps.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};

/// Signals that request an orderly shutdown.
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGHUP, Signal::SIGTERM];

/// Process-wide shutdown flag written by the signal handler.
pub static SHUTDOWN: ShutdownFlag = ShutdownFlag::new();

/// A single-word flag holding the number of the first termination signal
/// received (0 while unset).
#[derive(Debug)]
pub struct ShutdownFlag(AtomicI32);

impl ShutdownFlag {
    pub const fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    /// Record a shutdown request. Async-signal-safe.
    pub fn raise(&self, signal: i32) {
        let _ = self
            .0
            .compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }

    /// The signal that raised the flag, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

extern "C" fn on_termination(signal: libc::c_int) {
    SHUTDOWN.raise(signal);
}

/// Ignore SIGPIPE and route termination signals to [`SHUTDOWN`].
///
/// No `SA_RESTART`: blocking sleeps must return `EINTR` so the caller can
/// account for the time already slept.
pub fn install() -> Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: SIG_IGN installs no code.
    unsafe { sigaction(Signal::SIGPIPE, &ignore) }
        .map_err(|e| Error::SignalError(format!("SIGPIPE: {}", e)))?;

    let mut mask = SigSet::empty();
    for signal in TERMINATION_SIGNALS {
        mask.add(signal);
    }
    let action = SigAction::new(SigHandler::Handler(on_termination), SaFlags::empty(), mask);

    for signal in TERMINATION_SIGNALS {
        // SAFETY: the handler only performs an atomic store.
        unsafe { sigaction(signal, &action) }
            .map_err(|e| Error::SignalError(format!("{}: {}", signal, e)))?;
    }

    Ok(())
}

/// Put every signal this process touched back to its default disposition.
///
/// An ignored disposition survives `execv`, so this runs right before the
/// exec to keep the next init from inheriting an ignored SIGPIPE.
pub fn restore_defaults() -> Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in std::iter::once(Signal::SIGPIPE).chain(TERMINATION_SIGNALS) {
        // SAFETY: SIG_DFL installs no code.
        unsafe { sigaction(signal, &default) }
            .map_err(|e| Error::SignalError(format!("{}: {}", signal, e)))?;
    }
    Ok(())
}
