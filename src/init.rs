//! Boot orchestration.
//!
//! Drives the components in order: bootstrap, console, boot announcement,
//! optional sanity checks, then either the handoff chain or the heartbeat
//! loop. The shutdown flag is polled between every step.

use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use tracing::{error, info, warn};

use crate::config::{BootConfig, BootMode};
use crate::console::ConsoleBinder;
use crate::error::ExitCode;
use crate::handoff::{verify_target, Executor, ExecvExecutor, Sequencer, TargetStatus};
use crate::lifecycle::{
    self, announce_to, log_beat, Beat, Clock, Heartbeat, HeartbeatExit, Lifecycle,
    LifecycleState, MonotonicClock, NanoSleeper, Sleeper, BOOT_ANNOUNCED,
};
use crate::marker::MarkerWriter;
use crate::mount::Bootstrapper;
use crate::sanity;
use crate::signals::{ShutdownFlag, SHUTDOWN};

/// How a boot run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<R> {
    /// A handoff candidate replaced the process image
    Replaced(R),
    /// The process should exit with this status
    Exit(i32),
}

/// The early-boot init shim.
pub struct Init {
    config: BootConfig,
    args: Vec<OsString>,
    markers: MarkerWriter,
    lifecycle: Lifecycle,
    bootstrapper: Bootstrapper,
    flag: &'static ShutdownFlag,
    stdout: RawFd,
    announced: &'static AtomicBool,
}

impl Init {
    /// Create the shim. `args` is this process's argv, forwarded to
    /// candidates that ask for it.
    pub fn new(config: BootConfig, args: Vec<OsString>) -> Self {
        let markers = MarkerWriter::new(config.markers.clone());
        Self {
            config,
            args,
            markers,
            lifecycle: Lifecycle::new(),
            bootstrapper: Bootstrapper::new(),
            flag: &SHUTDOWN,
            stdout: libc::STDOUT_FILENO,
            announced: &BOOT_ANNOUNCED,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Run the boot sequence.
    ///
    /// Does not return after a successful handoff. Otherwise returns the
    /// process exit status.
    pub fn run(self) -> i32 {
        match self.run_with(ExecvExecutor, MonotonicClock, NanoSleeper, log_beat) {
            Outcome::Replaced(never) => match never {},
            Outcome::Exit(code) => code,
        }
    }

    /// Run the boot sequence with the given exec, time and beat plumbing.
    pub fn run_with<E, C, S, F>(
        mut self,
        executor: E,
        clock: C,
        sleeper: S,
        emit: F,
    ) -> Outcome<E::Replaced>
    where
        E: Executor,
        C: Clock,
        S: Sleeper,
        F: FnMut(Beat),
    {
        info!(pid = std::process::id(), "wrapper starting");
        self.markers.write("wrapper starting");

        if !self.bootstrap() {
            return Outcome::Exit(self.shutdown());
        }

        ConsoleBinder::new(&self.config.console).bind();
        if self.flag.is_raised() {
            return Outcome::Exit(self.shutdown());
        }

        announce_to(self.announced, self.stdout);
        if let Err(e) = self.lifecycle.transition(LifecycleState::Running) {
            warn!(error = %e, "Unexpected lifecycle state");
        }
        self.markers.write("boot complete");

        if self.config.sanity_checks {
            let failed = sanity::run_checks(&sanity::default_checks());
            if failed > 0 {
                warn!(failed, "Device sanity checks failed");
            }
        }

        match self.config.mode {
            BootMode::Handoff => self.handoff(executor),
            BootMode::Heartbeat => {
                let exit = Heartbeat::new(clock, sleeper, self.config.heartbeat.interval, self.flag)
                    .with_limit(self.config.heartbeat.handoff_after)
                    .run(emit);

                match exit {
                    HeartbeatExit::Shutdown => Outcome::Exit(self.shutdown()),
                    HeartbeatExit::BeatLimit => self.handoff(executor),
                }
            }
        }
    }

    fn bootstrap(&mut self) -> bool {
        self.bootstrapper.mount_all(&self.config.mounts, self.flag)
            && self
                .bootstrapper
                .populate_nodes(&self.config.device_nodes, self.flag)
    }

    fn handoff<E: Executor>(&mut self, executor: E) -> Outcome<E::Replaced> {
        if self.flag.is_raised() {
            return Outcome::Exit(self.shutdown());
        }

        let handoff = &self.config.handoff;
        if handoff.verify_target {
            match verify_target(
                &handoff.target,
                handoff.relocate_from.as_deref(),
                &self.markers,
            ) {
                Ok(TargetStatus::Present) => {}
                Ok(TargetStatus::Repaired) => info!("Init target repaired"),
                Err(e) => {
                    error!(error = %e, "No valid handoff target");
                    return Outcome::Exit(ExitCode::TARGET_UNAVAILABLE);
                }
            }
        }

        let mut sequencer = Sequencer::new(executor, &self.markers);
        match sequencer.handoff(&handoff.candidates, &self.args) {
            Ok(replaced) => Outcome::Replaced(replaced),
            Err(_) => Outcome::Exit(ExitCode::EXHAUSTED),
        }
    }

    fn shutdown(&mut self) -> i32 {
        lifecycle::shutdown(
            &mut self.lifecycle,
            &self.bootstrapper,
            self.flag,
            self.config.heartbeat.grace,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{HandoffCandidate, HandoffError};
    use crate::lifecycle::SleepOutcome;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    static NEVER_RAISED: ShutdownFlag = ShutdownFlag::new();

    /// Succeeds only on `succeed_on`.
    struct ScriptedExecutor {
        succeed_on: Option<PathBuf>,
    }

    impl Executor for ScriptedExecutor {
        type Replaced = PathBuf;

        fn exec(&mut self, path: &Path, _argv: &[OsString]) -> Result<PathBuf, HandoffError> {
            if self.succeed_on.as_deref() == Some(path) {
                Ok(path.to_path_buf())
            } else {
                Err(HandoffError::ExecFailed {
                    path: path.to_path_buf(),
                    errno: nix::Error::ENOENT,
                })
            }
        }
    }

    fn executor(succeed_on: Option<&str>) -> ScriptedExecutor {
        ScriptedExecutor {
            succeed_on: succeed_on.map(PathBuf::from),
        }
    }

    #[derive(Clone, Copy)]
    struct StillClock;

    impl Clock for StillClock {
        fn now(&self) -> Duration {
            Duration::ZERO
        }
    }

    struct InstantSleeper;

    impl Sleeper for InstantSleeper {
        fn sleep(&mut self, _duration: Duration) -> SleepOutcome {
            SleepOutcome::Completed
        }
    }

    /// A config that touches nothing outside `dir`.
    fn create_test_config(dir: &Path) -> BootConfig {
        let mut config = BootConfig::default();
        config.mounts.clear();
        config.device_nodes.clear();
        config.console.path = dir.join("console");
        config.console.attempts = 1;
        config.console.fallbacks.clear();
        config.markers = vec![dir.join("marker.log")];
        config.sanity_checks = false;
        config.heartbeat.grace = Duration::ZERO;
        config.handoff.target = dir.join("init.stock");
        config.handoff.relocate_from = None;
        config.handoff.candidates = vec![
            HandoffCandidate::new("/A", 30).forward_args(),
            HandoffCandidate::new("/B", 20).with_argv(&["sh"]),
        ];
        config
    }

    /// Build an init whose announcement goes to `stdout` under a fresh guard.
    fn create_test_init(config: BootConfig, stdout: RawFd) -> Init {
        let mut init = Init::new(config, vec![OsString::from("/init")]);
        init.flag = &NEVER_RAISED;
        init.stdout = stdout;
        init.announced = Box::leak(Box::new(AtomicBool::new(false)));
        init
    }

    #[test]
    fn test_missing_target_exits_126_with_marker() {
        let dir = TempDir::new().unwrap();
        let stdout = tempfile::tempfile().unwrap();
        let init = create_test_init(create_test_config(dir.path()), stdout.as_raw_fd());

        let outcome = init.run_with(executor(Some("/A")), StillClock, InstantSleeper, |_| {});

        assert_eq!(outcome, Outcome::Exit(ExitCode::TARGET_UNAVAILABLE));
        let markers = std::fs::read_to_string(dir.path().join("marker.log")).unwrap();
        assert!(markers.contains("missing and no relocation source"));
        assert!(!markers.contains("handing off"));
    }

    #[test]
    fn test_exhausted_chain_exits_127() {
        let dir = TempDir::new().unwrap();
        let stdout = tempfile::tempfile().unwrap();
        let mut config = create_test_config(dir.path());
        config.handoff.verify_target = false;
        let init = create_test_init(config, stdout.as_raw_fd());

        let outcome = init.run_with(executor(None), StillClock, InstantSleeper, |_| {});

        assert_eq!(outcome, Outcome::Exit(ExitCode::EXHAUSTED));
        let markers = std::fs::read_to_string(dir.path().join("marker.log")).unwrap();
        assert!(markers.contains("all 2 handoff candidates exhausted"));
    }

    #[test]
    fn test_announcement_precedes_heartbeats() {
        let dir = TempDir::new().unwrap();
        let stdout_path = dir.path().join("stdout");
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stdout_path)
            .unwrap();

        let mut config = create_test_config(dir.path());
        config.mode = BootMode::Heartbeat;
        config.heartbeat.handoff_after = Some(2);
        config.handoff.verify_target = false;
        let init = create_test_init(config, stdout.as_raw_fd());

        let mut beat_out = stdout.try_clone().unwrap();
        let outcome = init.run_with(executor(Some("/B")), StillClock, InstantSleeper, |beat| {
            writeln!(beat_out, "beat {}", beat.seq).unwrap();
        });

        assert_eq!(outcome, Outcome::Replaced(PathBuf::from("/B")));
        let content = std::fs::read_to_string(&stdout_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec!["VIRTUAL_DEVICE_BOOT_COMPLETED", "beat 1", "beat 2"]
        );
    }
}
