//! Handoff to the real init.
//!
//! Candidates are exec'd strictly in priority order. A successful exec
//! replaces the process image, so the real executor's success type is
//! uninhabited: any value that comes back is a failure of that candidate,
//! and the sequencer moves on to the next one.

use nix::unistd::execv;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::marker::MarkerWriter;
use crate::signals;

/// A program the shim may exec into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffCandidate {
    /// Executable path
    pub path: PathBuf,
    /// Argument vector used when not forwarding
    #[serde(default)]
    pub argv: Vec<String>,
    /// Higher runs first
    #[serde(default)]
    pub priority: u32,
    /// Pass this process's own argv through verbatim
    #[serde(default)]
    pub forward_args: bool,
}

impl HandoffCandidate {
    pub fn new(path: impl Into<PathBuf>, priority: u32) -> Self {
        Self {
            path: path.into(),
            argv: Vec::new(),
            priority,
            forward_args: false,
        }
    }

    pub fn with_argv(mut self, argv: &[&str]) -> Self {
        self.argv = argv.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn forward_args(mut self) -> Self {
        self.forward_args = true;
        self
    }

    /// The argv to exec with, given this process's own argv.
    pub fn resolve_argv(&self, process_args: &[OsString]) -> Vec<OsString> {
        if self.forward_args && !process_args.is_empty() {
            return process_args.to_vec();
        }
        if !self.argv.is_empty() {
            return self.argv.iter().map(OsString::from).collect();
        }
        let argv0 = self
            .path
            .file_name()
            .unwrap_or(self.path.as_os_str())
            .to_os_string();
        vec![argv0]
    }
}

/// Order candidates highest priority first; ties keep configuration order.
pub fn ordered(candidates: &[HandoffCandidate]) -> Vec<&HandoffCandidate> {
    let mut ordered: Vec<&HandoffCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
    ordered
}

/// Handoff failures.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// The target is missing and there is nothing to relocate
    #[error("init target {0} missing and no relocation source")]
    TargetMissing(PathBuf),

    /// The target exists but cannot be executed
    #[error("init target {0} is not an executable file")]
    NotExecutable(PathBuf),

    /// Renaming the original init into place failed
    #[error("rename({from} -> {target}) failed: {source}")]
    RepairFailed {
        from: PathBuf,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Path or argument contains an interior NUL byte
    #[error("invalid argument for {0}: interior NUL byte")]
    InvalidArgument(PathBuf),

    /// execv returned
    #[error("execv({path}) failed: {errno}")]
    ExecFailed { path: PathBuf, errno: nix::Error },
}

/// Every candidate failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("all {attempted} handoff candidates exhausted")]
pub struct Exhausted {
    pub attempted: usize,
}

/// State of the real init target after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Present,
    /// Relocated into place by this call
    Repaired,
}

fn is_executable(path: &Path) -> Option<bool> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
}

/// Make sure the real init sits at `target`, relocating `relocate_from`
/// into place once if it does not.
pub fn verify_target(
    target: &Path,
    relocate_from: Option<&Path>,
    markers: &MarkerWriter,
) -> Result<TargetStatus, HandoffError> {
    let unusable = |err: HandoffError| -> Result<TargetStatus, HandoffError> {
        markers.write(&err.to_string());
        Err(err)
    };

    match is_executable(target) {
        Some(true) => return Ok(TargetStatus::Present),
        Some(false) => return unusable(HandoffError::NotExecutable(target.to_path_buf())),
        None => {}
    }

    let Some(from) = relocate_from else {
        return unusable(HandoffError::TargetMissing(target.to_path_buf()));
    };

    info!(
        target_path = %target.display(),
        from = %from.display(),
        "Init target missing, relocating original init"
    );
    match std::fs::rename(from, target) {
        Ok(()) => {
            info!(target_path = %target.display(), "Relocated original init");
            markers.write(&format!(
                "rename({} -> {}) ok",
                from.display(),
                target.display()
            ));
            Ok(TargetStatus::Repaired)
        }
        Err(source) => {
            let err = HandoffError::RepairFailed {
                from: from.to_path_buf(),
                target: target.to_path_buf(),
                source,
            };
            error!(error = %err, "Init target repair failed");
            markers.write(&format!(
                "rename({} -> {}) failed",
                from.display(),
                target.display()
            ));
            Err(err)
        }
    }
}

/// Replaces the process image.
pub trait Executor {
    /// What a successful exec yields. Uninhabited for a real exec.
    type Replaced;

    fn exec(&mut self, path: &Path, argv: &[OsString]) -> Result<Self::Replaced, HandoffError>;
}

/// `execv(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecvExecutor;

impl Executor for ExecvExecutor {
    type Replaced = Infallible;

    fn exec(&mut self, path: &Path, argv: &[OsString]) -> Result<Infallible, HandoffError> {
        let invalid = || HandoffError::InvalidArgument(path.to_path_buf());
        let path_c = to_cstring(path.as_os_str()).ok_or_else(invalid)?;
        let argv_c = argv
            .iter()
            .map(|arg| to_cstring(arg))
            .collect::<Option<Vec<CString>>>()
            .ok_or_else(invalid)?;

        // An ignored SIGPIPE survives execv, so dispositions are default only
        // for the duration of the call.
        if let Err(e) = signals::restore_defaults() {
            warn!(error = %e, "Failed to restore signal dispositions");
        }
        let errno = match execv(&path_c, &argv_c) {
            Ok(never) => match never {},
            Err(errno) => errno,
        };
        if let Err(e) = signals::install() {
            warn!(error = %e, "Failed to reinstall signal handlers");
        }

        Err(HandoffError::ExecFailed {
            path: path.to_path_buf(),
            errno,
        })
    }
}

fn to_cstring(s: &OsStr) -> Option<CString> {
    CString::new(s.as_bytes()).ok()
}

/// Walks the candidate chain.
pub struct Sequencer<'a, E: Executor> {
    executor: E,
    markers: &'a MarkerWriter,
}

impl<'a, E: Executor> Sequencer<'a, E> {
    pub fn new(executor: E, markers: &'a MarkerWriter) -> Self {
        Self { executor, markers }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Try each candidate in priority order until one replaces the process.
    pub fn handoff(
        &mut self,
        candidates: &[HandoffCandidate],
        process_args: &[OsString],
    ) -> Result<E::Replaced, Exhausted> {
        let ordered = ordered(candidates);
        for candidate in &ordered {
            let path = candidate.path.display();
            let argv = candidate.resolve_argv(process_args);

            info!(path = %path, argc = argv.len(), "Handing off");
            self.markers.write(&format!("handing off to {}", path));

            match self.executor.exec(&candidate.path, &argv) {
                Ok(replaced) => return Ok(replaced),
                Err(e) => {
                    warn!(error = %e, "Handoff candidate failed");
                    self.markers.write(&e.to_string());
                }
            }
        }

        let exhausted = Exhausted {
            attempted: ordered.len(),
        };
        error!(error = %exhausted, "No init to hand off to");
        self.markers.write(&exhausted.to_string());
        Err(exhausted)
    }
}
