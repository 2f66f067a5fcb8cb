//! Post-bootstrap device checks.
//!
//! Purely diagnostic: each result is logged and nothing here can stop the
//! boot.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What a checked path is expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    CharDevice,
    Exists,
}

/// One path to check.
#[derive(Debug, Clone)]
pub struct DeviceCheck {
    pub path: PathBuf,
    pub expect: Expect,
}

impl DeviceCheck {
    pub fn new(path: impl Into<PathBuf>, expect: Expect) -> Self {
        Self {
            path: path.into(),
            expect,
        }
    }

    /// Whether the path currently satisfies the expectation.
    pub fn passes(&self) -> bool {
        check_path(&self.path, self.expect)
    }
}

fn check_path(path: &Path, expect: Expect) -> bool {
    match (std::fs::metadata(path), expect) {
        (Ok(meta), Expect::CharDevice) => meta.file_type().is_char_device(),
        (Ok(_), Expect::Exists) => true,
        (Err(_), _) => false,
    }
}

/// The checks run after console binding.
pub fn default_checks() -> Vec<DeviceCheck> {
    vec![
        DeviceCheck::new("/dev/console", Expect::CharDevice),
        DeviceCheck::new("/dev/kmsg", Expect::CharDevice),
        DeviceCheck::new("/dev/null", Expect::CharDevice),
        DeviceCheck::new("/proc/self", Expect::Exists),
    ]
}

/// Run and log every check. Returns the number that failed.
pub fn run_checks(checks: &[DeviceCheck]) -> usize {
    checks
        .iter()
        .filter(|check| {
            let ok = check.passes();
            if ok {
                info!(path = %check.path.display(), "Device check passed");
            } else {
                warn!(path = %check.path.display(), expect = ?check.expect, "Device check failed");
            }
            !ok
        })
        .count()
}
