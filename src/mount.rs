//! Pseudo-filesystem mounting and fallback device nodes.
//!
//! Every operation here is idempotent: re-running the bootstrap against an
//! environment that is already (partially) set up converges on the same
//! state and reports success for the parts that were already in place.

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use serde::{Deserialize, Serialize};
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::signals::ShutdownFlag;

/// Mount flag names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountFlag {
    /// Do not honour device files
    NoDev,
    /// Do not allow program execution
    NoExec,
    /// Ignore set-user-ID and set-group-ID bits
    NoSuid,
    /// Do not update access times
    NoAtime,
}

impl From<MountFlag> for MsFlags {
    fn from(flag: MountFlag) -> Self {
        match flag {
            MountFlag::NoDev => MsFlags::MS_NODEV,
            MountFlag::NoExec => MsFlags::MS_NOEXEC,
            MountFlag::NoSuid => MsFlags::MS_NOSUID,
            MountFlag::NoAtime => MsFlags::MS_NOATIME,
        }
    }
}

/// One pseudo-filesystem to mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Mount source (for pseudo-filesystems, a descriptive name)
    pub source: String,
    /// Mount point
    pub target: PathBuf,
    /// Filesystem type
    pub fstype: String,
    #[serde(default)]
    pub flags: Vec<MountFlag>,
    /// Filesystem-specific data, e.g. `mode=0755`
    #[serde(default)]
    pub options: Option<String>,
}

impl MountSpec {
    pub fn new(source: impl Into<String>, target: impl Into<PathBuf>, fstype: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
            flags: Vec::new(),
            options: None,
        }
    }

    pub fn with_flags(mut self, flags: &[MountFlag]) -> Self {
        self.flags.extend_from_slice(flags);
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Combined kernel mount flags.
    pub fn ms_flags(&self) -> MsFlags {
        self.flags
            .iter()
            .fold(MsFlags::empty(), |acc, flag| acc | MsFlags::from(*flag))
    }
}

/// A character device entry to create when devtmpfs has not provided it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub path: PathBuf,
    /// Permission bits
    pub mode: u32,
    pub major: u64,
    pub minor: u64,
}

impl DeviceNode {
    pub fn char_device(path: impl Into<PathBuf>, mode: u32, major: u64, minor: u64) -> Self {
        Self {
            path: path.into(),
            mode,
            major,
            minor,
        }
    }
}

/// Successful mount outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// The filesystem was mounted by this call
    Mounted,
    /// Something was already mounted there (or the target is busy)
    AlreadyMounted,
}

/// Successful device node outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Created,
    /// A node already existed; it was left untouched
    Existing,
}

/// Mount failures.
#[derive(Error, Debug)]
pub enum MountError {
    /// Mount point could not be created
    #[error("mkdir({target}) failed: {source}")]
    Directory {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The kernel does not know this filesystem type
    #[error("mount({fstype} -> {target}) unsupported by kernel")]
    Unsupported { fstype: String, target: PathBuf },

    /// Any other mount failure
    #[error("mount({fstype} -> {target}) failed: {errno}")]
    Failed {
        fstype: String,
        target: PathBuf,
        errno: Errno,
    },
}

/// Device node failures.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Parent directory could not be created
    #[error("mkdir({path}) failed: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("mknod({path}) failed: {errno}")]
    Create { path: PathBuf, errno: Errno },
}

/// Create a directory (and parents) with mode 0755; existing is fine.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    DirBuilder::new().recursive(true).mode(0o755).create(path)
}

/// Mount `spec`, treating an existing or busy mount as success.
pub fn mount_once(spec: &MountSpec) -> Result<MountOutcome, MountError> {
    ensure_dir(&spec.target).map_err(|source| MountError::Directory {
        target: spec.target.clone(),
        source,
    })?;

    let result = mount(
        Some(spec.source.as_str()),
        spec.target.as_path(),
        Some(spec.fstype.as_str()),
        spec.ms_flags(),
        spec.options.as_deref(),
    );

    match result {
        Ok(()) => Ok(MountOutcome::Mounted),
        Err(errno) => classify_mount_errno(spec, errno),
    }
}

/// Map a failed mount(2) to an outcome.
pub fn classify_mount_errno(spec: &MountSpec, errno: Errno) -> Result<MountOutcome, MountError> {
    match errno {
        Errno::EBUSY | Errno::EEXIST => Ok(MountOutcome::AlreadyMounted),
        Errno::ENODEV => Err(MountError::Unsupported {
            fstype: spec.fstype.clone(),
            target: spec.target.clone(),
        }),
        errno => Err(MountError::Failed {
            fstype: spec.fstype.clone(),
            target: spec.target.clone(),
            errno,
        }),
    }
}

/// Create `node` unless something already exists at its path.
pub fn ensure_device_node(node: &DeviceNode) -> Result<NodeOutcome, NodeError> {
    if node.path.symlink_metadata().is_ok() {
        return Ok(NodeOutcome::Existing);
    }

    if let Some(parent) = node.path.parent() {
        ensure_dir(parent).map_err(|source| NodeError::Directory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let result = mknod(
        node.path.as_path(),
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(node.mode),
        makedev(node.major, node.minor),
    );

    match result {
        Ok(()) => Ok(NodeOutcome::Created),
        // devtmpfs populated it between the check and the mknod
        Err(Errno::EEXIST) => Ok(NodeOutcome::Existing),
        Err(errno) => Err(NodeError::Create {
            path: node.path.clone(),
            errno,
        }),
    }
}

/// Lazily detach a mount. Returns false when nothing was mounted there.
pub fn unmount_detached(target: &Path) -> nix::Result<bool> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(true),
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(false),
        Err(errno) => Err(errno),
    }
}

/// Runs the mount and device-node steps, remembering mount order so that
/// teardown can reverse it.
#[derive(Debug, Default)]
pub struct Bootstrapper {
    attempted: Vec<PathBuf>,
}

impl Bootstrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount every spec in order, best effort.
    ///
    /// Returns false if a shutdown was requested before all mounts were
    /// attempted.
    pub fn mount_all(&mut self, specs: &[MountSpec], shutdown: &ShutdownFlag) -> bool {
        for spec in specs {
            if shutdown.is_raised() {
                warn!(mount_point = %spec.target.display(), "Shutdown requested, stopping bootstrap");
                return false;
            }

            self.attempted.push(spec.target.clone());
            match mount_once(spec) {
                Ok(MountOutcome::Mounted) => {
                    info!(fstype = %spec.fstype, mount_point = %spec.target.display(), "Mounted")
                }
                Ok(MountOutcome::AlreadyMounted) => {
                    debug!(fstype = %spec.fstype, mount_point = %spec.target.display(), "Already mounted")
                }
                Err(e @ MountError::Unsupported { .. }) => warn!(error = %e, "Skipping mount"),
                Err(e) => error!(error = %e, "Mount failed"),
            }
        }
        true
    }

    /// Create fallback device nodes, best effort.
    pub fn populate_nodes(&self, nodes: &[DeviceNode], shutdown: &ShutdownFlag) -> bool {
        for node in nodes {
            if shutdown.is_raised() {
                return false;
            }

            match ensure_device_node(node) {
                Ok(NodeOutcome::Created) => info!(
                    path = %node.path.display(),
                    major = node.major,
                    minor = node.minor,
                    "Created fallback device node"
                ),
                Ok(NodeOutcome::Existing) => {
                    debug!(path = %node.path.display(), "Device node present")
                }
                Err(e) => error!(error = %e, "Device node creation failed"),
            }
        }
        true
    }

    /// Mount points in the order they were attempted.
    pub fn mounted(&self) -> &[PathBuf] {
        &self.attempted
    }

    /// Detach everything this bootstrapper mounted, newest first.
    pub fn teardown(&self) {
        for target in self.teardown_order() {
            match unmount_detached(target) {
                Ok(true) => info!(mount_point = %target.display(), "Unmounted"),
                Ok(false) => debug!(mount_point = %target.display(), "Nothing mounted"),
                Err(e) => warn!(mount_point = %target.display(), error = %e, "Unmount failed"),
            }
        }
    }

    /// Strict reverse of mount order.
    pub fn teardown_order(&self) -> impl Iterator<Item = &Path> {
        self.attempted.iter().rev().map(PathBuf::as_path)
    }
}
