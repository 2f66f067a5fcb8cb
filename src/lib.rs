//! cf-init - early-boot PID 1 shim for virtual devices.
//!
//! This crate owns the interval between the kernel starting PID 1 and the
//! real init taking over. It:
//!
//! - Mounts `/dev`, `/proc` and `/sys` idempotently and creates fallback
//!   device nodes when devtmpfs has not provided them
//! - Logs every line to the kernel log, the console and its own stdio,
//!   independently, so whichever sink exists receives it
//! - Binds a console with bounded retry and a serial fallback
//! - Announces `VIRTUAL_DEVICE_BOOT_COMPLETED` on stdout exactly once
//! - Leaves persistent markers for post-mortem diagnosis
//! - Either chain-loads the real init through a prioritized fallback list
//!   or keeps control and emits heartbeats until a termination signal
//!
//! # Architecture
//!
//! - **Init**: drives the boot sequence
//! - **Bootstrapper**: mounts and device nodes
//! - **Journal**: multi-channel logger, also installed as a tracing layer
//! - **ConsoleBinder**: console acquisition and stdio rebinding
//! - **Heartbeat** / **Lifecycle**: liveness loop, state machine, teardown
//! - **Sequencer**: ordered exec handoff
//!
//! # Example
//!
//! ```no_run
//! use cf_init::{BootConfig, Init};
//!
//! let config = BootConfig::load().ok().flatten().unwrap_or_default();
//! let args = std::env::args_os().collect();
//! std::process::exit(Init::new(config, args).run());
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod handoff;
pub mod init;
pub mod journal;
pub mod lifecycle;
pub mod marker;
pub mod mount;
pub mod sanity;
pub mod signals;

// Re-export main types
pub use config::{BootConfig, BootMode};
pub use console::ConsoleBinder;
pub use error::{Error, ExitCode, Result};
pub use handoff::{Executor, ExecvExecutor, Exhausted, HandoffCandidate, HandoffError, Sequencer};
pub use init::{Init, Outcome};
pub use journal::{Channel, Journal, JournalLayer};
pub use lifecycle::{Heartbeat, HeartbeatExit, Lifecycle, LifecycleState, BOOT_COMPLETED};
pub use marker::{Marker, MarkerWriter};
pub use mount::{
    ensure_device_node, mount_once, Bootstrapper, DeviceNode, MountError, MountOutcome, MountSpec,
    NodeError, NodeOutcome,
};
pub use signals::{ShutdownFlag, SHUTDOWN};
