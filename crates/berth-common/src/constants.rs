//! System-wide constants and default paths.

use std::time::Duration;

/// Default root directory holding one state directory per container.
pub const DEFAULT_ROOT: &str = "/run/berth";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Parent cgroup under which container cgroups are created.
pub const DEFAULT_CGROUP_PARENT: &str = "berth";

/// Name of the persisted state snapshot inside a container directory.
pub const STATE_FILENAME: &str = "state.json";

/// Name of the exec-gate FIFO inside a container directory.
pub const EXEC_FIFO_FILENAME: &str = "exec.fifo";

/// Permission bits of the exec-gate FIFO.
pub const EXEC_FIFO_MODE: u32 = 0o622;

/// Permission bits of a container state directory.
pub const STATE_DIR_MODE: u32 = 0o711;

/// Interval between liveness probes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of liveness probes after SIGKILL before giving up (~10 seconds).
pub const KILL_RETRIES: u32 = 100;

/// Name of the hidden subcommand that selects the companion entry point.
pub const INIT_SUBCOMMAND: &str = "init";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "berth";

/// OCI runtime-spec version reported in hook state.
pub const OCI_VERSION: &str = "1.2.0";
