//! Agent configuration.

use std::time::Duration;

pub use rtdbg_proto::BUFFER_SIZE;

/// How long the session teardown polls between checks of a stopping task.
pub const POLL_WAIT: Duration = Duration::from_millis(10);

/// How long the session teardown waits for the events task to finish.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Name of the server task.
pub const SERVER_TASK: &str = "DBSs";

/// Name of the events task.
pub const EVENTS_TASK: &str = "DBSe";

/// Name of the per-processor helper task.
pub const HELPER_TASK: &str = "Tcpu";

/// Options for [`crate::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    /// Registered transport name.
    pub remote: String,
    /// Transport device, for example a TCP port.
    pub device: String,
    /// Priority of the agent's tasks.
    pub priority: u32,
    /// Transport read timeout. An unacknowledged reply is resent each time
    /// it expires.
    pub timeout: Duration,
    /// Process id reported to the debugger instead of the kernel's.
    pub pid: Option<u32>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            remote: "tcp".to_string(),
            device: "1122".to_string(),
            priority: 1,
            timeout: Duration::from_secs(1),
            pid: None,
        }
    }
}
