//! rtdbg - in-kernel GDB remote debugging agent
//!
//! The agent runs as a pair of kernel tasks next to the code it debugs. On
//! connect it suspends every task but its own, serves the debugger from
//! that frozen snapshot, and resumes the system when told to continue.
//! Tasks that hit a breakpoint or fault park in [`exception::handle`] until
//! the debugger lets them go.
//!
//! # Example
//!
//! ```ignore
//! use rtdbg::StartOptions;
//!
//! rtdbg::start(StartOptions::default(), target, kernel)?;
//! // ... the debugger connects on port 1122 ...
//! rtdbg::stop()?;
//! ```

pub mod block;
pub mod breakpoints;
mod commands;
pub mod config;
mod cpus;
mod error;
pub mod exception;
pub mod metrics;
pub mod remote;
pub mod server;
pub mod threads;

use std::sync::Arc;

use parking_lot::{Mutex, const_mutex};
use tracing::info;

use rtdbg_target::{Kernel, Target};

pub use config::{BUFFER_SIZE, StartOptions};
pub use error::{Error, Result};
pub use server::Server;

static SERVER: Mutex<Option<Arc<Server>>> = const_mutex(None);

/// Start the agent: open the transport and spawn the server task.
///
/// # Errors
///
/// Fails if an agent is already running, the transport is unknown or cannot
/// be opened, or the server task cannot be spawned.
pub fn start(
    options: StartOptions,
    target: Arc<dyn Target>,
    kernel: Arc<dyn Kernel>,
) -> Result<()> {
    let mut slot = SERVER.lock();
    if slot.as_ref().is_some_and(|server| server.is_running()) {
        return Err(Error::AlreadyActive);
    }
    let remote = remote::find(&options.remote)
        .ok_or_else(|| Error::RemoteNotFound(options.remote.clone()))?;
    remote.begin(&options.device, options.timeout)?;

    let server = Arc::new(Server::new(options, Arc::clone(&remote), target, kernel));
    if let Err(err) = server.launch() {
        remote.end()?;
        return Err(err);
    }
    info!(remote = remote.name(), pid = server.pid(), "debugger started");
    *slot = Some(server);
    Ok(())
}

/// Stop the agent, ending any session and resuming the system.
///
/// # Errors
///
/// Fails if no agent was started or closing the transport failed.
pub fn stop() -> Result<()> {
    // Trap paths look the server up; do not hold the slot while tearing down.
    let server = SERVER.lock().take().ok_or(Error::NotRunning)?;
    server.destroy()?;
    info!("debugger stopped");
    Ok(())
}

/// The running agent.
///
/// # Errors
///
/// Fails with [`Error::NotRunning`] when no agent was started.
pub fn server() -> Result<Arc<Server>> {
    SERVER.lock().clone().ok_or(Error::NotRunning)
}

/// True while the server task serves debuggers.
pub fn running() -> bool {
    SERVER
        .lock()
        .as_ref()
        .is_some_and(|server| server.is_running())
}

/// Log session progress and each dispatched command.
///
/// # Errors
///
/// Fails with [`Error::NotRunning`] when no agent was started.
pub fn set_verbose(on: bool) -> Result<()> {
    let server = server()?;
    let mut session = server.session();
    session.mode.verbose = on;
    session.mode.verbose_commands = on;
    Ok(())
}

/// Trace raw packets under the `rtdbg::remote` target.
///
/// # Errors
///
/// Fails with [`Error::NotRunning`] when no agent was started.
pub fn remote_debug(on: bool) -> Result<()> {
    let server = server()?;
    server.session().mode.remote_debug = on;
    Ok(())
}
