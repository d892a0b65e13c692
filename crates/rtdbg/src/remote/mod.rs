//! Named transport registry.
//!
//! [`crate::start`] looks the transport up by [`StartOptions::remote`]
//! (`crate::StartOptions`). TCP is always available; other transports are
//! added with [`register`].

mod tcp;

use std::sync::Arc;

use parking_lot::{Mutex, const_mutex};
use rtdbg_target::Remote;
use tracing::debug;

pub use tcp::{TcpRemote, parse_device};

static REMOTES: Mutex<Vec<Arc<dyn Remote>>> = const_mutex(Vec::new());

/// Add a transport, replacing any registered under the same name.
pub fn register(remote: Arc<dyn Remote>) {
    let mut remotes = REMOTES.lock();
    remotes.retain(|known| known.name() != remote.name());
    debug!(name = remote.name(), "remote registered");
    remotes.push(remote);
}

/// Look a transport up by name.
pub fn find(name: &str) -> Option<Arc<dyn Remote>> {
    let mut remotes = REMOTES.lock();
    if let Some(remote) = remotes.iter().find(|remote| remote.name() == name) {
        return Some(Arc::clone(remote));
    }
    if name == TcpRemote::NAME {
        let remote: Arc<dyn Remote> = Arc::new(TcpRemote::new());
        remotes.push(Arc::clone(&remote));
        return Some(remote);
    }
    None
}
