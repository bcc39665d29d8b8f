use crate::selector::Notifier;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tracing::debug;

/// Resolution is the slot a lookup task fills in. The connection and the task
/// each hold a reference, so the slot outlives whichever side finishes first.
pub type Resolution = Arc<OnceLock<Vec<SocketAddr>>>;

/// Resolver runs name lookups off the reactor thread and reports completion
/// through the selector's notifier
pub struct Resolver {
    handle: Handle,
    notifier: Notifier,
}

/// Resolver implementation block
impl Resolver {
    /// new is a constructor for the Resolver type
    pub fn new(handle: Handle, notifier: Notifier) -> Self {
        Self { handle, notifier }
    }

    /// resolve starts a lookup of `host:port` on behalf of the connection whose
    /// client socket is `fd`. The candidate list (empty on failure) is stored in
    /// the returned slot before the block notification for `fd` is sent.
    pub fn resolve(&self, fd: RawFd, host: String, port: u16) -> Resolution {
        let slot: Resolution = Arc::new(OnceLock::new());
        let task_slot = Arc::clone(&slot);
        let notifier = self.notifier.clone();

        self.handle.spawn(async move {
            let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host.as_str(), port)).await
            {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    debug!("failed to resolve host '{host}': {e}");
                    Vec::new()
                }
            };

            // DEBUG
            debug!("resolved {host}:{port} to {} candidates", addrs.len());

            let _ = task_slot.set(addrs);
            notifier.notify_block(fd);
        });

        slot
    }
}
