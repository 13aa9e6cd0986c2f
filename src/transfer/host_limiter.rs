//! Per-host connection limit shared by every transfer of a run

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps simultaneous connections to any single host
///
/// Cloning shares the same limits.
#[derive(Clone, Debug)]
pub struct HostLimiter {
    per_host: Option<usize>,
    hosts: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl HostLimiter {
    /// `None` disables the limit
    pub fn new(per_host: Option<usize>) -> Self {
        Self {
            per_host,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for a connection slot to the host of `url`
    ///
    /// Returns `None` when unlimited or when the URL has no host; the caller
    /// holds the permit for the lifetime of the connection.
    pub async fn acquire(&self, url: &str) -> Option<OwnedSemaphorePermit> {
        let limit = self.per_host?;
        let host = host_key(url)?;
        let semaphore = {
            let mut hosts = self.hosts.lock().unwrap_or_else(|p| p.into_inner());
            hosts
                .entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone()
        };
        // Semaphores here are never closed
        semaphore.acquire_owned().await.ok()
    }
}

fn host_key(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}
