use crate::conn::Network;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Metadata and byte counters of one relayed flow
#[derive(Debug)]
pub struct Session {
    pub process_name: String,
    pub network: Network,
    /// Local address of the connection to the proxy
    pub dialer_addr: String,
    pub client_addr: String,
    pub target_addr: String,
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
    pub session_start: SystemTime,
}

impl Session {
    pub fn new(
        process_name: String,
        network: Network,
        dialer_addr: String,
        client_addr: String,
        target_addr: String,
    ) -> Self {
        Self {
            process_name,
            network,
            dialer_addr,
            client_addr,
            target_addr,
            upload_bytes: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
            session_start: SystemTime::now(),
        }
    }

    pub fn add_upload(&self, bytes: u64) {
        saturating_add(&self.upload_bytes, bytes);
    }

    pub fn add_download(&self, bytes: u64) {
        saturating_add(&self.download_bytes, bytes);
    }

    pub fn upload(&self) -> u64 {
        self.upload_bytes.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download_bytes.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.session_start.elapsed().unwrap_or_default()
    }
}

fn saturating_add(counter: &AtomicU64, bytes: u64) {
    if bytes == 0 {
        return;
    }
    // The closure always returns Some, so this cannot fail.
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_add(bytes))
    });
}
