//! Session registry and byte-counting connection wrappers

mod conn;
mod session;

pub use conn::{SessionConn, SessionPacketConn};
pub use session::Session;

use crate::conn::FlowKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Completed sessions kept for reporting
pub const MAX_COMPLETED_SESSIONS: usize = 25;

/// Registry of live sessions, keyed by flow
pub trait SessionStater: Send + Sync {
    fn add_session(&self, key: FlowKey, session: Arc<Session>);

    fn remove_session(&self, key: &FlowKey);

    /// Snapshot of the live sessions
    fn sessions(&self) -> Vec<Arc<Session>>;
}

/// A session that has been removed from the registry
#[derive(Debug, Clone)]
pub struct CompletedSession {
    pub session: Arc<Session>,
    pub session_end: SystemTime,
}

pub struct SimpleSessionStater {
    active: DashMap<FlowKey, Arc<Session>>,
    completed: Mutex<VecDeque<CompletedSession>>,
}

impl Default for SimpleSessionStater {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleSessionStater {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            completed: Mutex::new(VecDeque::with_capacity(MAX_COMPLETED_SESSIONS)),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Most recently completed sessions, newest first
    pub fn completed_sessions(&self) -> Vec<CompletedSession> {
        self.completed.lock().iter().rev().cloned().collect()
    }

    pub fn total_upload(&self) -> u64 {
        self.totals().0
    }

    pub fn total_download(&self) -> u64 {
        self.totals().1
    }

    fn totals(&self) -> (u64, u64) {
        let mut upload = 0u64;
        let mut download = 0u64;
        for entry in self.active.iter() {
            upload = upload.saturating_add(entry.upload());
            download = download.saturating_add(entry.download());
        }
        for done in self.completed.lock().iter() {
            upload = upload.saturating_add(done.session.upload());
            download = download.saturating_add(done.session.download());
        }
        (upload, download)
    }

    pub fn summary(&self) -> SessionSummary {
        let (total_upload, total_download) = self.totals();
        SessionSummary {
            active_sessions: self.active_count(),
            completed_sessions: self.completed.lock().len(),
            total_upload,
            total_download,
        }
    }
}

impl SessionStater for SimpleSessionStater {
    fn add_session(&self, key: FlowKey, session: Arc<Session>) {
        if let Some(previous) = self.active.insert(key, session) {
            tracing::warn!(
                "session for {} replaced while still active ({} -> {})",
                key,
                previous.client_addr,
                previous.target_addr
            );
        }
    }

    fn remove_session(&self, key: &FlowKey) {
        let Some((_, session)) = self.active.remove(key) else {
            return;
        };
        tracing::debug!(
            "session closed: {} -> {} up={} down={}",
            session.client_addr,
            session.target_addr,
            session.upload(),
            session.download()
        );

        let mut completed = self.completed.lock();
        if completed.len() >= MAX_COMPLETED_SESSIONS {
            completed.pop_front();
        }
        completed.push_back(CompletedSession {
            session,
            session_end: SystemTime::now(),
        });
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.active.iter().map(|e| Arc::clone(e.value())).collect();
        sessions.sort_by_key(|s| s.session_start);
        sessions
    }
}

/// Aggregated view over the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub active_sessions: usize,
    pub completed_sessions: usize,
    pub total_upload: u64,
    pub total_download: u64,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Up: {:.2} MB, Down: {:.2} MB, {} active, {} completed",
            self.total_upload as f64 / 1024.0 / 1024.0,
            self.total_download as f64 / 1024.0 / 1024.0,
            self.active_sessions,
            self.completed_sessions
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Network;
    use std::net::SocketAddr;

    fn key(port: u16) -> FlowKey {
        FlowKey::udp(SocketAddr::from(([10, 0, 0, 2], port)))
    }

    fn session(client: &str) -> Arc<Session> {
        Arc::new(Session::new(
            "dig".to_string(),
            Network::Udp,
            "127.0.0.1:50000".to_string(),
            client.to_string(),
            "example.com:53".to_string(),
        ))
    }

    #[test]
    fn test_add_remove() {
        let stater = SimpleSessionStater::new();
        let s = session("10.0.0.2:1000");
        s.add_upload(100);
        s.add_download(300);
        stater.add_session(key(1000), Arc::clone(&s));
        assert_eq!(stater.active_count(), 1);
        assert_eq!(stater.sessions().len(), 1);

        stater.remove_session(&key(1000));
        assert_eq!(stater.active_count(), 0);
        assert!(stater.sessions().is_empty());

        let completed = stater.completed_sessions();
        assert_eq!(completed.len(), 1);
        assert!(Arc::ptr_eq(&completed[0].session, &s));

        // Removing again is a no-op
        stater.remove_session(&key(1000));
        assert_eq!(stater.completed_sessions().len(), 1);

        let summary = stater.summary();
        assert_eq!(summary.total_upload, 100);
        assert_eq!(summary.total_download, 300);
        assert_eq!(summary.completed_sessions, 1);
        assert!(summary.to_string().contains("0 active, 1 completed"));
    }

    #[test]
    fn test_completed_history_is_bounded() {
        let stater = SimpleSessionStater::new();
        for port in 0..(MAX_COMPLETED_SESSIONS as u16 + 10) {
            stater.add_session(key(port + 1), session(&format!("10.0.0.2:{}", port + 1)));
            stater.remove_session(&key(port + 1));
        }
        let completed = stater.completed_sessions();
        assert_eq!(completed.len(), MAX_COMPLETED_SESSIONS);
        let newest = MAX_COMPLETED_SESSIONS as u16 + 10;
        assert_eq!(completed[0].session.client_addr, format!("10.0.0.2:{}", newest));
    }

    #[test]
    fn test_totals_span_active_and_completed() {
        let stater = SimpleSessionStater::new();
        let live = session("10.0.0.2:1");
        let done = session("10.0.0.2:2");
        live.add_upload(1);
        done.add_download(2);
        stater.add_session(key(1), live);
        stater.add_session(key(2), done);
        stater.remove_session(&key(2));
        assert_eq!(stater.total_upload(), 1);
        assert_eq!(stater.total_download(), 2);
    }
}
