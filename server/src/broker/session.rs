use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub peer: SocketAddr,
    pub user_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub requests_served: u64,
}

/// Table of live broker sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    // session_id -> SessionInfo
    sessions: Arc<DashMap<String, SessionInfo>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session; it stays listed until the guard is dropped.
    pub fn open(&self, peer: SocketAddr) -> SessionGuard {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            SessionInfo {
                session_id: session_id.clone(),
                peer,
                user_id: None,
                opened_at: Utc::now(),
                requests_served: 0,
            },
        );

        log::debug!("Opened session {} for {}", session_id, peer);

        SessionGuard {
            session_id,
            sessions: Arc::clone(&self.sessions),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        sessions
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Removes its session from the table when dropped.
pub struct SessionGuard {
    session_id: String,
    sessions: Arc<DashMap<String, SessionInfo>>,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn set_user(&self, user_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(&self.session_id) {
            session.user_id = Some(user_id.to_string());
        }
    }

    pub fn record_request(&self) {
        if let Some(mut session) = self.sessions.get_mut(&self.session_id) {
            session.requests_served += 1;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((_, session)) = self.sessions.remove(&self.session_id) {
            log::debug!(
                "Closed session {} after {} requests",
                session.session_id,
                session.requests_served
            );
        }
    }
}
