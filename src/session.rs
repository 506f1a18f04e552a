use std::time::{Duration, Instant};

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::MAX_SESSION_TTL;
use crate::model::StudentId;

#[derive(Debug, Clone)]
struct Session {
    student_id: StudentId,
    expires_at: Instant,
}

/// Login sessions keyed by opaque token. Entries expire `ttl` after creation, with `ttl`
/// capped at `MAX_SESSION_TTL`.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: ttl.min(MAX_SESSION_TTL),
        }
    }

    pub fn create(&self, student_id: &str) -> String {
        let token = Ulid::new().to_string();
        self.sessions.insert(
            token.clone(),
            Session {
                student_id: student_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// The student behind `token`, if the session is live. Expired sessions are removed.
    pub fn resolve(&self, token: &str) -> Option<StudentId> {
        let now = Instant::now();
        let live = self
            .sessions
            .get(token)
            .filter(|s| s.expires_at > now)
            .map(|s| s.student_id.clone());
        if live.is_none() {
            self.sessions.remove_if(token, |_, s| s.expires_at <= now);
        }
        live
    }

    /// Returns the student whose session was removed.
    pub fn invalidate(&self, token: &str) -> Option<StudentId> {
        self.sessions.remove(token).map(|(_, s)| s.student_id)
    }

    /// Drop every expired session; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
