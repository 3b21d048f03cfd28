//! In-memory registry of active device sessions.
//!
//! Sessions are keyed by session ID, and each device has at most one active
//! session pointer. Every read returns an owned copy.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

use sisi_proto::now_ms;

/// A device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Session ID.
    pub session_id: String,
    /// Device owning the session.
    pub device_id: String,
    /// Open time in epoch milliseconds.
    pub connected_at_ms: i64,
    /// Last observed activity in epoch milliseconds.
    pub last_seen_ms: i64,
    /// Current dialogue turn, if any.
    pub turn_id: Option<String>,
    /// Free-form tags.
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_session: HashMap<String, Session>,
    active_by_device: HashMap<String, String>,
}

/// Thread-safe session table.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a session and make it the device's active one.
    pub fn open_session(
        &self,
        session_id: &str,
        device_id: &str,
        turn_id: Option<&str>,
        tags: Option<BTreeMap<String, String>>,
    ) -> Session {
        let now = now_ms();
        let session = Session {
            session_id: session_id.to_string(),
            device_id: device_id.to_string(),
            connected_at_ms: now,
            last_seen_ms: now,
            turn_id: turn_id.map(str::to_string),
            tags: tags.unwrap_or_default(),
        };

        let mut inner = self.inner.lock();
        if let Some(previous) = inner
            .by_session
            .insert(session_id.to_string(), session.clone())
        {
            // A reused session ID must not leave another device pointing at it.
            if previous.device_id != device_id
                && inner.active_by_device.get(&previous.device_id).map(String::as_str)
                    == Some(session_id)
            {
                inner.active_by_device.remove(&previous.device_id);
            }
        }
        inner
            .active_by_device
            .insert(device_id.to_string(), session_id.to_string());
        drop(inner);

        session
    }

    /// Refresh `last_seen_ms` and optionally the turn ID.
    ///
    /// Returns false if the session is unknown.
    pub fn touch(&self, session_id: &str, turn_id: Option<&str>) -> bool {
        let mut inner = self.inner.lock();
        let Some(session) = inner.by_session.get_mut(session_id) else {
            return false;
        };
        session.last_seen_ms = now_ms();
        if let Some(turn) = turn_id {
            session.turn_id = Some(turn.to_string());
        }
        true
    }

    /// Remove a session.
    ///
    /// The device pointer is cleared only if it still names this session.
    pub fn close_session(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.inner.lock();
        let session = inner.by_session.remove(session_id)?;
        if inner
            .active_by_device
            .get(&session.device_id)
            .map(String::as_str)
            == Some(session_id)
        {
            inner.active_by_device.remove(&session.device_id);
        }
        drop(inner);
        Some(session)
    }

    /// Look up a session by ID.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().by_session.get(session_id).cloned()
    }

    /// The device's active session.
    #[must_use]
    pub fn get_active_by_device(&self, device_id: &str) -> Option<Session> {
        let inner = self.inner.lock();
        inner
            .active_by_device
            .get(device_id)
            .and_then(|sid| inner.by_session.get(sid))
            .cloned()
    }

    /// All sessions, ordered by session ID.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.inner.lock().by_session.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_session.len()
    }

    /// Whether no sessions are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
