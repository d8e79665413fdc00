use crate::session::{Session, SessionState, StartError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of in-flight capture sessions, keyed by pod UID.
///
/// Every compound operation (lookup-then-insert, lookup-then-remove) runs
/// under the one lock, so concurrent paths observe either no session or a
/// fully constructed one, never an intermediate state. There is at most one
/// session per pod UID at any instant.
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Current session of `pod_uid`, if any.
    pub fn get(&self, pod_uid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(pod_uid).cloned()
    }

    /// Register the session produced by `init` under `pod_uid`.
    ///
    /// `init` runs inside the registry lock: the existence check, session
    /// construction (which spawns the capture process), and the insertion are
    /// one critical section. If a session already exists, `init` is not
    /// invoked; if `init` fails, nothing is inserted.
    pub fn insert_with<F>(&self, pod_uid: &str, init: F) -> Result<Arc<Session>, StartError>
    where
        F: FnOnce() -> Result<Arc<Session>, StartError>,
    {
        let mut sessions = self.sessions.lock().unwrap();

        if sessions.contains_key(pod_uid) {
            return Err(StartError::AlreadyActive);
        }
        let session = init()?;
        sessions.insert(pod_uid.to_string(), session.clone());

        Ok(session)
    }

    /// Mark `session` Terminated and deregister it, as one atomic step, and
    /// return any capture request recorded during the teardown so the caller
    /// can start the successor. A different session registered under the same
    /// UID is left alone.
    pub fn finish(&self, session: &Arc<Session>) -> Option<String> {
        let mut sessions = self.sessions.lock().unwrap();

        session.set_state(SessionState::Terminated);

        if let Some(current) = sessions.get(&session.pod_uid) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(&session.pod_uid);
            }
        }
        session.take_restart()
    }

    /// Record a capture request which arrived while `session` was tearing
    /// down, to be honored once the teardown completes. Returns false if the
    /// session was already deregistered, in which case nothing consumes the
    /// request and the caller starts a fresh session itself.
    pub fn request_restart(&self, session: &Arc<Session>, requested: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();

        match sessions.get(&session.pod_uid) {
            Some(current) if Arc::ptr_eq(current, session) => {
                session.set_restart(requested.to_string());
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all current sessions.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
