//! Session registry keyed by dialog call-id
//!
//! In-dialog requests (BYE, in-session MESSAGE) and store-and-forward
//! invitations are routed to the owning session through this map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;
use uuid::Uuid;

use crate::domain::session::Session;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        let call_id = session.call_id();
        debug!(%call_id, session_id = %session.session_id(), "session registered");
        self.sessions.write().unwrap().insert(call_id, session);
    }

    pub fn find_by_call_id(&self, call_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(call_id).cloned()
    }

    pub fn find_by_session_id(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .find(|s| s.session_id() == session_id)
            .cloned()
    }

    pub fn remove(&self, call_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().unwrap().remove(call_id);
        if removed.is_some() {
            debug!(%call_id, "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered session and clear the map.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut map = self.sessions.write().unwrap();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.close();
        }
    }
}
