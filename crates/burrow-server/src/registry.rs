use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::identity::TunnelIdentity;
use crate::session::{SessionContext, SessionHandle};

/// Maps tunnel identities to running session actors
pub struct SessionRegistry {
    /// Identity key -> session handle
    sessions: DashMap<String, SessionHandle>,
    context: SessionContext,
}

impl SessionRegistry {
    pub fn new(context: SessionContext) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            context,
        })
    }

    /// Get the session for an identity, spawning it on first use
    pub fn get_or_create(&self, identity: &TunnelIdentity) -> SessionHandle {
        let key = identity.key();
        if let Some(handle) = self.sessions.get(&key) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        self.sessions
            .entry(key)
            .and_modify(|handle| {
                if handle.is_closed() {
                    *handle = SessionHandle::spawn(identity.clone(), &self.context);
                }
            })
            .or_insert_with(|| SessionHandle::spawn(identity.clone(), &self.context))
            .clone()
    }

    pub fn get(&self, identity: &TunnelIdentity) -> Option<SessionHandle> {
        self.sessions.get(&identity.key()).map(|h| h.clone())
    }

    /// Drop handles from other date buckets, handles of stopped actors and
    /// handles nothing but the registry holds
    ///
    /// A dropped session keeps running while its transport pump or an
    /// in-flight forward still holds a handle. An idle one stops; its
    /// persisted state is picked up again by the next actor for the same
    /// identity. Stores that no session needs are released afterwards.
    pub fn sweep(&self, today: NaiveDate) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, handle| {
            handle.identity().day() == today && !handle.is_closed() && handle.is_shared()
        });
        let removed = before.saturating_sub(self.sessions.len());

        let released = self.context.stores.prune(today);
        if released > 0 {
            tracing::debug!("Released {} session stores", released);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// List identity keys of registered sessions
    pub fn list(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }
}
