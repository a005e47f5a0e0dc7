//! Process-wide `user_id -> Session` map.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::serial::KeyedGate;
use crate::session::Session;

/// Builds a fresh, unhydrated session for a user id.
pub trait SessionFactory: Send + Sync + 'static {
    fn build(&self, user_id: &str) -> Result<Session, EngineError>;
}

impl<F> SessionFactory for F
where
    F: Fn(&str) -> Result<Session, EngineError> + Send + Sync + 'static,
{
    fn build(&self, user_id: &str) -> Result<Session, EngineError> {
        self(user_id)
    }
}

pub struct SessionRegistry {
    factory: Box<dyn SessionFactory>,
    sessions: DashMap<String, Arc<Session>>,
    /// Serializes create/remove per user id.
    lifecycle: KeyedGate,
    autosave: Option<Duration>,
}

impl SessionRegistry {
    pub fn new(factory: impl SessionFactory) -> Self {
        Self {
            factory: Box::new(factory),
            sessions: DashMap::new(),
            lifecycle: KeyedGate::new(),
            autosave: None,
        }
    }

    /// Start autosave on every session this registry creates.
    pub fn with_autosave(mut self, period: Option<Duration>) -> Self {
        self.autosave = period.filter(|p| !p.is_zero());
        self
    }

    /// Hydrated session for `user_id`, created on first use.
    pub async fn get_or_create(&self, user_id: &str) -> Result<Arc<Session>, EngineError> {
        if let Some(session) = self.get(user_id) {
            return Ok(session);
        }

        let _lifecycle = self.lifecycle.acquire(user_id).await;
        // Someone else may have finished creating it while we waited.
        if let Some(session) = self.get(user_id) {
            return Ok(session);
        }

        let session = Arc::new(self.factory.build(user_id)?);
        session.hydrate().await;
        if let Some(period) = self.autosave {
            session.start_autosave(period);
        }
        self.sessions.insert(user_id.to_string(), session.clone());

        info!(
            component = "registry",
            event = "registry.session.created",
            user_id = %user_id,
            managers = session.manager_names().len(),
            active_sessions = self.sessions.len(),
            "Session created"
        );
        Ok(session)
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(user_id).map(|entry| entry.value().clone())
    }

    /// Dispose and forget the session. Returns false if none was live.
    pub async fn remove(&self, user_id: &str) -> bool {
        let _lifecycle = self.lifecycle.acquire(user_id).await;
        let Some((_, session)) = self.sessions.remove(user_id) else {
            return false;
        };

        session.dispose().await;
        if Arc::strong_count(&session) > 1 {
            warn!(
                component = "registry",
                event = "registry.session.still_referenced",
                user_id = %user_id,
                refs = Arc::strong_count(&session) - 1,
                "Removed session is still referenced elsewhere"
            );
        }
        info!(
            component = "registry",
            event = "registry.session.removed",
            user_id = %user_id,
            active_sessions = self.sessions.len(),
            "Session removed"
        );
        true
    }

    pub fn list_active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every live session. Returns how many were disposed.
    pub async fn dispose_all(&self) -> usize {
        let mut disposed = 0;
        for user_id in self.list_active_ids() {
            if self.remove(&user_id).await {
                disposed += 1;
            }
        }
        disposed
    }
}
