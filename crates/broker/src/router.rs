//! Model routing table: `model name → owning session`, with failover.
//!
//! Each model keeps the ordered list of live sessions that declared it.
//! The first declarer owns the model; when it unregisters, the earliest
//! surviving declarer is promoted. A model never resolves to two sessions
//! at once, and never to a session that has unregistered.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use {
    secrecy::Secret,
    tracing::{debug, info},
};

/// A resolved route for one request.
pub struct Route {
    pub session_id: String,
    pub credential: Option<Secret<String>>,
}

#[derive(Default)]
struct RouterInner {
    /// model → session ids that declared it, in registration order.
    candidates: HashMap<String, Vec<String>>,
    /// session id → upstream credential, for route resolution.
    credentials: HashMap<String, Option<Secret<String>>>,
}

/// Single source of truth for model membership. Mutated by session
/// lifecycle, read by the HTTP handlers; guarded by one lock that is never
/// held across await points.
#[derive(Default)]
pub struct ModelRouter {
    inner: RwLock<RouterInner>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and its declared models. Models already owned by
    /// another live session are not stolen; this session queues behind it.
    pub fn on_register(
        &self,
        session_id: &str,
        models: &[String],
        credential: Option<Secret<String>>,
    ) {
        let mut inner = self.inner.write().expect("router poisoned");
        inner
            .credentials
            .insert(session_id.to_string(), credential);
        for model in models {
            let queue = inner.candidates.entry(model.clone()).or_default();
            if !queue.iter().any(|s| s == session_id) {
                queue.push(session_id.to_string());
            }
        }
        info!(
            session_id,
            models = models.len(),
            "session registered with router"
        );
    }

    /// Drop every mapping owned by or queued for this session. Models the
    /// session owned are promoted to their next declarer, if any.
    pub fn on_unregister(&self, session_id: &str) {
        let mut inner = self.inner.write().expect("router poisoned");
        inner.credentials.remove(session_id);
        inner.candidates.retain(|model, queue| {
            let owned = queue.first().is_some_and(|s| s == session_id);
            queue.retain(|s| s != session_id);
            if owned {
                match queue.first() {
                    Some(next) => debug!(model, next_session = %next, "model promoted"),
                    None => debug!(model, "model withdrawn"),
                }
            }
            !queue.is_empty()
        });
        info!(session_id, "session unregistered from router");
    }

    /// Resolve the owning session for a model. `None` means the model is
    /// unknown to every live session.
    pub fn get_route(&self, model: &str) -> Option<Route> {
        let inner = self.inner.read().expect("router poisoned");
        let session_id = inner.candidates.get(model)?.first()?.clone();
        let credential = inner.credentials.get(&session_id).cloned().flatten();
        Some(Route {
            session_id,
            credential,
        })
    }

    /// All currently routable model names, sorted for stable listings.
    pub fn models(&self) -> Vec<String> {
        let inner = self.inner.read().expect("router poisoned");
        let mut models: Vec<String> = inner.candidates.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn session_count(&self) -> usize {
        let inner = self.inner.read().expect("router poisoned");
        inner.credentials.len()
    }
}
