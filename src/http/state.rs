use crate::auth::Authenticator;
use crate::coordinator::Pipeline;
use crate::session::{SessionConfig, SessionHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Live conversation sessions (session_id → handle)
    pub sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,

    /// Coordinators shared by every session
    pub pipeline: Arc<Pipeline>,

    /// Consulted once per WebSocket connection
    pub authenticator: Arc<dyn Authenticator>,

    pub session_config: SessionConfig,
}

impl AppState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        authenticator: Arc<dyn Authenticator>,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            pipeline,
            authenticator,
            session_config,
        }
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }
}
