//! Session table and the caller-facing API.
//!
//! The manager owns the only shared mutable structure in the crate: the
//! table of sessions, guarded by a single mutex. The at-most-one-active
//! rule per resource is checked and enforced under that lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tracing::{debug, info};

use super::{ReconfigureOptions, Session, SessionConfig, lock, spawn};
use crate::error::VdiError;
use crate::quality::QualitySample;
use crate::state::{Capabilities, SessionState};
use crate::transport::{Connector, Resolver};
use crate::types::{ResourceId, SessionId, SessionToken};

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn Resolver>,
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("sessions", &lock(&self.sessions).len())
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn Resolver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            connector,
            resolver,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a session for `resource`. Returns immediately; follow progress
    /// through [`Session::state_stream`] or await [`Session::established`].
    ///
    /// Fails with `AlreadyConnected` while another session for the same
    /// resource is active. Must be called within a tokio runtime.
    pub fn connect(
        &self,
        resource: impl Into<ResourceId>,
        token: SessionToken,
    ) -> Result<Session, VdiError> {
        let resource = resource.into();
        let mut sessions = lock(&self.sessions);

        if sessions
            .values()
            .any(|s| s.resource() == &resource && s.state().is_active())
        {
            return Err(VdiError::AlreadyConnected {
                resource_id: resource.to_string(),
            });
        }

        let session = spawn(
            resource,
            token,
            self.config.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.resolver),
        );
        info!(
            session_id = %session.id(),
            resource_id = %session.resource(),
            "session created"
        );
        sessions.insert(session.id(), session.clone());
        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> Result<Session, VdiError> {
        lock(&self.sessions)
            .get(&id)
            .cloned()
            .ok_or_else(|| VdiError::UnknownSession(id.to_string()))
    }

    /// Every session still in the table.
    pub fn sessions(&self) -> Vec<Session> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Close a session. Disconnecting a session that already ended is a
    /// no-op.
    pub async fn disconnect(&self, id: SessionId) -> Result<(), VdiError> {
        let session = self.session(id)?;
        session.disconnect().await;
        debug!(session_id = %id, state = %session.state(), "disconnect complete");
        Ok(())
    }

    pub async fn reconfigure(
        &self,
        id: SessionId,
        options: ReconfigureOptions,
    ) -> Result<(), VdiError> {
        self.session(id)?.reconfigure(options).await
    }

    /// Quality samples of a session. The stream ends when the session
    /// reaches a terminal state.
    pub fn observe_quality(
        &self,
        id: SessionId,
    ) -> Result<impl Stream<Item = QualitySample> + Send + use<>, VdiError> {
        Ok(self.session(id)?.quality_stream())
    }

    pub fn current_state(&self, id: SessionId) -> Result<SessionState, VdiError> {
        Ok(self.session(id)?.state())
    }

    pub fn current_capabilities(&self, id: SessionId) -> Result<Option<Capabilities>, VdiError> {
        Ok(self.session(id)?.capabilities())
    }

    /// Forget a terminal session. Returns `false`, and keeps the session,
    /// while it has not reached `Closed` or `Failed`.
    pub fn acknowledge(&self, id: SessionId) -> Result<bool, VdiError> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get(&id)
            .ok_or_else(|| VdiError::UnknownSession(id.to_string()))?;
        if !session.state().is_terminal() {
            return Ok(false);
        }
        sessions.remove(&id);
        Ok(true)
    }
}
