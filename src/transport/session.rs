//! Session registry.
//!
//! Sessions are minted only for a POST carrying an `initialize` request and are
//! looked up (and their activity timestamp refreshed) on every later request
//! that carries the session header.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::TransportError;

pub type SessionId = Arc<str>;

#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub id: SessionId,
    pub created_at: SystemTime,
    pub last_activity: Instant,
}

pub(crate) fn generate_session_id() -> SessionId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random: u64 = rand::random();
    Arc::from(format!("{:016x}{:016x}", timestamp, random))
}

pub(crate) struct SessionRegistry {
    header_name: String,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self) -> Session {
        let session = Session {
            id: generate_session_id(),
            created_at: SystemTime::now(),
            last_activity: Instant::now(),
        };
        self.sessions
            .lock()
            .insert(session.id.clone(), session.clone());
        tracing::info!(session_id = %session.id, "session created");
        session
    }

    /// Resolve a session token and refresh its activity timestamp.
    ///
    /// Without a token this fails when `mandatory`, and yields `None` otherwise.
    pub fn validate(
        &self,
        token: Option<&str>,
        mandatory: bool,
    ) -> Result<Option<Session>, TransportError> {
        let Some(token) = token else {
            if mandatory {
                tracing::warn!(header = %self.header_name, "mandatory session ID missing");
                return Err(TransportError::MissingSession {
                    header: self.header_name.clone(),
                });
            }
            return Ok(None);
        };

        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(token) else {
            tracing::warn!(session_id = token, "invalid or expired session ID");
            return Err(TransportError::UnknownSession);
        };
        session.last_activity = Instant::now();
        tracing::debug!(session_id = token, "session validated");
        Ok(Some(session.clone()))
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.lock().remove(id)
    }

    /// Ids of sessions without activity for longer than `idle`.
    pub fn idle_since(&self, now: Instant, idle: Duration) -> Vec<SessionId> {
        self.sessions
            .lock()
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) > idle)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn clear(&self) {
        self.sessions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new("Mcp-Session-Id")
    }

    #[test]
    fn test_session_ids_are_unique_hex() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let registry = registry();
        let session = registry.create();
        assert_eq!(registry.len(), 1);

        let found = registry.validate(Some(&session.id), true).unwrap().unwrap();
        assert_eq!(found.id, session.id);

        assert!(registry.remove(&session.id).is_some());
        assert_eq!(registry.len(), 0);
        assert!(matches!(
            registry.validate(Some(&session.id), true),
            Err(TransportError::UnknownSession)
        ));
    }

    #[tokio::test]
    async fn test_missing_token() {
        let registry = registry();
        match registry.validate(None, true) {
            Err(TransportError::MissingSession { header }) => assert_eq!(header, "Mcp-Session-Id"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.validate(None, false).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_refreshes_activity() {
        let registry = registry();
        let session = registry.create();

        tokio::time::advance(Duration::from_secs(60)).await;
        let refreshed = registry.validate(Some(&session.id), true).unwrap().unwrap();
        assert!(refreshed.last_activity > session.last_activity);
        assert!(registry
            .idle_since(Instant::now(), Duration::from_secs(30))
            .is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            registry.idle_since(Instant::now(), Duration::from_secs(30)),
            vec![session.id.clone()]
        );
    }
}
