//! Source of the session set a node keeps leases for.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::CoordinationResult;
use crate::models::SessionId;

#[async_trait]
pub trait SessionRegistry: Send + Sync + 'static {
    /// Every session that should be kept polled by the fleet.
    async fn list(&self) -> CoordinationResult<Vec<SessionId>>;
}

/// Registry over an in-memory list that can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    sessions: RwLock<Vec<SessionId>>,
}

impl StaticRegistry {
    pub fn new<I, S>(sessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SessionId>,
    {
        Self {
            sessions: RwLock::new(sessions.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set<I, S>(&self, sessions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<SessionId>,
    {
        *self.sessions.write() = sessions.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl SessionRegistry for StaticRegistry {
    async fn list(&self) -> CoordinationResult<Vec<SessionId>> {
        Ok(self.sessions.read().clone())
    }
}
