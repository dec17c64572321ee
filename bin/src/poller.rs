use std::collections::HashMap;

use async_trait::async_trait;
use lease_coordination::{Poller, SessionId};
use parking_lot::Mutex;
use pollkeeper_core::tracing::debug;

/// Poller that only records that a poll happened. Stands in for the client
/// that talks to the game server.
#[derive(Debug, Default)]
pub struct TracePoller {
    polls: Mutex<HashMap<SessionId, u64>>,
}

impl TracePoller {
    #[cfg(test)]
    fn polls(&self, session: &SessionId) -> u64 {
        self.polls.lock().get(session).copied().unwrap_or_default()
    }
}

#[async_trait]
impl Poller for TracePoller {
    async fn poll(&self, session: &SessionId) -> anyhow::Result<()> {
        let count = {
            let mut polls = self.polls.lock();
            let count = polls.entry(session.clone()).or_default();
            *count += 1;
            *count
        };
        debug!(session_id = %session, count, "polled session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_polls() {
        let poller = TracePoller::default();
        let session = SessionId::from("sess-1");
        poller.poll(&session).await.unwrap();
        poller.poll(&session).await.unwrap();
        assert_eq!(poller.polls(&session), 2);
        assert_eq!(poller.polls(&SessionId::from("other")), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_polls_are_all_counted() {
        let poller = std::sync::Arc::new(TracePoller::default());
        let session = SessionId::from("sess-1");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let poller = std::sync::Arc::clone(&poller);
                let session = session.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        poller.poll(&session).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(poller.polls(&session), 200);
    }
}
