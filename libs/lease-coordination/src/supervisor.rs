//! Drives the actual polling of owned sessions.
//!
//! The supervisor follows the manager's lease events and keeps exactly one
//! poll task per owned session. Each task re-checks the polling gate before
//! every poll, so a lease lost without an event (a closed deadline) still
//! stops polling on the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::LeaseManager;
use crate::metrics;
use crate::models::{LeaseEvent, LeaseEventKind, SessionId};

/// Polls one session. Only ever called while this node holds its lease.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    async fn poll(&self, session: &SessionId) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct PollTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    manager: Arc<LeaseManager>,
    poller: Arc<dyn Poller>,
    interval: Duration,
    tasks: Mutex<HashMap<SessionId, PollTask>>,
    token: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("interval", &self.interval)
            .field("polling", &self.polling())
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        manager: Arc<LeaseManager>,
        poller: Arc<dyn Poller>,
        interval: Duration,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            poller,
            interval,
            tasks: Mutex::new(HashMap::new()),
            token,
        })
    }

    /// Sessions with a running poll task.
    pub fn polling(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(session, _)| session.clone())
            .collect();
        sessions.sort();
        sessions
    }

    /// Spawn the event loop. It stops, along with every poll task, when the
    /// token is cancelled.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        // subscribe before spawning so no event emitted after start is missed
        let events = self.manager.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(events).await })
    }

    async fn run(&self, mut events: tokio::sync::broadcast::Receiver<LeaseEvent>) {
        self.reconcile();
        let mut reconcile = tokio::time::interval(self.manager.timing().renewal_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.on_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "lease events lagged, reconciling pollers");
                        self.reconcile();
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = reconcile.tick() => self.reconcile(),
            }
        }
        self.stop_all();
        debug!("poll supervisor stopped");
    }

    fn on_event(&self, event: &LeaseEvent) {
        match event.kind {
            kind if kind.is_gain() => self.ensure_polling(&event.session_id),
            LeaseEventKind::Renewed => self.ensure_polling(&event.session_id),
            kind if kind.is_loss() => self.stop_polling(&event.session_id),
            _ => {}
        }
    }

    /// Match running poll tasks against the sessions the gate is open for.
    fn reconcile(&self) {
        let owned = self.manager.owned_sessions();
        for session in &owned {
            self.ensure_polling(session);
        }
        let stale: Vec<SessionId> = self
            .tasks
            .lock()
            .keys()
            .filter(|s| !owned.contains(s))
            .cloned()
            .collect();
        for session in stale {
            self.stop_polling(&session);
        }
    }

    fn ensure_polling(&self, session: &SessionId) {
        if self.token.is_cancelled() || !self.manager.is_owned(session) {
            return;
        }
        let mut tasks = self.tasks.lock();
        if tasks.get(session).is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let token = self.token.child_token();
        let handle = tokio::spawn(poll_session(
            Arc::clone(&self.manager),
            Arc::clone(&self.poller),
            session.clone(),
            self.interval,
            token.clone(),
        ));
        tasks.insert(session.clone(), PollTask { token, handle });
    }

    fn stop_polling(&self, session: &SessionId) {
        if let Some(task) = self.tasks.lock().remove(session) {
            task.token.cancel();
        }
    }

    fn stop_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.token.cancel();
        }
    }
}

async fn poll_session(
    manager: Arc<LeaseManager>,
    poller: Arc<dyn Poller>,
    session: SessionId,
    interval: Duration,
    token: CancellationToken,
) {
    info!(session_id = %session, "polling started");
    metrics::ACTIVE_POLLERS.inc();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if !manager.is_owned(&session) {
                    debug!(session_id = %session, "lease no longer active");
                    break;
                }
                if let Err(err) = poller.poll(&session).await {
                    metrics::POLL_FAILURES.inc();
                    warn!(session_id = %session, error = %err, "session poll failed");
                }
            }
        }
    }
    metrics::ACTIVE_POLLERS.dec();
    info!(session_id = %session, "polling stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use config::LeaseConfig;

    use super::*;
    use crate::keys::KeyResolver;
    use crate::models::NodeId;
    use crate::store::{MemoryStore, Stores};

    #[derive(Debug, Default)]
    struct CountingPoller {
        polls: Mutex<HashMap<SessionId, usize>>,
        total: AtomicUsize,
    }

    impl CountingPoller {
        fn count(&self, session: &SessionId) -> usize {
            self.polls.lock().get(session).copied().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Poller for CountingPoller {
        async fn poll(&self, session: &SessionId) -> anyhow::Result<()> {
            *self.polls.lock().entry(session.clone()).or_default() += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn timing() -> LeaseConfig {
        LeaseConfig {
            lease_ttl: Duration::from_secs(15),
            renewal_interval: Duration::from_secs(5),
            liveness_ttl: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(5),
            node_discovery_interval: Duration::from_secs(5),
            uncertain_grace_period: Duration::from_secs(12),
            store_timeout: Duration::from_secs(1),
            acquire_backoff: Duration::from_secs(2),
            startup_grace: Duration::ZERO,
            ..LeaseConfig::default()
        }
    }

    async fn setup(store: &MemoryStore) -> (Arc<LeaseManager>, CancellationToken) {
        let token = CancellationToken::new();
        let manager = LeaseManager::new(
            NodeId::from("a"),
            timing(),
            KeyResolver::default(),
            &Stores::memory(store.client()),
            token.child_token(),
        );
        manager.start().await.unwrap();
        (manager, token)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_only_while_owned() {
        let store = MemoryStore::new();
        let (manager, token) = setup(&store).await;
        let poller = Arc::new(CountingPoller::default());
        let supervisor = Supervisor::new(
            Arc::clone(&manager),
            poller.clone(),
            Duration::from_secs(1),
            token.child_token(),
        );
        let _events = supervisor.start();
        tokio::task::yield_now().await;

        let s = SessionId::from("sess-1");
        assert!(manager.track(s.clone()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(supervisor.polling(), vec![s.clone()]);
        let polled = poller.count(&s);
        assert!(polled >= 8, "polled {polled} times");

        manager.untrack(&s).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let after_release = poller.count(&s);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(poller.count(&s), after_release);
        assert!(supervisor.polling().is_empty());
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_exits_when_gate_closes() {
        let store = MemoryStore::new();
        let handle = store.client();
        let token = CancellationToken::new();
        let manager = LeaseManager::new(
            NodeId::from("a"),
            timing(),
            KeyResolver::default(),
            &Stores::memory(handle.clone()),
            token.child_token(),
        );
        manager.start().await.unwrap();
        let poller = Arc::new(CountingPoller::default());
        let supervisor = Supervisor::new(
            Arc::clone(&manager),
            poller.clone(),
            Duration::from_secs(1),
            token.child_token(),
        );
        supervisor.start();
        tokio::task::yield_now().await;

        let s = SessionId::from("sess-1");
        manager.track(s.clone());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(poller.count(&s) > 0);

        // the store goes away: uncertain, then given up
        handle.set_unavailable(true);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!manager.is_owned(&s));
        let stopped_at = poller.count(&s);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(poller.count(&s), stopped_at);
        assert!(supervisor.polling().is_empty());
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_do_not_stop_polling() {
        struct Failing(AtomicUsize);

        #[async_trait]
        impl Poller for Failing {
            async fn poll(&self, _session: &SessionId) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("upstream unavailable")
            }
        }

        let store = MemoryStore::new();
        let (manager, token) = setup(&store).await;
        let poller = Arc::new(Failing(AtomicUsize::new(0)));
        let supervisor = Supervisor::new(
            Arc::clone(&manager),
            poller.clone(),
            Duration::from_secs(1),
            token.child_token(),
        );
        supervisor.start();
        tokio::task::yield_now().await;
        manager.track(SessionId::from("sess-1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(poller.0.load(Ordering::SeqCst) >= 3);
        token.cancel();
    }
}
