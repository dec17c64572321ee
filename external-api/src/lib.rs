//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, fleet reporting, and metrics
//! It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /v1/nodes
//! /v1/nodes/:id/ready
//! /v1/sessions/:id/lease
//!
//! The `/v1` endpoints answer 503 until a lease manager is attached.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{Router, extract::Extension, routing};
use lease_coordination::LeaseManager;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, trace};

pub use crate::models::{Health, State};

/// Requests slower than this are answered with 408.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Manager handle shared with the handlers, absent until attached
pub type Manager = Option<Arc<LeaseManager>>;

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Listens to relevant channels to gather information about
/// the running node and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    manager: Manager,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, manager: Manager) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            manager,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub async fn set_health(&self, health: Health) {
        *self.state.lock() = health;
        models::export_health(health);
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self, token: CancellationToken) -> Result<()> {
        loop {
            let health = tokio::select! {
                _ = token.cancelled() => break,
                health = self.rx.recv() => match health {
                    Some(health) => health,
                    None => break,
                },
            };
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
                models::export_health(health);
            }
        }
        debug!("listen health exited");
        Ok(())
    }

    /// Routes for the reporting api
    pub fn router(state: State, manager: Manager) -> Router {
        Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/v1/nodes", routing::get(handlers::nodes))
            .route("/v1/nodes/:id/ready", routing::get(handlers::node_ready))
            .route("/v1/sessions/:id/lease", routing::get(handlers::session_lease))
            .layer(Extension(state))
            .layer(Extension(manager))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(TraceLayer::new_for_http())
    }

    /// serve the HTTP external api until `token` is cancelled
    async fn run(
        addr: SocketAddr,
        state: State,
        manager: Manager,
        token: CancellationToken,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Self::router(state, manager);

        debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        debug!("external API stopped");
        Ok(())
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let manager = self.manager.clone();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, manager, token.clone()),
                self.listen_status(token.clone())
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self, token: CancellationToken) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(token),
        }
    }
}

mod handlers {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::{
        Json,
        body::Body,
        extract::{Extension, Path},
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use chrono::Utc;
    use lease_coordination::{LeaseManager, NodeId, NodeStatus, SessionId};
    use pollkeeper_core::metrics::update_uptime;
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use crate::Manager;
    use crate::models::{
        Health, NodeReadiness, NodeReport, NodesResponse, ServerError, ServerResult,
        SessionLease, State,
    };

    fn attached(manager: Manager) -> ServerResult<Arc<LeaseManager>> {
        manager.ok_or_else(|| ServerError::unavailable("lease manager not attached"))
    }

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn nodes(
        Extension(manager): Extension<Manager>,
    ) -> ServerResult<Json<NodesResponse>> {
        let manager = attached(manager)?;
        let this = manager.instance_id().clone();
        let (records, snapshots) =
            tokio::try_join!(manager.live_node_records(), manager.lease_snapshots())?;

        let mut by_owner: BTreeMap<NodeId, Vec<SessionLease>> = BTreeMap::new();
        for snapshot in snapshots {
            if let Some(owner) = snapshot.record.as_ref().map(|r| r.owner_id.clone()) {
                by_owner
                    .entry(owner)
                    .or_default()
                    .push(SessionLease::from_snapshot(snapshot));
            }
        }

        let live_nodes = records
            .into_iter()
            .map(|record| NodeReport {
                is_this_instance: record.node_id == this,
                owned_sessions: by_owner.remove(&record.node_id).unwrap_or_default(),
                instance_id: record.node_id.to_string(),
                status: record.status.to_string(),
                startup_time: record.startup_time,
            })
            .collect();

        Ok(Json(NodesResponse {
            this_instance_id: this.to_string(),
            live_nodes,
            timestamp: Utc::now(),
        }))
    }

    pub(crate) async fn node_ready(
        Path(id): Path<String>,
        Extension(manager): Extension<Manager>,
    ) -> ServerResult<Json<NodeReadiness>> {
        let manager = attached(manager)?;
        let node = NodeId::new(id);
        let status = match manager.check_node_ready(&node).await {
            Ok(true) => NodeStatus::Online.to_string(),
            Ok(false) => NodeStatus::Initializing.to_string(),
            Err(err) if err.is_offline() => "offline".to_owned(),
            Err(err) => return Err(err.into()),
        };
        Ok(Json(NodeReadiness {
            instance_id: node.to_string(),
            status,
        }))
    }

    pub(crate) async fn session_lease(
        Path(id): Path<String>,
        Extension(manager): Extension<Manager>,
    ) -> ServerResult<Json<SessionLease>> {
        let manager = attached(manager)?;
        let snapshot = manager.lease_snapshot(&SessionId::new(id)).await?;
        Ok(Json(SessionLease::from_snapshot(snapshot)))
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        update_uptime();
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        update_uptime();
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::{http::StatusCode, response::IntoResponse};
    use chrono::{DateTime, Utc};
    use lease_coordination::{LeaseSnapshot, wall_clock};
    use parking_lot::Mutex;
    use pollkeeper_core::metrics::HEALTHY;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    pub(crate) fn export_health(health: Health) {
        HEALTHY.set(i64::from(health == Health::Good));
    }

    /// One session lease as seen from this node
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct SessionLease {
        /// session id
        pub session_id: String,
        /// owner recorded in the store, null when free or expired
        pub owner_id: Option<String>,
        /// rendezvous-preferred owner over the live-node set
        pub preferred_owner_id: Option<String>,
        /// this node's local lease state for the session
        pub state: String,
        /// when the current owner acquired the lease
        pub acquired_at: Option<DateTime<Utc>>,
        /// when the current owner last renewed the lease
        pub last_renewed_at: Option<DateTime<Utc>>,
        /// set while this node's renewals are failing
        pub uncertain_since: Option<DateTime<Utc>>,
    }

    impl SessionLease {
        pub(crate) fn from_snapshot(snapshot: LeaseSnapshot) -> Self {
            let state = snapshot
                .local
                .as_ref()
                .map(|info| info.state.to_string())
                .unwrap_or_else(|| "unowned".to_owned());
            let uncertain_since = snapshot
                .local
                .as_ref()
                .and_then(|info| info.uncertain_since)
                .map(wall_clock);
            Self {
                session_id: snapshot.session_id.to_string(),
                owner_id: snapshot.record.as_ref().map(|r| r.owner_id.to_string()),
                preferred_owner_id: snapshot.preferred_owner.map(|n| n.to_string()),
                state,
                acquired_at: snapshot.record.as_ref().map(|r| r.acquired_at),
                last_renewed_at: snapshot.record.as_ref().map(|r| r.last_renewed_at),
                uncertain_since,
            }
        }
    }

    /// A live node and the sessions recorded as owned by it
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct NodeReport {
        /// node id
        pub instance_id: String,
        /// true for the node answering the request
        pub is_this_instance: bool,
        /// self-reported status: initializing or online
        pub status: String,
        /// when the node process started
        pub startup_time: DateTime<Utc>,
        /// tracked sessions whose lease record names this node
        pub owned_sessions: Vec<SessionLease>,
    }

    /// Response of `/v1/nodes`
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct NodesResponse {
        /// node answering the request
        pub this_instance_id: String,
        /// every node with an unexpired liveness record
        pub live_nodes: Vec<NodeReport>,
        /// when the response was built
        pub timestamp: DateTime<Utc>,
    }

    /// Response of `/v1/nodes/:id/ready`
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct NodeReadiness {
        /// node id
        pub instance_id: String,
        /// online, initializing or offline
        pub status: String,
    }

    // error type
    /// Error wrapping `anyhow::Error` with the status code to answer with.
    #[derive(Debug)]
    pub struct ServerError {
        status: StatusCode,
        err: anyhow::Error,
    }
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl ServerError {
        /// 503 with `msg` as the body
        pub fn unavailable(msg: &str) -> Self {
            Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                err: anyhow::anyhow!("{msg}"),
            }
        }
    }

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (self.status, format!("{}", self.err)).into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                err: err.into(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use config::LeaseConfig;
    use lease_coordination::{KeyResolver, MemoryStore, NodeId, SessionId, Stores};

    use super::*;
    use crate::models::{NodeReadiness, NodesResponse, SessionLease};

    fn timing() -> LeaseConfig {
        LeaseConfig {
            startup_grace: Duration::ZERO,
            ..LeaseConfig::default()
        }
    }

    async fn manager(token: &CancellationToken) -> anyhow::Result<Arc<LeaseManager>> {
        let manager = LeaseManager::new(
            NodeId::from("api-1"),
            timing(),
            KeyResolver::default(),
            &Stores::memory(MemoryStore::new()),
            token.child_token(),
        );
        manager.start().await?;
        Ok(manager)
    }

    #[tokio::test]
    async fn test_health() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let api = ExternalApi::new("0.0.0.0:8889".parse().unwrap(), None);
        let _handle = api.serve(token.clone());
        // wait for server to come up
        tokio::time::sleep(Duration::from_secs(1)).await;
        let r = reqwest::get("http://0.0.0.0:8889/health")
            .await?
            .error_for_status();
        // initial health state will be BAD i.e. 500
        match r {
            Ok(_) => {}
            Err(err) => {
                assert_eq!(
                    err.status(),
                    Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR)
                );
            }
        }
        token.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn test_health_follows_sender() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let api = ExternalApi::new("0.0.0.0:8887".parse().unwrap(), None);
        let sender = api.sender();
        let _handle = api.serve(token.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        sender.send(Health::Good).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = reqwest::get("http://0.0.0.0:8887/health").await?.status();
        assert_eq!(status, reqwest::StatusCode::OK);
        token.cancel();
        Ok(())
    }

    // very simple test for existence of metrics endpoint
    #[tokio::test]
    async fn test_metrics() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let api = ExternalApi::new("0.0.0.0:8888".parse().unwrap(), None);
        let _handle = api.serve(token.clone());
        // wait for server to come up
        tokio::time::sleep(Duration::from_secs(1)).await;
        let bytes = reqwest::get("http://0.0.0.0:8888/metrics")
            .await?
            .error_for_status()?
            .bytes()
            .await;
        assert!(bytes.is_ok());
        token.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn test_v1_unavailable_without_manager() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let api = ExternalApi::new("0.0.0.0:8886".parse().unwrap(), None);
        let _handle = api.serve(token.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        for path in ["/v1/nodes", "/v1/nodes/a/ready", "/v1/sessions/s/lease"] {
            let status = reqwest::get(format!("http://0.0.0.0:8886{path}"))
                .await?
                .status();
            assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE, "{path}");
        }
        token.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn test_fleet_reporting() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let manager = manager(&token).await?;
        let session = SessionId::from("sess-1");
        manager.track(session.clone());
        let api = ExternalApi::new("0.0.0.0:8885".parse().unwrap(), Some(Arc::clone(&manager)));
        let _handle = api.serve(token.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.is_owned(&session));

        let nodes: NodesResponse = reqwest::get("http://0.0.0.0:8885/v1/nodes")
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(nodes.this_instance_id, "api-1");
        assert_eq!(nodes.live_nodes.len(), 1);
        let me = &nodes.live_nodes[0];
        assert!(me.is_this_instance);
        assert_eq!(me.status, "online");
        assert_eq!(me.owned_sessions.len(), 1);
        assert_eq!(me.owned_sessions[0].session_id, "sess-1");

        let lease: SessionLease = reqwest::get("http://0.0.0.0:8885/v1/sessions/sess-1/lease")
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(lease.owner_id.as_deref(), Some("api-1"));
        assert_eq!(lease.preferred_owner_id.as_deref(), Some("api-1"));
        assert_eq!(lease.state, "owned");
        assert!(lease.acquired_at.is_some());
        assert_eq!(lease.uncertain_since, None);

        let ready: NodeReadiness = reqwest::get("http://0.0.0.0:8885/v1/nodes/api-1/ready")
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(ready.status, "online");
        let ghost: NodeReadiness = reqwest::get("http://0.0.0.0:8885/v1/nodes/ghost/ready")
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(ghost.status, "offline");

        manager.shutdown().await;
        token.cancel();
        Ok(())
    }
}
