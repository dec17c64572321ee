//! Connection to the NATS server backing the lease and liveness buckets.
//!
//! Startup connects with a bounded number of attempts so an unreachable
//! server fails the node instead of leaving it waiting. Once connected,
//! async-nats handles reconnects by itself.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_nats::ConnectOptions;
use async_nats::connection::State;
use async_nats::jetstream::{self, kv};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use config::NatsConfig;
use config::wire::NatsSecurityMode;

use crate::error::{CoordinationError, CoordinationResult};

const FIRST_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Only the latest revision of a lease or liveness key is ever read.
const BUCKET_HISTORY: i64 = 1;

/// Shared handle to the NATS connection. Clones use the same connection.
#[derive(Clone)]
pub struct NatsClient {
    config: Arc<NatsConfig>,
    conn: Arc<RwLock<Option<async_nats::Client>>>,
}

impl std::fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsClient")
            .field("servers", &self.config.servers)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Delay before retry number `attempt` (1-based): doubles from
/// `FIRST_RETRY_DELAY` up to `MAX_RETRY_DELAY`.
fn retry_delay(attempt: u32) -> Duration {
    FIRST_RETRY_DELAY
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_RETRY_DELAY)
}

fn required<'a, T: ?Sized>(value: Option<&'a T>, mode: &str, field: &str) -> CoordinationResult<&'a T> {
    value.ok_or_else(|| {
        CoordinationError::Config(format!("nats security mode {mode} requires '{field}'"))
    })
}

fn read_seed(path: &Path) -> CoordinationResult<String> {
    std::fs::read_to_string(path)
        .map(|seed| seed.trim().to_owned())
        .map_err(|err| {
            CoordinationError::Config(format!(
                "cannot read nkey seed {}: {err}",
                path.display()
            ))
        })
}

/// Translate the configured security mode into connect options.
async fn connect_options(config: &NatsConfig) -> CoordinationResult<ConnectOptions> {
    let opts = ConnectOptions::new().connection_timeout(config.connect_timeout);
    let mut opts = match config.security_mode {
        NatsSecurityMode::None => opts,
        NatsSecurityMode::UserPassword => {
            let user = required(config.username.as_deref(), "user_password", "username")?;
            let pass = required(config.password.as_deref(), "user_password", "password")?;
            opts.user_and_password(user.to_owned(), pass.to_owned())
        }
        NatsSecurityMode::Token => {
            let token = required(config.token.as_deref(), "token", "token")?;
            opts.token(token.to_owned())
        }
        NatsSecurityMode::Nkey => {
            let path = required(config.nkey_seed_path.as_deref(), "nkey", "nkey_seed_path")?;
            opts.nkey(read_seed(path)?)
        }
        NatsSecurityMode::Tls => {
            let cert = required(config.tls_cert_path.as_deref(), "tls", "tls_cert_path")?;
            let key = required(config.tls_key_path.as_deref(), "tls", "tls_key_path")?;
            opts.add_client_certificate(cert.to_path_buf(), key.to_path_buf())
                .require_tls(true)
        }
        NatsSecurityMode::CredsFile => {
            let path = required(config.creds_file_path.as_deref(), "creds_file", "creds_file_path")?;
            opts.credentials_file(path).await.map_err(|err| {
                CoordinationError::Config(format!(
                    "cannot load credentials {}: {err}",
                    path.display()
                ))
            })?
        }
    };
    // a CA bundle turns on server verification whatever the auth mode
    if let Some(ca) = &config.tls_ca_path {
        opts = opts.add_root_certificates(ca.clone()).require_tls(true);
    }
    Ok(opts)
}

impl NatsClient {
    /// Handle for `config`; nothing is dialed until [`NatsClient::connect`].
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config: Arc::new(config),
            conn: Arc::new(RwLock::new(None)),
        }
    }

    /// Dial the configured servers, trying `connect_retry_max + 1` times in
    /// total with doubling delays in between.
    pub async fn connect(&self) -> CoordinationResult<()> {
        if self.conn.read().is_some() {
            debug!("nats connection already open");
            return Ok(());
        }
        let attempts = self.config.connect_retry_max.saturating_add(1);
        info!(
            servers = ?self.config.servers,
            security_mode = ?self.config.security_mode,
            attempts,
            "connecting to nats"
        );

        let mut attempt = 1;
        loop {
            let opts = connect_options(&self.config).await?;
            match opts.connect(self.config.servers.clone()).await {
                Ok(client) => {
                    info!(attempt, "nats connection established");
                    *self.conn.write() = Some(client);
                    return Ok(());
                }
                Err(err) if attempt < attempts => {
                    let delay = retry_delay(attempt);
                    warn!(attempt, attempts, ?delay, %err, "nats connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(attempts, %err, "giving up connecting to nats");
                    return Err(CoordinationError::Transport(format!(
                        "nats unreachable after {attempts} attempt(s): {err}"
                    )));
                }
            }
        }
    }

    /// True while a connection exists and async-nats reports it up.
    pub fn is_connected(&self) -> bool {
        self.conn
            .read()
            .as_ref()
            .is_some_and(|client| matches!(client.connection_state(), State::Connected))
    }

    fn client(&self) -> CoordinationResult<async_nats::Client> {
        self.conn
            .read()
            .clone()
            .ok_or_else(|| CoordinationError::NotConnected("nats connection not open".into()))
    }

    /// Open the KV bucket `name`, creating it with `max_age` as the entry TTL
    /// when it does not exist yet.
    pub async fn open_bucket(&self, name: &str, max_age: Duration) -> CoordinationResult<kv::Store> {
        let js = jetstream::new(self.client()?);
        match js.get_key_value(name).await {
            Ok(bucket) => Ok(bucket),
            Err(lookup) => {
                debug!(bucket = name, %lookup, "creating kv bucket");
                js.create_key_value(kv::Config {
                    bucket: name.to_owned(),
                    history: BUCKET_HISTORY,
                    max_age,
                    ..Default::default()
                })
                .await
                .map_err(|err| {
                    CoordinationError::Transport(format!(
                        "cannot create kv bucket {name}: {err} (lookup: {lookup})"
                    ))
                })
            }
        }
    }

    /// Drop the connection. Idempotent.
    pub async fn disconnect(&self) {
        let Some(client) = self.conn.write().take() else {
            return;
        };
        if let Err(err) = client.flush().await {
            debug!(%err, "flush before disconnect failed");
        }
        info!("nats connection closed");
    }
}
