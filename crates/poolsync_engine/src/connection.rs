//! One managed connection to a pool.

use crate::certificate::{CertificateValidator, PolicyValidator, Verdict};
use crate::config::{ConnectionConfig, Credentials};
use crate::error::{EngineError, EngineResult};
use crate::membership::{MembershipTracker, PoolMembership};
use crate::session::Session;
use crate::synchronizer::{EventSynchronizer, SyncExit, SyncNotice};
use crate::transport::{Connector, Transport};
use parking_lot::RwLock;
use poolsync_core::ObjectStore;
use poolsync_protocol::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Endpoint currently (or last) connected to.
    pub address: String,
    /// User logged in as.
    pub username: Option<String>,
    /// Whether a session is live.
    pub connected: bool,
    /// Known pool-member addresses.
    pub members: Vec<String>,
    /// Whether the coordinator can move.
    pub coordinator_may_change: bool,
    /// Whether the store is stale.
    pub stale: bool,
    /// Epoch of the current session; bumped on every (re)connect.
    pub epoch: u64,
}

struct Live {
    session: Arc<Session>,
    transport: Transport,
    synchronizer: Arc<EventSynchronizer>,
    shutdown: watch::Sender<bool>,
}

/// Composes session, transport, store and synchronizer for one pool.
///
/// The store outlives sessions: it is kept (stale) across reconnects and
/// reloaded by each new synchronizer.
pub struct Connection {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    validator: Arc<dyn CertificateValidator>,
    store: Arc<ObjectStore>,
    membership: Arc<MembershipTracker>,
    notices: broadcast::Sender<SyncNotice>,
    live: RwLock<Option<Live>>,
    credentials: RwLock<Option<Credentials>>,
    address: RwLock<String>,
    epoch: AtomicU64,
    reconnecting: tokio::sync::Mutex<()>,
    /// Set by `disconnect` so a pending reconnect gives up.
    closed: AtomicBool,
}

impl Connection {
    /// Creates a disconnected connection.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        let validator = Arc::new(PolicyValidator::new(config.certificate));
        Self {
            address: RwLock::new(config.address.clone()),
            config,
            connector,
            validator,
            store: Arc::new(ObjectStore::new()),
            membership: Arc::new(MembershipTracker::new()),
            notices,
            live: RwLock::new(None),
            credentials: RwLock::new(None),
            epoch: AtomicU64::new(0),
            reconnecting: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Replaces the certificate validator.
    pub fn with_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Uses an existing store instead of a fresh one.
    pub fn with_store(mut self, store: Arc<ObjectStore>) -> Self {
        self.store = store;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the store.
    pub fn store(&self) -> Arc<ObjectStore> {
        Arc::clone(&self.store)
    }

    /// Subscribes to sync notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Returns the transport of the live session.
    pub fn transport(&self) -> EngineResult<Transport> {
        self.live
            .read()
            .as_ref()
            .map(|live| live.transport.clone())
            .ok_or(EngineError::NotConnected)
    }

    /// Returns the synchronizer of the live session.
    pub fn synchronizer(&self) -> Option<Arc<EventSynchronizer>> {
        self.live
            .read()
            .as_ref()
            .map(|live| Arc::clone(&live.synchronizer))
    }

    /// Returns the tracked pool membership.
    pub fn membership(&self) -> PoolMembership {
        self.membership.snapshot()
    }

    /// Returns true while a session is live.
    pub fn is_connected(&self) -> bool {
        self.live
            .read()
            .as_ref()
            .map(|live| live.session.is_logged_in())
            .unwrap_or(false)
    }

    /// Returns a snapshot of the connection state.
    pub fn state(&self) -> ConnectionState {
        let membership = self.membership.snapshot();
        ConnectionState {
            address: self.address.read().clone(),
            username: self
                .credentials
                .read()
                .as_ref()
                .map(|c| c.username().to_string()),
            connected: self.is_connected(),
            members: membership.members,
            coordinator_may_change: membership.coordinator_may_change,
            stale: self.store.is_stale(),
            epoch: self.epoch.load(Ordering::SeqCst),
        }
    }

    /// Issues a call on the live session.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> EngineResult<Value> {
        self.transport()?.call(method, params).await
    }

    /// Connects, logs in, full-loads the store and starts the poll loop.
    ///
    /// A single coordinator redirect is followed transparently. Errors from
    /// login (authentication, redirect loop, certificate) are returned as is.
    pub async fn connect(self: &Arc<Self>, credentials: Credentials) -> EngineResult<()> {
        self.closed.store(false, Ordering::SeqCst);
        *self.credentials.write() = Some(credentials.clone());
        let address = self.config.address.clone();
        let _guard = self.reconnecting.lock().await;
        self.establish(&address, &credentials).await
    }

    /// Stops the poll loop and logs out. The store is kept, marked stale.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let live = self.live.write().take();
        self.store.mark_stale();
        if let Some(live) = live {
            let _ = live.shutdown.send(true);
            live.session.logout().await;
            info!(address = %self.address.read(), "disconnected");
        }
    }

    /// Tears down the current session and connects again, trying failover
    /// candidates with backoff.
    pub async fn reconnect(self: &Arc<Self>) -> EngineResult<()> {
        let credentials = self
            .credentials
            .read()
            .clone()
            .ok_or(EngineError::NotConnected)?;
        let _guard = self.reconnecting.lock().await;

        let previous = self.live.write().take();
        if let Some(live) = previous {
            let _ = live.shutdown.send(true);
            live.session.invalidate();
        }
        self.store.mark_stale();

        let last = self.address.read().clone();
        let candidates = self.membership.failover_candidates(&last);
        let retry = &self.config.retry;
        let mut last_error = EngineError::NotConnected;

        for attempt in 0..retry.max_attempts.max(1) {
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            for candidate in &candidates {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(EngineError::NotConnected);
                }
                debug!(attempt, address = %candidate, "reconnect attempt");
                match self.establish(candidate, &credentials).await {
                    Ok(()) => {
                        let address = self.address.read().clone();
                        info!(%address, attempt, "reconnected");
                        let _ = self.notices.send(SyncNotice::Reconnected { address });
                        return Ok(());
                    }
                    Err(error) if error.is_fatal_for_connect() => {
                        warn!(address = %candidate, %error, "reconnect abandoned");
                        return Err(error);
                    }
                    Err(error) => {
                        debug!(address = %candidate, %error, "reconnect attempt failed");
                        last_error = error;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn open_session(&self, address: &str) -> EngineResult<Arc<Session>> {
        let channel = self.connector.open(address).await?;
        if let Some(certificate) = channel.peer_certificate() {
            if let Verdict::Reject(reason) = self.validator.validate(&certificate) {
                warn!(%address, %reason, "certificate rejected");
                return Err(EngineError::CertificateRejected(reason));
            }
        }
        Ok(Arc::new(Session::new(channel)))
    }

    async fn login_following_redirect(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> EngineResult<Arc<Session>> {
        let session = self.open_session(address).await?;
        let next = match session.login(credentials).await {
            Ok(()) => return Ok(session),
            Err(EngineError::Redirect { address: next }) => next,
            Err(error) => return Err(error),
        };

        info!(from = %address, to = %next, "following coordinator redirect");
        let session = self.open_session(&next).await?;
        match session.login(credentials).await {
            Ok(()) => Ok(session),
            Err(EngineError::Redirect { address }) => {
                warn!(%address, "coordinator redirected twice");
                Err(EngineError::RedirectLoop { address })
            }
            Err(error) => Err(error),
        }
    }

    async fn establish(self: &Arc<Self>, address: &str, credentials: &Credentials) -> EngineResult<()> {
        let session = self.login_following_redirect(address, credentials).await?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = Transport::new(Arc::clone(&session), self.config.poll_grace);
        let synchronizer = Arc::new(EventSynchronizer::new(
            Arc::clone(&self.store),
            transport.clone(),
            self.config.tracked_classes.clone(),
            self.config.poll_timeout,
            epoch,
            self.notices.clone(),
            Arc::clone(&self.membership),
        ));

        if let Err(error) = synchronizer.full_load().await {
            warn!(address = session.address(), %error, "full load failed");
            session.logout().await;
            return Err(error);
        }

        *self.address.write() = session.address().to_string();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let previous = self.live.write().replace(Live {
            session,
            transport,
            synchronizer: Arc::clone(&synchronizer),
            shutdown,
        });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
        }
        self.spawn_poller(synchronizer, shutdown_rx);
        Ok(())
    }

    fn spawn_poller(self: &Arc<Self>, synchronizer: Arc<EventSynchronizer>, shutdown: watch::Receiver<bool>) {
        let connection: Weak<Self> = Arc::downgrade(self);
        let epoch = synchronizer.epoch();
        tokio::spawn(async move {
            match synchronizer.run(shutdown).await {
                SyncExit::Shutdown => debug!(epoch, "poller exited"),
                SyncExit::ConnectionLost(error) => {
                    if let Some(connection) = connection.upgrade() {
                        connection.on_connection_lost(epoch, error).await;
                    }
                }
            }
        });
    }

    async fn on_connection_lost(self: Arc<Self>, epoch: u64, error: EngineError) {
        // A newer session already replaced the one that failed.
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        let failed = self.live.write().take();
        if let Some(live) = failed {
            live.session.invalidate();
        }
        self.store.mark_stale();

        if !self.config.auto_reconnect || self.closed.load(Ordering::SeqCst) {
            debug!(%error, "not reconnecting");
            return;
        }
        if let Err(reconnect_error) = self.reconnect().await {
            warn!(%reconnect_error, "reconnect failed; store stays stale");
            let _ = self.notices.send(SyncNotice::ConnectionLost {
                reason: reconnect_error.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish()
    }
}
