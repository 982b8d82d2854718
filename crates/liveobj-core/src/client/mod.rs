//! Client side: connection lifecycle and the public handle applications use.
//!
//! A [`Client`] owns a reconnect loop. Each successful connection gets a
//! fresh session (new proxy cache, new type table) and a fresh root proxy;
//! proxies from an earlier connection stop working once it drops.

mod proxy;
mod session;
mod types;

pub use proxy::RemoteProxy;
pub use session::ListenerId;
pub use types::{HookLibrary, LocalType};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use self::session::{EventListener, Session};
use crate::cancel::CancellationToken;
use crate::config::ClientOptions;
use crate::error::{LiveObjError, Result};
use crate::protocol::BufferId;
use crate::transport::Connector;
use crate::value::Value;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    /// Channel open, root object not fetched yet.
    Connected,
    /// Root proxy available; calls can be made.
    Ready,
    Disconnected,
}

struct Connection {
    session: Arc<Session>,
    root: Arc<RemoteProxy>,
}

struct ClientInner {
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    hooks: Arc<HookLibrary>,
    status: watch::Sender<ConnectionStatus>,
    current: RwLock<Option<Connection>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// Handle to a (re)connecting object client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(connector: impl Connector, options: ClientOptions) -> Self {
        Self::with_hooks(connector, options, HookLibrary::new())
    }

    /// Client that also knows the serializer hooks in `hooks`.
    pub fn with_hooks(connector: impl Connector, options: ClientOptions, hooks: HookLibrary) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                connector: Arc::new(connector),
                options,
                hooks: Arc::new(hooks),
                status,
                current: RwLock::new(None),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Build a client, start it and wait until it is ready.
    pub async fn connect(connector: impl Connector, options: ClientOptions) -> Result<Self> {
        let client = Self::new(connector, options);
        client.start();
        client.wait_ready().await?;
        Ok(client)
    }

    /// Spawn the connection loop. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(connection_loop(self.inner.clone()));
    }

    /// Wait for the `Ready` status, bounded by the connect timeout.
    pub async fn wait_ready(&self) -> Result<()> {
        let limit = self.inner.options.connect_timeout;
        let mut status = self.inner.status.subscribe();
        tokio::time::timeout(limit, status.wait_for(|s| *s == ConnectionStatus::Ready))
            .await
            .map_err(|_| LiveObjError::Timeout(limit))?
            .map_err(|_| LiveObjError::Disconnected)?;
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Status changes as they happen.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Root proxy of the current connection.
    pub fn root(&self) -> Result<Arc<RemoteProxy>> {
        self.with_connection(|c| c.root.clone())
    }

    /// Fetch an object registered under `name` on the server.
    pub async fn get_object(&self, name: &str) -> Result<Arc<RemoteProxy>> {
        self.session()?.get_object(Value::from(name)).await
    }

    /// Fetch any object the server still tracks, by id.
    pub async fn get_object_by_id(&self, id: u64) -> Result<Arc<RemoteProxy>> {
        self.session()?.get_object(Value::from(id)).await
    }

    /// Call `listener` whenever `proxy` fires `event`. Tracks the proxy.
    pub async fn listen<F>(&self, proxy: &Arc<RemoteProxy>, event: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&RemoteProxy, &[Value]) + Send + Sync + 'static,
    {
        let listener: EventListener = Arc::new(listener);
        self.session()?.listen(proxy, event, listener).await
    }

    /// Remove one listener.
    pub async fn unlisten(&self, proxy: &Arc<RemoteProxy>, event: &str, listener: ListenerId) -> Result<()> {
        self.session()?.unlisten(proxy, event, Some(listener)).await
    }

    /// Remove every listener for `event`.
    pub async fn unlisten_event(&self, proxy: &Arc<RemoteProxy>, event: &str) -> Result<()> {
        self.session()?.unlisten(proxy, event, None).await
    }

    /// Remove every listener on `proxy`.
    pub async fn unlisten_all(&self, proxy: &Arc<RemoteProxy>) -> Result<()> {
        self.session()?.unlisten_all(proxy).await
    }

    /// Keep `proxy` alive on the server even when the application drops it.
    pub fn track(&self, proxy: &Arc<RemoteProxy>) -> Result<()> {
        self.session()?.track(proxy)
    }

    /// Undo [`Client::track`], removing its listeners too.
    pub async fn untrack(&self, proxy: &Arc<RemoteProxy>) -> Result<()> {
        self.session()?.untrack(proxy).await
    }

    /// Re-read the snapshot of `proxy` from the server.
    pub async fn refresh(&self, proxy: &Arc<RemoteProxy>) -> Result<()> {
        self.session()?.refresh(proxy).await
    }

    /// Send a standalone binary buffer. The server claims it by id with
    /// [`CallContext::take_buffer`](crate::CallContext::take_buffer).
    pub fn send_binary(&self, bytes: Bytes) -> Result<BufferId> {
        self.session()?.send_binary(bytes)
    }

    /// Claim a standalone buffer the server sent to this connection.
    /// Unclaimed buffers are dropped oldest first once too many pile up.
    pub fn take_buffer(&self, id: BufferId) -> Option<Bytes> {
        self.session().ok()?.take_buffer(id)
    }

    /// Close the connection and stop reconnecting.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(connection) = self.take_connection() {
            connection.session.close();
        }
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.with_connection(|c| c.session.clone())
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> Result<T> {
        let current = self.inner.current.read().unwrap_or_else(|e| e.into_inner());
        current.as_ref().map(f).ok_or(LiveObjError::Disconnected)
    }

    fn take_connection(&self) -> Option<Connection> {
        self.inner
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("target", &self.inner.connector.describe())
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// Connection loop
// ============================================================================

async fn connection_loop(inner: Arc<ClientInner>) {
    let target = inner.connector.describe();

    while !inner.shutdown.is_cancelled() {
        inner.status.send_replace(ConnectionStatus::Connecting);
        match run_connection(&inner).await {
            Ok(()) => info!("Connection to {} closed", target),
            Err(e) => warn!("Connection to {} failed: {}", target, e),
        }

        *inner.current.write().unwrap_or_else(|e| e.into_inner()) = None;
        inner.status.send_replace(ConnectionStatus::Disconnected);

        tokio::select! {
            _ = tokio::time::sleep(inner.options.reconnect_delay) => {}
            _ = inner.shutdown.cancelled() => break,
        }
        debug!("Reconnecting to {}", target);
    }
    debug!("Connection loop for {} stopped", target);
}

/// One connection, from connect until the channel closes.
async fn run_connection(inner: &ClientInner) -> Result<()> {
    let channel = tokio::select! {
        channel = inner.connector.connect() => channel?,
        _ = inner.shutdown.cancelled() => return Ok(()),
    };
    inner.status.send_replace(ConnectionStatus::Connected);

    let session = Session::new(channel.outgoing, inner.options.clone(), inner.hooks.clone());
    let reader = tokio::spawn(session.clone().run(channel.incoming));
    tokio::spawn(session.clone().ping_loop());

    let root = match session.fetch_root().await {
        Ok(root) => root,
        Err(e) => {
            session.close();
            let _ = reader.await;
            return Err(e);
        }
    };

    *inner.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Connection {
        session: session.clone(),
        root,
    });
    // shutdown may have raced with the bootstrap
    if inner.shutdown.is_cancelled() {
        session.close();
    }
    inner.status.send_replace(ConnectionStatus::Ready);
    info!("Connected to {}", inner.connector.describe());

    let _ = reader.await;
    Ok(())
}
