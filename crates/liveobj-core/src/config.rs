//! Centralized configuration for liveobj.
//!
//! Compile-time defaults live on the `*Config` structs; the runtime knobs a
//! host can change are gathered in [`ServerOptions`] and [`ClientOptions`].

use std::time::Duration;

/// Wire-level constants shared by both sides.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Id of the root object, pinned for the life of the server.
    pub const ROOT_OBJECT_ID: u64 = 0;
    pub const ROOT_TYPE_NAME: &'static str = "Root";
    /// `_type` tag of a binary buffer reference.
    pub const BUFFER_TYPE_NAME: &'static str = "Buffer";
    pub const DATE_TYPE_NAME: &'static str = "Date";
    pub const MAP_TYPE_NAME: &'static str = "Map";
    /// Nesting limit for by-value payloads; guards against cyclic value graphs.
    pub const MAX_VALUE_DEPTH: usize = 128;
    /// Nesting limit for client-method expressions.
    pub const MAX_EXPRESSION_DEPTH: usize = 128;
    /// Received buffers kept per connection before the oldest is dropped.
    pub const MAX_STORED_BUFFERS: usize = 64;
}

/// Server defaults.
pub struct ServerConfig;

impl ServerConfig {
    pub const GC_INTERVAL: Duration = Duration::from_secs(60);
    /// A tracked object survives this long after its last ping or reference.
    pub const GC_TIMEOUT: Duration = Duration::from_secs(180);
    pub const MAX_CONNECTIONS: usize = 256;
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 4000;
    pub const DEFAULT_PATH: &'static str = "/liveobj";
}

/// Client defaults.
pub struct ClientConfig;

impl ClientConfig {
    pub const PING_INTERVAL: Duration = Duration::from_secs(60);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Runtime settings for a [`crate::Server`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub gc_interval: Duration,
    pub gc_timeout: Duration,
    pub max_connections: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            gc_interval: ServerConfig::GC_INTERVAL,
            gc_timeout: ServerConfig::GC_TIMEOUT,
            max_connections: ServerConfig::MAX_CONNECTIONS,
        }
    }
}

impl ServerOptions {
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_gc_timeout(mut self, timeout: Duration) -> Self {
        self.gc_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Runtime settings for a [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    /// `None` waits for a result for as long as the session lives.
    pub call_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Attach the calling method name to every `invoke` as `debugInfo`.
    pub debug_mode: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ping_interval: ClientConfig::PING_INTERVAL,
            reconnect_delay: ClientConfig::RECONNECT_DELAY,
            call_timeout: Some(ClientConfig::CALL_TIMEOUT),
            connect_timeout: ClientConfig::CONNECT_TIMEOUT,
            debug_mode: false,
        }
    }
}

impl ClientOptions {
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }
}
