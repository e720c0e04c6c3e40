use crate::service_config::ServiceConfig;
use core::fmt;
use core::time::Duration;

/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default bind port.
pub const DEFAULT_PORT: u16 = 45752;
/// Default number of worker threads requested for thread-pool servers.
pub const DEFAULT_WORKERS: usize = 20;
/// Thread-pool servers never run with fewer workers than this.
pub const MIN_THREAD_POOL_WORKERS: usize = 10;
/// Default limit for sent and received messages (100 MiB).
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 100 * 1024 * 1024;
/// Default grace period granted to in-flight calls on stop.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Concurrency model of a server, fixed for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
pub enum ServerType {
    /// Calls are dispatched on a fixed-size pool of OS threads.
    #[default]
    #[value(name = "SYNC", alias = "thread-pool")]
    ThreadPool,
    /// Calls are multiplexed as tasks on a single-threaded event loop.
    #[value(name = "ASYNC", alias = "cooperative")]
    Cooperative,
}

impl ServerType {
    /// Returns the number of worker threads a server of this type runs with.
    ///
    /// Thread-pool servers are raised to [`MIN_THREAD_POOL_WORKERS`];
    /// cooperative servers have no pool and return `None`.
    pub fn effective_workers(self, requested: usize) -> Option<usize> {
        match self {
            Self::ThreadPool => Some(requested.max(MIN_THREAD_POOL_WORKERS)),
            Self::Cooperative => None,
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ThreadPool => "SYNC",
            Self::Cooperative => "ASYNC",
        })
    }
}

/// What happens to in-flight calls once a stop has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainMode {
    /// Wait for in-flight calls to finish, up to the grace period, then tear
    /// the transport down.
    #[default]
    Graceful,
    /// Tear the transport down immediately, cancelling outstanding calls.
    Immediate,
}

/// Wire-level options handed to every registered service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    pub max_send_message_length: usize,
    pub max_receive_message_length: usize,
    pub service_config: ServiceConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_send_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            max_receive_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            service_config: ServiceConfig::default(),
        }
    }
}

impl ServerOptions {
    /// The service configuration document as compact JSON.
    pub fn service_config_json(&self) -> crate::Result<String> {
        self.service_config.to_json()
    }
}

/// Startup configuration of a [`GrpcServer`](super::GrpcServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub server_type: ServerType,
    /// Requested worker threads. Only used in thread-pool mode.
    pub workers: usize,
    pub options: ServerOptions,
    pub drain_mode: DrainMode,
    /// Grace period used when a termination signal stops the server.
    pub grace_period: Duration,
    /// Registers the standard `grpc.health.v1.Health` service.
    pub health_service: bool,
    /// Stops the server on Ctrl+C / SIGTERM.
    pub handle_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            server_type: ServerType::default(),
            workers: DEFAULT_WORKERS,
            options: ServerOptions::default(),
            drain_mode: DrainMode::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            health_service: true,
            handle_signals: true,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16, server_type: ServerType) -> Self {
        Self {
            host: host.into(),
            port,
            server_type,
            ..Self::default()
        }
    }

    /// The `host:port` endpoint, bracketing bare IPv6 hosts.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
