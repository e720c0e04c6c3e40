//! Server lifecycle state machine.
//!
//! A [`GrpcServer`] moves through
//! `CONSTRUCTED -> BOUND -> SERVING -> STOPPING -> STOPPED`:
//!
//! - [`GrpcServer::new`] validates the handler set and resolves the worker
//!   count for the selected [`ServerType`].
//! - [`GrpcServer::bind`] acquires the TCP listener.
//! - [`GrpcServer::serve`] (blocking) or [`GrpcServer::serve_async`]
//!   (cooperative) registers the handlers of the active mode and runs the
//!   accept loop until a stop is requested.
//! - [`ServerHandle::stop`] requests a graceful stop from any thread.
//!
//! Both serve paths share the same serving core; the concurrency mode only
//! decides which runtime drives it. That runtime belongs to the server and is
//! dropped before `STOPPED` is reported, so no connection outlives a stop.

use super::config::{DrainMode, MIN_THREAD_POOL_WORKERS, ServerConfig, ServerType};
use super::handler::{Handlers, ServiceHandler};
use super::shutdown::stop_on_signal;
use crate::error::{Error, Result};
use crate::telemetry::Logger;
use core::fmt;
use core::time::Duration;
use portable_atomic::{AtomicU64, Ordering};
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;

/// Lifecycle state of a [`GrpcServer`].
///
/// States are ordered; a server only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Constructed,
    Bound,
    Serving,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Constructed => "CONSTRUCTED",
            Self::Bound => "BOUND",
            Self::Serving => "SERVING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        })
    }
}

struct Shared {
    state: watch::Sender<LifecycleState>,
    shutdown: CancellationToken,
    grace_millis: AtomicU64,
}

impl Shared {
    fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Moves `from -> to` atomically. Returns `false` if the state changed
    /// underneath us (e.g. a concurrent stop).
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self) {
        self.state.send_replace(LifecycleState::Stopped);
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_millis.load(Ordering::Acquire))
    }
}

/// Cloneable handle used to observe and stop a [`GrpcServer`] from other
/// threads or tasks.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn state(&self) -> LifecycleState {
        self.shared.current()
    }

    /// Subscribes to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state.subscribe()
    }

    /// Waits until the server reaches `target`, or `STOPPED` (terminal).
    ///
    /// Returns the state that ended the wait.
    pub async fn wait_for(&self, target: LifecycleState) -> LifecycleState {
        let mut rx = self.subscribe();
        match rx
            .wait_for(|state| *state == target || *state == LifecycleState::Stopped)
            .await
        {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Requests a graceful stop.
    ///
    /// In-flight calls get up to `grace` to finish (see [`DrainMode`]).
    /// Stopping is monotonic: the first request wins and later calls are
    /// no-ops. A server that is not serving yet goes straight to `STOPPED`.
    pub fn stop(&self, grace: Duration) {
        tracing::info!(
            grace_secs = grace.as_secs_f64(),
            "Stopping gRPC server gracefully"
        );

        let grace_millis = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        let shared = &self.shared;
        let changed = shared.state.send_if_modified(|state| match *state {
            LifecycleState::Constructed | LifecycleState::Bound => {
                *state = LifecycleState::Stopped;
                true
            }
            LifecycleState::Serving => {
                shared.grace_millis.store(grace_millis, Ordering::Release);
                *state = LifecycleState::Stopping;
                true
            }
            LifecycleState::Stopping | LifecycleState::Stopped => false,
        });

        if !changed {
            tracing::debug!("Stop already requested");
        }
        shared.shutdown.cancel();
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// A tonic server bootstrapped in thread-pool or cooperative mode.
pub struct GrpcServer {
    config: ServerConfig,
    handlers: Handlers,
    workers: Option<usize>,
    listener: Option<StdTcpListener>,
    local_addr: Option<SocketAddr>,
    dispatch: Option<Dispatch>,
    shared: Arc<Shared>,
}

impl GrpcServer {
    /// Constructs a server without touching the network.
    ///
    /// In thread-pool mode the worker count is raised to
    /// [`MIN_THREAD_POOL_WORKERS`] if lower. In cooperative mode it is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no handler is registered for
    /// either mode.
    pub fn new(config: ServerConfig, handlers: Handlers) -> Result<Self> {
        if handlers.is_empty() {
            return Err(Error::configuration(
                "no handler registered: define at least one service handler",
            ));
        }

        let server_type = config.server_type;
        tracing::info!("gRPC server type: {server_type}");

        let workers = server_type.effective_workers(config.workers);
        match workers {
            Some(effective) if effective != config.workers => {
                tracing::warn!(
                    requested = config.workers,
                    effective,
                    "Thread-pool servers run with at least {MIN_THREAD_POOL_WORKERS} workers"
                );
            }
            Some(_) => {}
            None => {
                tracing::info!(
                    "Workers setting has no effect on ASYNC servers (calls run as tasks on a single event loop)"
                );
            }
        }

        let (state, _) = watch::channel(LifecycleState::Constructed);
        Ok(Self {
            config,
            handlers,
            workers,
            listener: None,
            local_addr: None,
            dispatch: None,
            shared: Arc::new(Shared {
                state,
                shutdown: CancellationToken::new(),
                grace_millis: AtomicU64::new(0),
            }),
        })
    }

    /// Routes lifecycle diagnostics through `logger` instead of the process
    /// default.
    pub fn with_logger(mut self, logger: &Logger) -> Self {
        self.dispatch = Some(logger.dispatch().clone());
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Worker threads used in thread-pool mode; `None` in cooperative mode.
    pub fn effective_workers(&self) -> Option<usize> {
        self.workers
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.current()
    }

    /// Address the listener is bound to, once `BOUND`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Binds the listener to the configured endpoint.
    ///
    /// On failure the server stays `CONSTRUCTED`.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalState`] unless `CONSTRUCTED`.
    /// - [`Error::Configuration`] if the active mode has no handler.
    /// - [`Error::Bind`] if the endpoint cannot be bound (e.g. port in use).
    pub fn bind(&mut self) -> Result<SocketAddr> {
        self.expect_state(LifecycleState::Constructed, "bind")?;

        let mode = self.config.server_type;
        if self.handlers.count(mode) == 0 {
            return Err(Error::configuration(format!(
                "no handler registered for {mode} server"
            )));
        }

        let endpoint = self.config.endpoint();
        let listener = StdTcpListener::bind(endpoint.as_str())
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .map_err(|source| Error::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        if !self
            .shared
            .transition(LifecycleState::Constructed, LifecycleState::Bound)
        {
            return Err(Error::IllegalState {
                operation: "bind",
                state: self.shared.current(),
            });
        }

        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.in_scope(|| tracing::info!(%local_addr, "Bound gRPC server to {endpoint}"));
        Ok(local_addr)
    }

    /// Serves until stopped, blocking the calling thread.
    ///
    /// Thread-pool servers run on a multi-threaded runtime with
    /// [`effective_workers`](Self::effective_workers) threads; cooperative
    /// servers run on a single-threaded runtime. The runtime, and with it
    /// every connection task, is torn down before `STOPPED` is reported.
    /// Must not be called from within an async context.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalState`] unless `BOUND`.
    /// - [`Error::Configuration`] if the active mode has no handler.
    /// - [`Error::Transport`] if the transport fails while serving.
    pub fn serve(&mut self) -> Result<()> {
        self.expect_state(LifecycleState::Bound, "serve")?;
        let runtime = build_runtime(self.workers)?;
        let core = self.prepare()?;
        core.drive(runtime, self.subscriber())
    }

    /// Serves until stopped, suspending the calling task.
    ///
    /// Only available in cooperative mode; thread-pool servers own their
    /// runtime and are driven by [`serve`](Self::serve). The transport runs
    /// on a single-threaded event loop owned by the server, so a stop
    /// cancels every connection regardless of the caller's runtime. Dropping
    /// the returned future stops the server without a grace period.
    ///
    /// # Errors
    ///
    /// Same as [`serve`](Self::serve), plus [`Error::Configuration`] when
    /// called on a thread-pool server.
    pub async fn serve_async(&mut self) -> Result<()> {
        if self.config.server_type != ServerType::Cooperative {
            return Err(Error::configuration(
                "serve_async requires an ASYNC server; use serve() for SYNC servers",
            ));
        }
        self.expect_state(LifecycleState::Bound, "serve")?;

        let core = self.prepare()?;
        let dispatch = self.subscriber();
        let (tx, rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("grpc-event-loop".to_string())
            .spawn(move || {
                let result = match build_runtime(None) {
                    Ok(runtime) => core.drive(runtime, dispatch),
                    Err(e) => {
                        core.shared.finish();
                        Err(e)
                    }
                };
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            self.shared.finish();
            return Err(e.into());
        }

        let guard = self.shared.shutdown.clone().drop_guard();
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => {
                self.shared.finish();
                Err(Error::Io(io::Error::other("gRPC event loop terminated abnormally")))
            }
        };
        let _ = guard.disarm();
        result
    }

    /// Moves everything the serving core needs out of the server.
    fn prepare(&mut self) -> Result<ServeCore> {
        let mode = self.config.server_type;
        if self.handlers.count(mode) == 0 {
            return Err(Error::configuration(format!(
                "no handler registered for {mode} server"
            )));
        }

        let listener = self.listener.take().ok_or(Error::IllegalState {
            operation: "serve",
            state: self.shared.current(),
        })?;

        Ok(ServeCore {
            config: self.config.clone(),
            workers: self.workers,
            handlers: self.handlers.take(mode),
            listener,
            local_addr: self.local_addr,
            shared: Arc::clone(&self.shared),
        })
    }

    fn subscriber(&self) -> Dispatch {
        self.dispatch
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone))
    }

    fn expect_state(&self, expected: LifecycleState, operation: &'static str) -> Result<()> {
        let state = self.shared.current();
        if state == expected {
            Ok(())
        } else {
            Err(Error::IllegalState { operation, state })
        }
    }

    fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

impl fmt::Debug for GrpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcServer")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("workers", &self.workers)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn build_runtime(workers: Option<usize>) -> Result<Runtime> {
    let runtime = match workers {
        Some(workers) => tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("grpc-worker")
            .enable_all()
            .build()?,
        None => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };
    Ok(runtime)
}

/// The parts of a bound server that the serving core runs with.
struct ServeCore {
    config: ServerConfig,
    workers: Option<usize>,
    handlers: Vec<ServiceHandler>,
    listener: StdTcpListener,
    local_addr: Option<SocketAddr>,
    shared: Arc<Shared>,
}

impl ServeCore {
    /// Runs the serving core to completion on `runtime`, then drops the
    /// runtime before reporting `STOPPED`.
    fn drive(self, runtime: Runtime, dispatch: Dispatch) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let result = runtime.block_on(self.run().with_subscriber(dispatch.clone()));

        // tonic spawns one task per connection; they die with the runtime.
        drop(runtime);
        shared.finish();

        tracing::dispatcher::with_default(&dispatch, || match &result {
            Ok(()) => tracing::info!("gRPC server stopped"),
            Err(e) => tracing::error!("gRPC server stopped with error: {e}"),
        });
        result
    }

    async fn run(self) -> Result<()> {
        let mode = self.config.server_type;
        let listener = tokio::net::TcpListener::from_std(self.listener)?;

        let names: Vec<&'static str> = self.handlers.iter().map(ServiceHandler::name).collect();
        let mut routes = RoutesBuilder::default();
        for handler in self.handlers {
            handler.register(&self.config.options, &mut routes);
        }
        let health = if self.config.health_service {
            let (reporter, service) = tonic_health::server::health_reporter();
            routes.add_service(service);
            Some(reporter)
        } else {
            None
        };

        if !self
            .shared
            .transition(LifecycleState::Bound, LifecycleState::Serving)
        {
            return Err(Error::IllegalState {
                operation: "serve",
                state: self.shared.current(),
            });
        }

        if let Some(reporter) = &health {
            set_status(reporter, &names, ServingStatus::Serving).await;
        }

        let endpoint = self
            .local_addr
            .map_or_else(|| self.config.endpoint(), |addr| addr.to_string());
        tracing::info!(
            server_type = %mode,
            workers = ?self.workers,
            services = ?names,
            "Started gRPC server at {endpoint}"
        );
        match self.config.options.service_config_json() {
            Ok(json) => tracing::debug!(service_config = %json, "Declared service configuration"),
            Err(e) => tracing::warn!("Failed to render service configuration: {e}"),
        }
        tracing::info!("Serving...");

        let signal_task = self.config.handle_signals.then(|| {
            let handle = ServerHandle {
                shared: Arc::clone(&self.shared),
            };
            tokio::spawn(stop_on_signal(handle, self.config.grace_period).with_current_subscriber())
        });

        let shutdown = self.shared.shutdown.clone();
        let server = Server::builder()
            .add_routes(routes.routes())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.clone().cancelled_owned(),
            );
        tokio::pin!(server);

        let result = tokio::select! {
            res = &mut server => res.map_err(Error::from),
            () = shutdown.cancelled() => {
                if let Some(reporter) = &health {
                    set_status(reporter, &names, ServingStatus::NotServing).await;
                }

                let grace = self.shared.grace();
                match self.config.drain_mode {
                    DrainMode::Graceful => match tokio::time::timeout(grace, &mut server).await {
                        Ok(res) => res.map_err(Error::from),
                        Err(_) => {
                            tracing::warn!(
                                grace_secs = grace.as_secs_f64(),
                                "Grace period elapsed with calls in flight, tearing down transport"
                            );
                            Ok(())
                        }
                    },
                    DrainMode::Immediate => {
                        tracing::info!("Tearing down transport without draining in-flight calls");
                        Ok(())
                    }
                }
            }
        };

        if let Some(task) = signal_task {
            task.abort();
        }
        result
    }
}

async fn set_status(reporter: &HealthReporter, names: &[&'static str], status: ServingStatus) {
    reporter.set_service_status("", status).await;
    for name in names {
        reporter.set_service_status(*name, status).await;
    }
}
