//! # `grpc-initializr`: gRPC Server Bootstrap
//!
//! `grpc-initializr` stands up [`tonic`] gRPC servers with the boilerplate
//! every service needs already in place:
//!
//! - A declarative retry/timeout policy published as a gRPC service
//!   configuration document.
//! - A server lifecycle (`CONSTRUCTED → BOUND → SERVING → STOPPING →
//!   STOPPED`) in either a thread-pool or a cooperative concurrency model.
//! - Structured logging through a process-wide or explicitly passed logger.
//! - Request introspection and payload normalization helpers for service
//!   implementations.
//!
//! ## Usage
//!
//! Register your generated services per concurrency mode and hand them to
//! the CLI bootstrap:
//!
//! ```ignore
//! use grpc_initializr::{Handlers, ServiceHandler, run_grpc_cli};
//!
//! fn main() -> grpc_initializr::Result<()> {
//!     let handlers = Handlers::new()
//!         .thread_pool(ServiceHandler::new(PredictorServer::new(Predictor)))
//!         .cooperative(ServiceHandler::new(PredictorServer::new(Predictor)));
//!     run_grpc_cli(handlers)
//! }
//! ```
//!
//! ```bash
//! my-service --host 0.0.0.0 --port 50051 --server-type ASYNC
//! ```
//!
//! The `grpc.health.v1.Health` service is registered automatically and
//! reports `SERVING` for as long as the server accepts calls.
//!
//! ## Module Overview
//!
//! - [`service_config`] - Retry policy and service configuration document.
//! - [`server`] - Lifecycle manager, handlers and startup configuration.
//! - [`telemetry`] - Logger provider.
//! - [`net`] - Peer extraction and request logging.
//! - [`payload`] - Schema-driven payload sanitization.
//! - [`cli`] - Command-line bootstrap.
//! - [`error`] - Error type and its mapping to gRPC status codes.

pub mod cli;
pub mod error;
pub mod net;
pub mod payload;
pub mod server;
pub mod service_config;
pub mod telemetry;

pub use cli::{CliArgs, expand_legacy_flags, run_grpc_cli};
pub use error::{Error, Result};
pub use server::{
    DrainMode, GrpcServer, Handlers, LifecycleState, ServerConfig, ServerHandle, ServerOptions,
    ServerType, ServiceHandler,
};
pub use service_config::{MethodConfig, MethodSelector, RetryPolicy, ServiceConfig};
pub use telemetry::{Logger, LoggerOptions};
