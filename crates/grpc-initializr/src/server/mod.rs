//! Server lifecycle management.
//!
//! ## Submodules
//!
//! - [`config`] - Startup configuration, concurrency modes and defaults.
//! - [`handler`] - Deferred registration of tonic services per mode.
//! - [`lifecycle`] - The [`GrpcServer`] state machine and its
//!   [`ServerHandle`].

pub mod config;
pub mod handler;
pub mod lifecycle;
mod shutdown;

pub use config::{DrainMode, ServerConfig, ServerOptions, ServerType};
pub use handler::{Handlers, ServiceHandler};
pub use lifecycle::{GrpcServer, LifecycleState, ServerHandle};
