//! Deferred service registration.
//!
//! A [`ServiceHandler`] wraps a tonic service (anything generated by
//! `tonic-build`, or the health/reflection services) together with the code
//! that adds it to the transport's route table. Registration is deferred until
//! the server starts serving so that handlers can be built from the final
//! [`ServerOptions`] (e.g. to apply message size limits).

use super::config::{ServerOptions, ServerType};
use core::convert::Infallible;
use core::fmt;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tower::Service;

type Register = Box<dyn FnOnce(&ServerOptions, &mut RoutesBuilder) + Send>;

/// A named gRPC service waiting to be registered with the transport.
pub struct ServiceHandler {
    name: &'static str,
    register: Register,
}

impl ServiceHandler {
    /// Wraps a ready-to-serve service.
    pub fn new<S>(service: S) -> Self
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self::with_options(move |_| service)
    }

    /// Builds the service from the server's options when it starts serving.
    ///
    /// ```ignore
    /// ServiceHandler::with_options(|opts| {
    ///     GreeterServer::new(MyGreeter::default())
    ///         .max_decoding_message_size(opts.max_receive_message_length)
    ///         .max_encoding_message_size(opts.max_send_message_length)
    /// })
    /// ```
    pub fn with_options<S, F>(factory: F) -> Self
    where
        F: FnOnce(&ServerOptions) -> S + Send + 'static,
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            name: S::NAME,
            register: Box::new(move |options, routes| {
                routes.add_service(factory(options));
            }),
        }
    }

    /// Fully-qualified gRPC service name (`package.Service`).
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn register(self, options: &ServerOptions, routes: &mut RoutesBuilder) {
        (self.register)(options, routes);
    }
}

impl fmt::Debug for ServiceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Handlers supplied by the embedding application, one list per concurrency
/// mode. Only the list matching the server's mode is registered.
#[derive(Debug, Default)]
pub struct Handlers {
    thread_pool: Vec<ServiceHandler>,
    cooperative: Vec<ServiceHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler served in thread-pool mode.
    pub fn thread_pool(mut self, handler: ServiceHandler) -> Self {
        self.thread_pool.push(handler);
        self
    }

    /// Adds a handler served in cooperative mode.
    pub fn cooperative(mut self, handler: ServiceHandler) -> Self {
        self.cooperative.push(handler);
        self
    }

    /// Adds a handler to the list of the given mode.
    pub fn for_mode(self, mode: ServerType, handler: ServiceHandler) -> Self {
        match mode {
            ServerType::ThreadPool => self.thread_pool(handler),
            ServerType::Cooperative => self.cooperative(handler),
        }
    }

    /// `true` when neither mode has a handler.
    pub fn is_empty(&self) -> bool {
        self.thread_pool.is_empty() && self.cooperative.is_empty()
    }

    /// Number of handlers registered for `mode`.
    pub fn count(&self, mode: ServerType) -> usize {
        self.list(mode).len()
    }

    /// Names of the handlers registered for `mode`, in registration order.
    pub fn names(&self, mode: ServerType) -> Vec<&'static str> {
        self.list(mode).iter().map(ServiceHandler::name).collect()
    }

    pub(crate) fn take(&mut self, mode: ServerType) -> Vec<ServiceHandler> {
        match mode {
            ServerType::ThreadPool => core::mem::take(&mut self.thread_pool),
            ServerType::Cooperative => core::mem::take(&mut self.cooperative),
        }
    }

    fn list(&self, mode: ServerType) -> &[ServiceHandler] {
        match mode {
            ServerType::ThreadPool => &self.thread_pool,
            ServerType::Cooperative => &self.cooperative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic_health::server::health_reporter;

    fn health_handler() -> ServiceHandler {
        let (_reporter, service) = health_reporter();
        ServiceHandler::new(service)
    }

    #[tokio::test]
    async fn handlers_are_kept_per_mode() {
        let handlers = Handlers::new()
            .thread_pool(health_handler())
            .for_mode(ServerType::Cooperative, health_handler())
            .cooperative(health_handler());

        assert!(!handlers.is_empty());
        assert_eq!(handlers.count(ServerType::ThreadPool), 1);
        assert_eq!(handlers.count(ServerType::Cooperative), 2);
        assert_eq!(
            handlers.names(ServerType::ThreadPool),
            vec!["grpc.health.v1.Health"]
        );
    }

    #[test]
    fn empty_handlers() {
        let mut handlers = Handlers::default();
        assert!(handlers.is_empty());
        assert!(handlers.take(ServerType::ThreadPool).is_empty());
    }

    #[tokio::test]
    async fn factory_receives_options() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handler = ServiceHandler::with_options(move |opts: &ServerOptions| {
            tx.send(opts.max_receive_message_length).unwrap();
            let (_reporter, service) = health_reporter();
            service
        });
        assert_eq!(handler.name(), "grpc.health.v1.Health");

        let options = ServerOptions {
            max_receive_message_length: 42,
            ..ServerOptions::default()
        };
        let mut routes = RoutesBuilder::default();
        handler.register(&options, &mut routes);
        assert_eq!(rx.recv().unwrap(), 42);
    }
}
