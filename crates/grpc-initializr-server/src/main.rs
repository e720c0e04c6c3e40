#![doc = include_str!("../README.md")]

use anyhow::Context;
use grpc_initializr::{Handlers, ServiceHandler, run_grpc_cli};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(tonic_reflection::pb::v1::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build the reflection service")?;

    let handlers = Handlers::new()
        .thread_pool(ServiceHandler::new(reflection.clone()))
        .cooperative(ServiceHandler::new(reflection));

    run_grpc_cli(handlers).context("gRPC server failed")
}
