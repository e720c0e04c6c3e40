#![doc = include_str!("../README.md")]

use anyhow::{Context, bail};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Generate gRPC client and server stubs from a Protocol Buffers definition.
#[derive(Parser, Debug, Clone)]
#[command(name = "proto-initializr", version)]
struct Args {
    /// Path of the `.proto` file.
    #[arg(short = 'p', long, visible_alias = "pp")]
    proto_path: PathBuf,

    /// Directory receiving the generated code. Defaults to the directory of
    /// the proto file.
    #[arg(short, long)]
    out_dir: Option<PathBuf>,
}

/// Resolved inputs of a generation run.
#[derive(Debug, PartialEq, Eq)]
struct Plan {
    proto: PathBuf,
    include: PathBuf,
    out_dir: PathBuf,
}

impl TryFrom<Args> for Plan {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if !args.proto_path.is_file() {
            bail!("Proto file {} does not exist", args.proto_path.display());
        }

        let include = match args.proto_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let out_dir = args.out_dir.unwrap_or_else(|| include.clone());

        Ok(Self {
            proto: args.proto_path,
            include,
            out_dir,
        })
    }
}

/// Creates `dir` and an empty `mod.rs` inside it if missing.
///
/// Returns whether the marker was created.
fn ensure_package_marker(dir: &Path) -> std::io::Result<bool> {
    let marker = dir.join("mod.rs");
    if marker.is_file() {
        return Ok(false);
    }
    fs::create_dir_all(dir)?;
    fs::write(&marker, "")?;
    Ok(true)
}

fn generate(plan: &Plan) -> anyhow::Result<()> {
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .emit_rerun_if_changed(false)
        .out_dir(&plan.out_dir)
        .compile_protos(&[&plan.proto], &[&plan.include])
        .with_context(|| format!("Code generation for {} failed", plan.proto.display()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let plan = Plan::try_from(Args::parse())?;
    tracing::info!(
        proto = %plan.proto.display(),
        include = %plan.include.display(),
        "Generating gRPC stubs into {}",
        plan.out_dir.display()
    );

    if ensure_package_marker(&plan.out_dir)? {
        tracing::info!("Created {}", plan.out_dir.join("mod.rs").display());
    }

    generate(&plan)?;
    tracing::info!("Generated gRPC stubs in {}", plan.out_dir.display());
    Ok(())
}
