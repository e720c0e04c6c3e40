//! Command-line bootstrap.
//!
//! [`run_grpc_cli`] turns a set of [`Handlers`] into a complete server
//! process: it loads `.env`, parses [`CliArgs`], installs the global logger,
//! then binds and serves until a termination signal arrives.

use crate::error::{Error, Result};
use crate::server::config::{DEFAULT_HOST, DEFAULT_WORKERS};
use crate::server::{GrpcServer, Handlers, ServerConfig, ServerType};
use crate::telemetry::{self, LogFormat, LogLevel, LoggerOptions};
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

/// Runtime configuration of a bootstrapped gRPC server.
///
/// Every option can also be supplied through its environment variable, and
/// a `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "grpc-initializr",
    version,
    about = "Bootstrap a gRPC server with a standard retry policy"
)]
pub struct CliArgs {
    /// Host interface to bind.
    ///
    /// Environment variable: `GRPC_HOST`
    #[arg(short = 'H', long, env = "GRPC_HOST", default_value_t = String::from(DEFAULT_HOST))]
    pub host: String,

    /// Port to bind. Must fit in 16 bits; `0` picks an ephemeral port.
    ///
    /// Environment variable: `GRPC_PORT`
    #[arg(short, long, env = "GRPC_PORT", default_value = "45752")]
    pub port: String,

    /// Worker threads for `SYNC` servers. Values below 10 are raised to 10.
    ///
    /// Environment variable: `GRPC_WORKERS`
    #[arg(short, long, env = "GRPC_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub worker: usize,

    /// Concurrency model: `SYNC` (thread pool) or `ASYNC` (event loop).
    ///
    /// `-st` is also accepted, see [`expand_legacy_flags`].
    ///
    /// Environment variable: `GRPC_SERVER_TYPE`
    #[arg(
        short = 't',
        long,
        visible_alias = "st",
        env = "GRPC_SERVER_TYPE",
        value_enum,
        ignore_case = true,
        default_value_t = ServerType::ThreadPool
    )]
    pub server_type: ServerType,

    /// Minimum level of emitted log records. `RUST_LOG` overrides it.
    #[arg(long, env = "GRPC_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, env = "GRPC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Full)]
    pub log_format: LogFormat,

    /// Also write logs to `<dir>/gRPC_Logger.log`.
    #[arg(long, env = "GRPC_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl CliArgs {
    pub fn logger_options(&self) -> LoggerOptions {
        LoggerOptions {
            level: self.log_level,
            format: self.log_format,
            file_output: self.log_dir.is_some(),
            output_directory: self.log_dir.clone(),
            ..LoggerOptions::default()
        }
    }
}

/// Rewrites the two-letter `-st` short flag to its `--st` long alias.
///
/// clap short flags are a single character, so `-st ASYNC` and `-st=ASYNC`
/// are translated before parsing. Arguments after `--` are left untouched.
pub fn expand_legacy_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut positional = false;
    args.into_iter()
        .map(|arg| {
            let arg = arg.into();
            if positional {
                return arg;
            }
            let rewritten = match arg.to_str() {
                Some("--") => {
                    positional = true;
                    None
                }
                Some("-st") => Some(OsString::from("--st")),
                Some(flag) => flag
                    .strip_prefix("-st=")
                    .map(|value| OsString::from(format!("--st={value}"))),
                None => None,
            };
            rewritten.unwrap_or(arg)
        })
        .collect()
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = Error;

    fn try_from(args: CliArgs) -> Result<Self> {
        let port = args.port.trim().parse::<u16>().map_err(|_| {
            Error::configuration(format!(
                "GRPC_PORT must be an integer between 0 and 65535, got `{}`",
                args.port
            ))
        })?;

        if args.host.trim().is_empty() {
            return Err(Error::configuration("GRPC_HOST must not be empty"));
        }

        Ok(Self {
            workers: args.worker,
            ..ServerConfig::new(args.host, port, args.server_type)
        })
    }
}

/// Parses the process arguments and runs a server for `handlers`.
///
/// Blocks until the server has stopped.
///
/// # Errors
///
/// - [`Error::Configuration`] if both handler lists are empty (checked
///   before the command line is read) or an argument is invalid.
/// - Any error from logger construction, binding or serving.
pub fn run_grpc_cli(handlers: Handlers) -> Result<()> {
    if handlers.is_empty() {
        return Err(Error::configuration(
            "at least one service handler must be supplied",
        ));
    }

    // A missing .env file is not an error.
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse_from(expand_legacy_flags(std::env::args_os()));
    run_with_args(args, handlers)
}

/// Runs a server for `handlers` from already parsed arguments.
pub fn run_with_args(args: CliArgs, handlers: Handlers) -> Result<()> {
    if handlers.is_empty() {
        return Err(Error::configuration(
            "at least one service handler must be supplied",
        ));
    }

    let logger_options = args.logger_options();
    let config = ServerConfig::try_from(args)?;
    let logger = telemetry::init_global(logger_options)?;

    let mut server = GrpcServer::new(config, handlers)?.with_logger(logger);
    server.bind()?;
    server.serve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServiceHandler;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("grpc-initializr").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        let config = ServerConfig::try_from(args).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 45752);
        assert_eq!(config.workers, 20);
        assert_eq!(config.server_type, ServerType::ThreadPool);
    }

    #[test]
    fn short_flags_and_case_insensitive_type() {
        let args = parse(&["-H", "127.0.0.1", "-p", "50051", "-w", "4", "-t", "async"]);
        assert_eq!(args.server_type, ServerType::Cooperative);

        let config = ServerConfig::try_from(args).unwrap();
        assert_eq!(config.endpoint(), "127.0.0.1:50051");
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn st_alias() {
        assert_eq!(parse(&["--st", "ASYNC"]).server_type, ServerType::Cooperative);
        assert_eq!(parse(&["--server-type", "Sync"]).server_type, ServerType::ThreadPool);
    }

    #[test]
    fn two_letter_short_flag() {
        let args = CliArgs::try_parse_from(expand_legacy_flags(["grpc-initializr", "-st", "async"]))
            .unwrap();
        assert_eq!(args.server_type, ServerType::Cooperative);

        let args =
            CliArgs::try_parse_from(expand_legacy_flags(["grpc-initializr", "-st=ASYNC", "-p", "1"]))
                .unwrap();
        assert_eq!(args.server_type, ServerType::Cooperative);
        assert_eq!(args.port, "1");
    }

    #[test]
    fn legacy_rewrite_leaves_other_arguments_alone() {
        let expanded = expand_legacy_flags(["bin", "-H", "::1", "--", "-st"]);
        assert_eq!(expanded, ["bin", "-H", "::1", "--", "-st"].map(OsString::from));

        let expanded = expand_legacy_flags(["bin", "-stASYNC", "--st", "SYNC"]);
        assert_eq!(expanded, ["bin", "-stASYNC", "--st", "SYNC"].map(OsString::from));
    }

    #[test]
    fn unknown_server_type_is_rejected() {
        assert!(CliArgs::try_parse_from(["grpc-initializr", "-t", "FORK"]).is_err());
    }

    #[test]
    fn port_must_be_u16() {
        for port in ["http", "70000", "4.5"] {
            let args = parse(&["--port", port]);
            let err = ServerConfig::try_from(args).unwrap_err();
            assert!(matches!(err, Error::Configuration { .. }), "{port}");
        }
    }

    #[test]
    fn log_dir_enables_file_output() {
        let options = parse(&["--log-dir", "/var/log/grpc", "--log-format", "json"]).logger_options();
        assert!(options.file_output);
        assert_eq!(options.format, LogFormat::Json);
        assert_eq!(options.output_directory, Some(PathBuf::from("/var/log/grpc")));

        assert!(!parse(&[]).logger_options().file_output);
    }

    #[test]
    fn empty_handlers_fail_before_parsing() {
        let err = run_grpc_cli(Handlers::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn run_with_args_rejects_bad_port_before_binding() {
        let service = tonic_reflection::server::Builder::configure()
            .build_v1()
            .unwrap();
        let handlers = Handlers::new().thread_pool(ServiceHandler::new(service));
        let err = run_with_args(parse(&["--port", "not-a-port"]), handlers).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
