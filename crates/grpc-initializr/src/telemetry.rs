//! # Logger Provider
//!
//! Logging is built on `tracing`. A [`Logger`] owns a fully configured
//! `tracing` dispatcher (console and/or file output, level, format, timestamp
//! format) and can be passed by reference to the components that need it:
//!
//! - [`Logger::scope`] runs a closure with the logger as the current
//!   dispatcher.
//! - [`GrpcServer::with_logger`](crate::server::GrpcServer::with_logger)
//!   routes lifecycle diagnostics through it.
//!
//! A process-wide default is available through [`init_global`]. It is
//! constructed at most once, even when several threads race to initialize it.
//! Calling [`init_global`] again with *different* options returns the
//! original logger unchanged: options passed after the first call are
//! ignored.
//!
//! ## Filtering
//!
//! `RUST_LOG` takes precedence over [`LoggerOptions::level`] when set, so
//! per-module directives (`RUST_LOG=grpc_initializr=debug,h2=warn`) work as
//! usual.

use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::Dispatch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

pub const DEFAULT_LOGGER_NAME: &str = "gRPC_Logger";
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Line format of emitted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// `tracing-subscriber`'s default single-line format.
    #[default]
    Full,
    Compact,
    /// Multi-line, human oriented.
    Pretty,
    /// Newline-delimited JSON.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerOptions {
    pub name: String,
    pub file_output: bool,
    pub console_output: bool,
    pub level: LogLevel,
    pub format: LogFormat,
    /// `strftime`-style timestamp format.
    pub date_format: String,
    /// Directory receiving `<name>.log`. Required when `file_output` is set.
    pub output_directory: Option<PathBuf>,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_LOGGER_NAME.to_string(),
            file_output: false,
            console_output: true,
            level: LogLevel::default(),
            format: LogFormat::default(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            output_directory: None,
        }
    }
}

/// A configured `tracing` dispatcher plus the options it was built from.
#[derive(Debug)]
pub struct Logger {
    options: LoggerOptions,
    dispatch: Dispatch,
}

impl Logger {
    /// Builds a logger without installing it globally.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if file output is enabled without an output
    ///   directory.
    /// - [`Error::Io`] if the directory or log file cannot be created.
    pub fn new(options: LoggerOptions) -> Result<Self> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

        if options.console_output {
            layers.push(fmt_layer(
                options.format,
                &options.date_format,
                std::io::stdout,
                true,
            ));
        }

        if options.file_output {
            let dir = options.output_directory.as_ref().ok_or_else(|| {
                Error::configuration("file output requires an output directory")
            })?;
            fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{}.log", options.name)))?;
            layers.push(fmt_layer(
                options.format,
                &options.date_format,
                Mutex::new(file),
                false,
            ));
        }

        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(options.level).into())
            .from_env_lossy();
        let dispatch = Dispatch::new(tracing_subscriber::registry().with(layers).with(filter));

        let logger = Self { options, dispatch };
        logger.scope(|| tracing::info!("{} logger initialized", logger.name()));
        Ok(logger)
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &LoggerOptions {
        &self.options
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Runs `f` with this logger as the current dispatcher.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Installs this logger as the process-wide default.
    ///
    /// Returns `false` if another global subscriber is already installed.
    pub fn install_global(&self) -> bool {
        tracing::dispatcher::set_global_default(self.dispatch.clone()).is_ok()
    }
}

fn fmt_layer<W>(
    format: LogFormat,
    date_format: &str,
    writer: W,
    ansi: bool,
) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_thread_ids(true)
        .with_target(false)
        .with_timer(ChronoLocal::new(date_format.to_string()));

    match format {
        LogFormat::Full => layer.boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

static GLOBAL: OnceLock<Logger> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Returns the process-wide logger, constructing and installing it on first
/// use.
///
/// Later calls return the first logger regardless of `options`.
///
/// # Errors
///
/// Propagates [`Logger::new`] errors from the first construction. A failed
/// construction leaves the global uninitialized.
pub fn init_global(options: LoggerOptions) -> Result<&'static Logger> {
    if let Some(logger) = GLOBAL.get() {
        return Ok(logger);
    }

    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(logger) = GLOBAL.get() {
        return Ok(logger);
    }

    let logger = Logger::new(options)?;
    if !logger.install_global() {
        logger.scope(|| {
            tracing::warn!("A global subscriber is already installed; logger is only active in explicit scopes");
        });
    }
    Ok(GLOBAL.get_or_init(|| logger))
}

/// The process-wide logger, if [`init_global`] has run.
pub fn global() -> Option<&'static Logger> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "grpc-initializr-{tag}-{}-{nanos}",
            std::process::id()
        ))
    }

    #[test]
    fn file_output_requires_directory() {
        let err = Logger::new(LoggerOptions {
            file_output: true,
            console_output: false,
            ..LoggerOptions::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn writes_records_to_named_file() {
        let dir = scratch_dir("file");
        let logger = Logger::new(LoggerOptions {
            name: "unit".to_string(),
            file_output: true,
            console_output: false,
            format: LogFormat::Json,
            output_directory: Some(dir.clone()),
            ..LoggerOptions::default()
        })
        .unwrap();

        logger.scope(|| tracing::warn!("disk is nearly full"));

        let contents = fs::read_to_string(dir.join("unit.log")).unwrap();
        assert!(contents.contains("unit logger initialized"));
        assert!(contents.contains("disk is nearly full"));
        assert!(contents.contains("\"level\":\"WARN\""));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn every_format_builds() {
        for format in [
            LogFormat::Full,
            LogFormat::Compact,
            LogFormat::Pretty,
            LogFormat::Json,
        ] {
            let logger = Logger::new(LoggerOptions {
                format,
                level: LogLevel::Debug,
                ..LoggerOptions::default()
            })
            .unwrap();
            assert_eq!(logger.name(), DEFAULT_LOGGER_NAME);
            logger.scope(|| tracing::debug!(?format, "format check"));
        }
    }

    #[test]
    fn level_conversion() {
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
        assert_eq!(LevelFilter::from(LogLevel::default()), LevelFilter::INFO);
    }
}
