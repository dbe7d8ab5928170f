use crate::config::LoggingConfig;
use crate::kind::ImageKind;
use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Console filter directive: `--verbose` wins over the configured level,
/// silent mode keeps only errors.
pub fn console_directive(config: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "debug".into()
    } else if config.silent {
        "error".into()
    } else {
        config.cli_level.trim().to_lowercase()
    }
}

/// Installs the global subscriber. The returned guard flushes the log file
/// on drop and must live until the end of `main`.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let console_level = console_directive(config, verbose);
    let console_filter = EnvFilter::try_new(&console_level)
        .with_context(|| format!("invalid logging.cli_level '{}'", console_level))?;
    let writer = if config.silent && !verbose {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let console = fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_filter(console_filter);

    let (file_layer, guard) = if config.file_enabled {
        let file_filter = EnvFilter::try_new(config.file_level.trim().to_lowercase())
            .with_context(|| format!("invalid logging.file_level '{}'", config.file_level))?;
        let (writer, guard) = tracing_appender::non_blocking(open_log_file(&config.file_path)?);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .with_filter(file_filter);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}

fn open_log_file(path: &Path) -> anyhow::Result<fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Short random id attached to every line of one run.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct RunBanner<'a> {
    pub run_id: &'a str,
    pub config_path: &'a Path,
    pub operations: &'a [ImageKind],
    pub dry_run: bool,
    pub backup: bool,
    pub logging: &'a LoggingConfig,
    pub verbose: bool,
}

impl RunBanner<'_> {
    pub fn log(&self) {
        let ops: Vec<&str> = self.operations.iter().map(|k| k.mode_name()).collect();
        info!(
            "==== artnorm {} run {} ====",
            env!("CARGO_PKG_VERSION"),
            self.run_id
        );
        info!(
            "Config: {}  Operations: {}  Dry-run: {}  Backup: {}  Console level: {}  File level: {}",
            self.config_path.display(),
            if ops.is_empty() { "-".to_string() } else { ops.join("|") },
            self.dry_run,
            self.backup,
            console_directive(self.logging, self.verbose),
            if self.logging.file_enabled {
                self.logging.file_level.as_str()
            } else {
                "off"
            }
        );
    }
}
