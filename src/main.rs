#[macro_use]
extern crate lazy_static;

mod api;
mod backup;
mod canvas;
mod cli;
mod client;
mod config;
mod discovery;
mod kind;
mod logging;
mod orchestrator;
mod planner;
mod replace;
mod restore;
mod run;
mod stats;

use api::WriteGate;
use backup::{BackupStore, StagingArea};
use clap::Parser;
use cli::Cli;
use client::JellyfinClient;
use config::Config;
use kind::ImageKind;
use orchestrator::{BackupPolicy, Orchestrator, ProcessOptions};
use restore::RestoreFilter;
use run::{PassReport, RunError, Runner};
use stats::RunStats;
use std::process::ExitCode;
use tracing::{error, info_span, warn};

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = cli.check() {
        e.exit();
    }

    if cli.generate_config {
        return match config::generate_config(&cli.config) {
            Ok(()) => {
                println!("Wrote starter config to {}", cli.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("artnorm: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("artnorm: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(&cli.config)?;
    let override_warnings = config.apply_overrides(cli);
    let _log_guard = logging::init(&config.logging, cli.verbose)?;

    let run_id = logging::new_run_id();
    let span = info_span!("run", id = %run_id);
    let _entered = span.enter();

    if cli.test_jf {
        config.validate(false)?;
        let client = JellyfinClient::new(config.client_settings());
        return Ok(match client.test_connection() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("[API-TEST] Jellyfin connection failed: {}", e);
                ExitCode::FAILURE
            }
        });
    }

    config.validate(true)?;
    let operations = config.operations()?;
    let item_types = config.item_types()?;
    let restoring = cli.restore || cli.restore_all;

    logging::RunBanner {
        run_id: &run_id,
        config_path: &cli.config,
        operations: &operations,
        dry_run: config.dry_run,
        backup: config.backup,
        logging: &config.logging,
        verbose: cli.verbose,
    }
    .log();

    let mut stats = RunStats::new();
    for warning in override_warnings {
        warn!("[WARN] {}", warning);
        stats.record_warning();
    }
    let rules = config.rule_set();
    if !restoring {
        for warning in config.aspect_warnings(&rules, &operations) {
            warn!("[WARN] {}", warning);
            stats.record_warning();
        }
    }

    let client = JellyfinClient::new(config.client_settings());
    if let Err(e) = client.test_connection() {
        error!(
            "[CRITICAL] Could not connect to Jellyfin at {}; aborting before processing: {}",
            client.base_url(),
            e
        );
        stats.record_error("connectivity", e.to_string());
        stats.log_summary(&run_id, config.dry_run);
        return Ok(ExitCode::FAILURE);
    }

    let store = BackupStore::new(&config.backup_dir);
    let options = ProcessOptions {
        backup: config.backup.then(|| BackupPolicy {
            store: store.clone(),
            mode: config.backup_mode(),
        }),
        force_upload_noscale: config.force_upload_noscale,
    };
    let staging = StagingArea::new(&config.staging_dir(), &run_id);
    let gate = WriteGate::new(client, config.dry_run);
    let orchestrator = Orchestrator::new(&gate, &rules, &options, &staging);

    let single = cli.single.is_some();
    let result = if restoring {
        let filter = RestoreFilter {
            kinds: operations.iter().copied().collect(),
            entity: cli.single.clone(),
        };
        let report = restore::restore(&orchestrator, &store, &filter, config.fail_fast, &mut stats);
        Ok(PassReport {
            entities: report.restored + report.failed,
            failed: report.failed,
        })
    } else {
        let runner = Runner::new(orchestrator, gate.inner(), operations.clone(), config.fail_fast);
        dispatch(&runner, cli, &config, &item_types, &operations, &mut stats)
    };

    let failed = match result {
        Ok(report) => report.failed > 0,
        Err(RunError::Stopped { .. }) => true,
        Err(e) => {
            error!("[CRITICAL] {}", e);
            stats.record_error("run", e.to_string());
            true
        }
    };
    stats.log_summary(&run_id, config.dry_run);

    let exit_failure = (config.fail_fast && stats.has_errors()) || (single && failed);
    Ok(if exit_failure {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn dispatch(
    runner: &Runner<'_, WriteGate<JellyfinClient>, JellyfinClient>,
    cli: &Cli,
    config: &Config,
    item_types: &[String],
    operations: &[ImageKind],
    stats: &mut RunStats,
) -> Result<PassReport, RunError> {
    if let Some(username) = cli.single_profile() {
        return runner.run_single_profile(username, stats);
    }
    if let Some(item_id) = &cli.single {
        return runner.run_single_item(item_id, stats);
    }

    let mut total = PassReport::default();
    if operations.iter().any(|k| *k != ImageKind::Profile) {
        let report = runner.run_libraries(
            &config.library_names(),
            item_types,
            config.operator.username.as_deref(),
            stats,
        )?;
        total.entities += report.entities;
        total.failed += report.failed;
    }
    if operations.contains(&ImageKind::Profile) {
        let report = runner.run_profiles(stats)?;
        total.entities += report.entities;
        total.failed += report.failed;
    }
    Ok(total)
}
