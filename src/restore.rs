use crate::api::ImageApi;
use crate::backup::{BackupEntry, BackupStore};
use crate::kind::ImageKind;
use crate::orchestrator::{EntityError, Orchestrator};
use crate::replace::{validate_sequence, StagedImage};
use crate::stats::RunStats;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use tracing::{error, info};

/// Which backups to push back to the server.
#[derive(Debug, Clone, Default)]
pub struct RestoreFilter {
    pub kinds: BTreeSet<ImageKind>,
    /// Restrict to one entity id.
    pub entity: Option<String>,
}

impl RestoreFilter {
    pub fn all() -> Self {
        Self {
            kinds: ImageKind::ALL.into_iter().collect(),
            entity: None,
        }
    }

    fn accepts(&self, entry: &BackupEntry) -> bool {
        self.kinds.contains(&entry.kind)
            && self
                .entity
                .as_deref()
                .map_or(true, |id| id == entry.entity_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
}

/// Uploads backed-up originals, one entity and kind at a time. Ordered sets
/// go through the coordinator's delete, verify and re-upload phases.
pub fn restore<A: ImageApi>(
    orchestrator: &Orchestrator<'_, A>,
    store: &BackupStore,
    filter: &RestoreFilter,
    fail_fast: bool,
    stats: &mut RunStats,
) -> RestoreReport {
    let mut groups: BTreeMap<(String, ImageKind), Vec<BackupEntry>> = BTreeMap::new();
    for entry in store.list().filter(|e| filter.accepts(e)) {
        groups
            .entry((entry.entity_id.clone(), entry.kind))
            .or_default()
            .push(entry);
    }

    if groups.is_empty() {
        info!("[RESTORE] No backups found under {}", store.root().display());
        return RestoreReport::default();
    }

    let mut report = RestoreReport::default();
    for ((entity_id, kind), mut entries) in groups {
        entries.sort_by_key(|e| e.index);
        stats.record_entity(&entity_id);
        stats.record_images_found(entries.len());
        let label = format!("{} [{}]", entity_id, kind.api_name());
        info!("[RESTORE] {} ({} file(s))", label, entries.len());

        let ok = if kind.is_ordered() {
            restore_set(orchestrator, &entity_id, &label, kind, &entries, stats)
        } else {
            restore_single(orchestrator, &entity_id, &label, kind, &entries[0], stats)
        };
        if ok {
            report.restored += 1;
        } else {
            report.failed += 1;
            if fail_fast {
                error!("[FAIL-FAST] Stopping restore after failure on {}", label);
                break;
            }
        }
    }
    info!(
        "[RESTORE] Finished: {} restored, {} failed.",
        report.restored, report.failed
    );
    report
}

fn restore_single<A: ImageApi>(
    orchestrator: &Orchestrator<'_, A>,
    entity_id: &str,
    label: &str,
    kind: ImageKind,
    entry: &BackupEntry,
    stats: &mut RunStats,
) -> bool {
    let result = fs::read(&entry.path)
        .map_err(|e| EntityError::Backup(e.into()))
        .and_then(|bytes| {
            orchestrator
                .api()
                .upload_image(entity_id, kind, 0, &bytes, entry.content_type())
                .map_err(EntityError::Upload)
        });
    match result {
        Ok(()) => {
            info!("  -> Restored {} from {}", label, entry.path.display());
            stats.record_success();
            true
        }
        Err(e) => {
            error!("[ERROR] Restore failed for {}: {}", label, e);
            stats.record_error(label, e.to_string());
            false
        }
    }
}

fn restore_set<A: ImageApi>(
    orchestrator: &Orchestrator<'_, A>,
    entity_id: &str,
    label: &str,
    kind: ImageKind,
    entries: &[BackupEntry],
    stats: &mut RunStats,
) -> bool {
    if let Err(e) = validate_sequence(entries.iter().map(|e| e.index)) {
        error!("[ERROR] Refusing to restore {}: {}", label, e);
        stats.record_error(label, e.to_string());
        return false;
    }
    let staged = entries
        .iter()
        .map(|entry| StagedImage {
            index: entry.index,
            path: entry.path.clone(),
            content_type: entry.content_type().to_string(),
        })
        .collect();
    let outcome = orchestrator
        .coordinator(kind)
        .replace_with(entity_id, label, staged, stats);
    outcome.success
}
