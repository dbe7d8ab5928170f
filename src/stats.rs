use crate::planner::{ScaleDecision, ScalePlan};
use std::collections::HashSet;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub label: String,
    pub error: String,
}

/// One rescaled image, listed in the run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleReport {
    pub label: String,
    pub from: (u32, u32),
    pub to: (u32, u32),
}

/// Counters for a single run. Owned by the run driver and lent mutably to
/// whatever is processing the current entity.
#[derive(Debug, Default)]
pub struct RunStats {
    pub images_found: usize,
    pub successes: usize,
    pub skipped: usize,
    pub warnings: usize,
    pub errors: usize,
    pub failed_items: Vec<FailureRecord>,
    pub upscaled: Vec<ScaleReport>,
    pub downscaled: Vec<ScaleReport>,
    processed_ids: HashSet<String>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique entities touched during the run.
    pub fn processed(&self) -> usize {
        self.processed_ids.len()
    }

    pub fn record_entity(&mut self, entity_id: &str) {
        if !entity_id.is_empty() && !self.processed_ids.contains(entity_id) {
            self.processed_ids.insert(entity_id.to_string());
        }
    }

    pub fn record_images_found(&mut self, count: usize) {
        self.images_found += count;
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn record_warning(&mut self) {
        self.warnings += 1;
    }

    pub fn record_error(&mut self, label: impl Into<String>, error: impl Into<String>) {
        self.errors += 1;
        self.failed_items.push(FailureRecord {
            label: label.into(),
            error: error.into(),
        });
    }

    pub fn record_scale(&mut self, label: &str, plan: &ScalePlan) {
        let report = || ScaleReport {
            label: label.to_string(),
            from: (plan.original_width, plan.original_height),
            to: (plan.target_width, plan.target_height),
        };
        match plan.decision {
            ScaleDecision::ScaleUp => self.upscaled.push(report()),
            ScaleDecision::ScaleDown => self.downscaled.push(report()),
            ScaleDecision::NoScale => {}
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn log_summary(&self, run_id: &str, dry_run: bool) {
        info!("==== Run summary ({}){} ====", run_id, if dry_run { " [DRY-RUN]" } else { "" });
        info!(
            "Processed: {}  Images found: {}  Success: {}  Skipped: {}  Warnings: {}  Errors: {}",
            self.processed(),
            self.images_found,
            self.successes,
            self.skipped,
            self.warnings,
            self.errors
        );
        if !self.upscaled.is_empty() {
            info!("Upscaled images ({}):", self.upscaled.len());
            for r in &self.upscaled {
                info!("  {} ({}x{} -> {}x{})", r.label, r.from.0, r.from.1, r.to.0, r.to.1);
            }
        }
        if !self.downscaled.is_empty() {
            info!("Downscaled images ({}):", self.downscaled.len());
            for r in &self.downscaled {
                info!("  {} ({}x{} -> {}x{})", r.label, r.from.0, r.from.1, r.to.0, r.to.1);
            }
        }
        if !self.failed_items.is_empty() {
            error!("Failed items ({}):", self.failed_items.len());
            for failure in &self.failed_items {
                error!("  {}: {}", failure.label, failure.error);
            }
        }
    }
}
