use crate::api::{ApiError, ImageApi, RemoteImage};
use crate::backup::{BackupError, BackupMode, BackupStore, StagingArea};
use crate::canvas::{self, CanvasError, SourceInfo, Trim};
use crate::kind::{ImageKind, ModeRules, Padding, RuleSet};
use crate::planner::ScalePlan;
use crate::replace::Coordinator;
use crate::stats::RunStats;
use thiserror::Error;
use tracing::{error, info, warn};

/// Failures that abort one entity without touching the rest of the run.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("image indices are not contiguous from 0: {found:?}")]
    IndexSequence { found: Vec<usize> },
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error("staging failed: {0}")]
    Staging(BackupError),
    #[error("backup failed: {0}")]
    Backup(BackupError),
    #[error("fetch failed: {0}")]
    Fetch(ApiError),
    #[error("upload failed: {0}")]
    Upload(ApiError),
    #[error("delete failed: {0}")]
    Delete(ApiError),
}

#[derive(Debug, Clone)]
pub struct BackupPolicy {
    pub store: BackupStore,
    pub mode: BackupMode,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// `None` when backups are disabled.
    pub backup: Option<BackupPolicy>,
    pub force_upload_noscale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    /// New bytes were uploaded (or would have been, in dry-run).
    Uploaded,
    /// Already normalized; counted as a success.
    Unchanged,
    /// Already normalized; counted as a skip.
    Skipped,
    Failed,
}

impl ImageOutcome {
    pub fn is_failure(self) -> bool {
        self == ImageOutcome::Failed
    }
}

/// Drives normalization of one entity's image of a given kind.
pub struct Orchestrator<'a, A> {
    api: &'a A,
    rules: &'a RuleSet,
    options: &'a ProcessOptions,
    staging: &'a StagingArea,
}

impl<'a, A: ImageApi> Orchestrator<'a, A> {
    pub fn new(
        api: &'a A,
        rules: &'a RuleSet,
        options: &'a ProcessOptions,
        staging: &'a StagingArea,
    ) -> Self {
        Self {
            api,
            rules,
            options,
            staging,
        }
    }

    pub fn api(&self) -> &'a A {
        self.api
    }

    pub fn coordinator(&self, kind: ImageKind) -> Coordinator<'a, A> {
        Coordinator::new(self.api, self.rules.get(kind), self.options, self.staging)
    }

    /// Ordered kinds go through the replace coordinator; everything else is a
    /// single fetch, normalize, upload.
    pub fn process(
        &self,
        entity_id: &str,
        label: &str,
        kind: ImageKind,
        stats: &mut RunStats,
    ) -> ImageOutcome {
        if kind.is_ordered() {
            let outcome = self.coordinator(kind).run(entity_id, label, stats);
            return if outcome.per_image_status.is_empty() && outcome.success {
                ImageOutcome::Skipped
            } else if outcome.success {
                ImageOutcome::Uploaded
            } else {
                ImageOutcome::Failed
            };
        }

        match self.process_single(entity_id, label, kind, stats) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[ERROR] Failed to process {}: {}", label, e);
                stats.record_error(label, e.to_string());
                ImageOutcome::Failed
            }
        }
    }

    fn process_single(
        &self,
        entity_id: &str,
        label: &str,
        kind: ImageKind,
        stats: &mut RunStats,
    ) -> Result<ImageOutcome, EntityError> {
        let rules = self.rules.get(kind);
        let remote = self
            .api
            .fetch_image(entity_id, kind)
            .map_err(EntityError::Fetch)?;
        canvas::ensure_image_content_type(&remote.content_type)?;

        let prepared = canvas::prepare(&remote.bytes, rules)?;
        record_plan(
            entity_id,
            label,
            &remote,
            &prepared.plan,
            prepared.trim,
            &prepared.source,
            rules,
            self.options,
            stats,
        )?;

        match canvas::render(&prepared, rules)? {
            Some(rendered) => {
                self.api
                    .upload_image(entity_id, kind, 0, &rendered.bytes, rendered.content_type)
                    .map_err(EntityError::Upload)?;
                stats.record_success();
                Ok(ImageOutcome::Uploaded)
            }
            None => self.handle_no_scale(entity_id, label, kind, &remote, stats),
        }
    }

    fn handle_no_scale(
        &self,
        entity_id: &str,
        label: &str,
        kind: ImageKind,
        remote: &RemoteImage,
        stats: &mut RunStats,
    ) -> Result<ImageOutcome, EntityError> {
        if self.options.force_upload_noscale {
            self.api
                .upload_image(entity_id, kind, 0, &remote.bytes, &remote.content_type)
                .map_err(EntityError::Upload)?;
            info!("  -> Re-uploaded unchanged original for {}", label);
            stats.record_success();
            return Ok(ImageOutcome::Uploaded);
        }
        match kind {
            ImageKind::Logo | ImageKind::Thumb => {
                stats.record_skip();
                Ok(ImageOutcome::Skipped)
            }
            _ => {
                stats.record_success();
                Ok(ImageOutcome::Unchanged)
            }
        }
    }
}

/// Bookkeeping shared by every normalized image once its plan is known:
/// padding-removal warnings, the backup gate, scale reports and the summary
/// line.
#[allow(clippy::too_many_arguments)]
pub(crate) fn record_plan(
    entity_id: &str,
    label: &str,
    remote: &RemoteImage,
    plan: &ScalePlan,
    trim: Trim,
    source: &SourceInfo,
    rules: &ModeRules,
    options: &ProcessOptions,
    stats: &mut RunStats,
) -> Result<(), EntityError> {
    match trim {
        Trim::FullyTransparent => {
            warn!(
                "[WARN] Logo padding removal skipped: image is fully transparent at sensitivity={}.",
                rules.padding_remove_sensitivity
            );
            stats.record_warning();
        }
        Trim::Unchanged if (source.width, source.height) == (rules.width, rules.height) => {
            warn!(
                "[WARN] Logo padding removal may have failed: image remained at target size; \
                 borders may contain non-obvious pixels."
            );
            stats.record_warning();
        }
        _ => {}
    }

    if let Some(policy) = &options.backup {
        if policy.mode.should_backup(plan.decision) {
            policy
                .store
                .put(
                    entity_id,
                    rules.kind,
                    remote.index,
                    &remote.content_type,
                    &remote.bytes,
                )
                .map_err(EntityError::Backup)?;
        }
    }

    stats.record_scale(label, plan);

    let output = if plan.is_no_scale() && !trim.cropped() {
        (plan.original_width, plan.original_height)
    } else if rules.kind == ImageKind::Logo && rules.padding != Padding::Add {
        (plan.target_width, plan.target_height)
    } else {
        (rules.width, rules.height)
    };
    info!(
        "[PROCESS:{}] {} ({}x{}) -> {}x{} (canvas {}x{}, orig color={:?}, format={:?})",
        plan.decision,
        label,
        plan.original_width,
        plan.original_height,
        output.0,
        output.1,
        rules.width,
        rules.height,
        source.color,
        source.format
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;
    use crate::api::WriteGate;
    use crate::canvas::tests::{jpeg_bytes, png_bytes};
    use image::DynamicImage;
    use std::fs;

    struct Fixture {
        _tmp: tempfile::TempDir,
        staging: StagingArea,
        rules: RuleSet,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(&tmp.path().join(".staging"), "run");
        Fixture {
            _tmp: tmp,
            staging,
            rules: RuleSet::default(),
        }
    }

    fn options_with_backup(root: &std::path::Path, mode: BackupMode) -> ProcessOptions {
        ProcessOptions {
            backup: Some(BackupPolicy {
                store: BackupStore::new(root),
                mode,
            }),
            force_upload_noscale: false,
        }
    }

    #[test]
    fn oversized_thumb_is_normalized_and_uploaded() {
        let fx = fixture();
        let api = FakeApi::with_images("m1", ImageKind::Thumb, vec![(jpeg_bytes(2000, 1124), "image/jpeg")]);
        let options = options_with_backup(fx._tmp.path(), BackupMode::Partial);
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();

        let outcome = orchestrator.process("m1", "Movie [Thumb]", ImageKind::Thumb, &mut stats);
        assert_eq!(outcome, ImageOutcome::Uploaded);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.downscaled.len(), 1);

        let (bytes, content_type) = api.stored("m1", ImageKind::Thumb).remove(0);
        assert_eq!(content_type, "image/jpeg");
        let uploaded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((uploaded.width(), uploaded.height()), (1000, 562));

        let store = BackupStore::new(fx._tmp.path());
        let (backup, _) = store.get("m1", ImageKind::Thumb, 0).unwrap();
        assert_eq!(backup, jpeg_bytes(2000, 1124));
    }

    #[test]
    fn second_pass_is_idempotent() {
        let fx = fixture();
        let api = FakeApi::with_images("m1", ImageKind::Thumb, vec![(jpeg_bytes(2000, 1124), "image/jpeg")]);
        let options = options_with_backup(fx._tmp.path(), BackupMode::Partial);
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();

        orchestrator.process("m1", "Movie [Thumb]", ImageKind::Thumb, &mut stats);
        let backup_path = BackupStore::new(fx._tmp.path())
            .path_for("m1", ImageKind::Thumb, 0, "image/jpeg")
            .unwrap();
        let first_write = fs::metadata(&backup_path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let outcome = orchestrator.process("m1", "Movie [Thumb]", ImageKind::Thumb, &mut stats);
        assert_eq!(outcome, ImageOutcome::Skipped);
        assert_eq!(api.uploads.borrow().len(), 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(
            fs::metadata(&backup_path).unwrap().modified().unwrap(),
            first_write
        );
    }

    #[test]
    fn full_backup_mode_keeps_no_scale_originals_without_rewriting() {
        let fx = fixture();
        let original = jpeg_bytes(1000, 562);
        let api = FakeApi::with_images("m1", ImageKind::Thumb, vec![(original.clone(), "image/jpeg")]);
        let options = options_with_backup(fx._tmp.path(), BackupMode::Full);
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();

        orchestrator.process("m1", "Movie [Thumb]", ImageKind::Thumb, &mut stats);
        let path = BackupStore::new(fx._tmp.path())
            .path_for("m1", ImageKind::Thumb, 0, "image/jpeg")
            .unwrap();
        let first = fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        orchestrator.process("m1", "Movie [Thumb]", ImageKind::Thumb, &mut stats);

        assert_eq!(fs::read(&path).unwrap(), original);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), first);
        assert_eq!(api.mutations(), 0);
    }

    #[test]
    fn partial_backup_skips_no_scale() {
        let fx = fixture();
        let api = FakeApi::with_images("m1", ImageKind::Thumb, vec![(jpeg_bytes(1000, 562), "image/jpeg")]);
        let options = options_with_backup(fx._tmp.path(), BackupMode::Partial);
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();
        orchestrator.process("m1", "Movie [Thumb]", ImageKind::Thumb, &mut stats);
        assert_eq!(BackupStore::new(fx._tmp.path()).list().count(), 0);
    }

    #[test]
    fn no_scale_profile_counts_as_success() {
        let fx = fixture();
        let square = png_bytes(&DynamicImage::new_rgba8(256, 256));
        let api = FakeApi::with_images("u1", ImageKind::Profile, vec![(square, "image/png")]);
        let options = ProcessOptions::default();
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = orchestrator.process("u1", "Alice (u1)", ImageKind::Profile, &mut stats);
        assert_eq!(outcome, ImageOutcome::Unchanged);
        assert_eq!((stats.successes, stats.skipped), (1, 0));
    }

    #[test]
    fn force_upload_reuploads_original_bytes() {
        let fx = fixture();
        let original = jpeg_bytes(1000, 562);
        let api = FakeApi::with_images("m1", ImageKind::Thumb, vec![(original.clone(), "image/jpeg")]);
        let options = ProcessOptions {
            backup: None,
            force_upload_noscale: true,
        };
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = orchestrator.process("m1", "Movie [Thumb]", ImageKind::Thumb, &mut stats);
        assert_eq!(outcome, ImageOutcome::Uploaded);
        assert_eq!(api.stored("m1", ImageKind::Thumb)[0].0, original);
    }

    #[test]
    fn dry_run_plans_and_backs_up_without_uploading() {
        let fx = fixture();
        let api = FakeApi::with_images("m1", ImageKind::Logo, vec![(png_bytes(&DynamicImage::new_rgba8(400, 100)), "image/png")]);
        let gate = WriteGate::new(&api, true);
        let options = options_with_backup(fx._tmp.path(), BackupMode::Partial);
        let orchestrator = Orchestrator::new(&gate, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = orchestrator.process("m1", "Movie [Logo]", ImageKind::Logo, &mut stats);
        assert_eq!(outcome, ImageOutcome::Uploaded);
        assert_eq!(api.mutations(), 0);
        assert_eq!(stats.upscaled.len(), 1);
        assert_eq!(BackupStore::new(fx._tmp.path()).list().count(), 1);
    }

    #[test]
    fn undecodable_image_is_recorded_as_error() {
        let fx = fixture();
        let api = FakeApi::with_images("m1", ImageKind::Logo, vec![(b"garbage".to_vec(), "image/png")]);
        let options = ProcessOptions::default();
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = orchestrator.process("m1", "Movie [Logo]", ImageKind::Logo, &mut stats);
        assert!(outcome.is_failure());
        assert_eq!(stats.errors, 1);
        assert_eq!(api.mutations(), 0);
    }

    #[test]
    fn missing_image_is_a_fetch_error() {
        let fx = fixture();
        let api = FakeApi::default();
        let options = ProcessOptions::default();
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = orchestrator.process("m1", "Movie [Logo]", ImageKind::Logo, &mut stats);
        assert!(outcome.is_failure());
        assert!(stats.failed_items[0].error.starts_with("fetch failed"));
    }

    #[test]
    fn failed_upload_is_recorded() {
        let fx = fixture();
        let api = FakeApi::with_images("m1", ImageKind::Thumb, vec![(jpeg_bytes(500, 281), "image/jpeg")]);
        api.failing_uploads.borrow_mut().insert(0);
        let options = ProcessOptions::default();
        let orchestrator = Orchestrator::new(&api, &fx.rules, &options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = orchestrator.process("m1", "Movie [Thumb]", ImageKind::Thumb, &mut stats);
        assert!(outcome.is_failure());
        assert!(stats.failed_items[0].error.starts_with("upload failed"));
    }
}
