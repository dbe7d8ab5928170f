use crate::api::{ImageApi, RemoteImage};
use crate::backup::StagingArea;
use crate::canvas::{self, CanvasError, Normalized};
use crate::kind::{ImageKind, ModeRules};
use crate::orchestrator::{record_plan, EntityError, ProcessOptions};
use crate::stats::RunStats;
use rayon::prelude::*;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Result of the existence check after the delete phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    NotReached,
    /// Index 0 reported absent.
    Confirmed,
    /// Dry-run: nothing was deleted, so nothing was checked.
    Simulated,
    /// Index 0 still reported present after the deletes.
    StillPresent,
    /// The check itself failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStatus {
    pub index: usize,
    pub uploaded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub entity_id: String,
    pub kind: ImageKind,
    pub success: bool,
    pub verification: Verification,
    pub per_image_status: Vec<ImageStatus>,
    /// Set when the cycle stopped before re-uploading.
    pub aborted: Option<String>,
    pub staging_retained: bool,
}

impl ReplaceOutcome {
    fn new(entity_id: &str, kind: ImageKind) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind,
            success: false,
            verification: Verification::NotReached,
            per_image_status: Vec::new(),
            aborted: None,
            staging_retained: false,
        }
    }
}

/// A file on disk waiting to be uploaded at `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub index: usize,
    pub path: PathBuf,
    pub content_type: String,
}

/// Where the files being uploaded live.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Normalized copies in this run's staging area.
    Staging,
    /// Files owned by someone else, such as the backup store.
    External,
}

enum State {
    Fetch,
    Validate(Vec<RemoteImage>),
    Stage(Vec<RemoteImage>),
    Count(Vec<StagedImage>),
    Delete {
        staged: Vec<StagedImage>,
        existing: usize,
    },
    Verify(Vec<StagedImage>),
    Reupload(Vec<StagedImage>, Verification),
    Done(ReplaceOutcome),
}

/// Zero-based and gap-free, in ascending order.
pub fn validate_sequence(indices: impl IntoIterator<Item = usize>) -> Result<(), EntityError> {
    let found: Vec<usize> = indices.into_iter().collect();
    if found.iter().copied().eq(0..found.len()) {
        Ok(())
    } else {
        Err(EntityError::IndexSequence { found })
    }
}

/// Replaces the whole ordered image set of one entity:
/// fetch, validate, stage, delete, verify, re-upload.
pub struct Coordinator<'a, A> {
    api: &'a A,
    rules: &'a ModeRules,
    options: &'a ProcessOptions,
    staging: &'a StagingArea,
}

impl<'a, A: ImageApi> Coordinator<'a, A> {
    pub fn new(
        api: &'a A,
        rules: &'a ModeRules,
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

    /// Normalizes and replaces every image of the entity.
    pub fn run(&self, entity_id: &str, label: &str, stats: &mut RunStats) -> ReplaceOutcome {
        self.drive(entity_id, label, State::Fetch, Origin::Staging, stats)
    }

    /// Replaces the entity's set with files that are already on disk, in
    /// index order. Used by restore.
    pub fn replace_with(
        &self,
        entity_id: &str,
        label: &str,
        staged: Vec<StagedImage>,
        stats: &mut RunStats,
    ) -> ReplaceOutcome {
        self.drive(entity_id, label, State::Count(staged), Origin::External, stats)
    }

    fn kind(&self) -> ImageKind {
        self.rules.kind
    }

    fn drive(
        &self,
        entity_id: &str,
        label: &str,
        mut state: State,
        origin: Origin,
        stats: &mut RunStats,
    ) -> ReplaceOutcome {
        let kind = self.kind();
        loop {
            state = match state {
                State::Fetch => match self.api.fetch_all_images(entity_id, kind) {
                    Ok(images) if images.is_empty() => {
                        info!("Item {} has no {} images; skipping.", entity_id, kind.api_name());
                        stats.record_skip();
                        let mut outcome = ReplaceOutcome::new(entity_id, kind);
                        outcome.success = true;
                        State::Done(outcome)
                    }
                    Ok(images) => State::Validate(images),
                    Err(e) => State::Done(self.abort(entity_id, label, EntityError::Fetch(e), stats)),
                },
                State::Validate(images) => {
                    match validate_sequence(images.iter().map(|image| image.index)) {
                        Ok(()) => State::Stage(images),
                        Err(e) => State::Done(self.abort(entity_id, label, e, stats)),
                    }
                }
                State::Stage(images) => {
                    let existing = images.len();
                    match self.stage(entity_id, label, images, stats) {
                        Ok(Some(staged)) => State::Delete { staged, existing },
                        Ok(None) => State::Done(self.unchanged(entity_id, label, stats)),
                        Err(e) => {
                            self.discard(entity_id);
                            State::Done(self.abort(entity_id, label, e, stats))
                        }
                    }
                }
                State::Count(staged) => match self.api.count_images(entity_id, kind) {
                    Ok(existing) => State::Delete { staged, existing },
                    Err(e) => State::Done(self.abort(entity_id, label, EntityError::Fetch(e), stats)),
                },
                State::Delete { staged, existing } => match self.delete_all(entity_id, existing) {
                    Ok(()) => State::Verify(staged),
                    Err(e) => {
                        State::Done(self.delete_failed(entity_id, label, &staged, origin, e, stats))
                    }
                },
                State::Verify(staged) => {
                    let verification = self.verify(entity_id, label, stats);
                    State::Reupload(staged, verification)
                }
                State::Reupload(staged, verification) => {
                    State::Done(self.reupload(entity_id, label, staged, verification, origin, stats))
                }
                State::Done(outcome) => return outcome,
            };
        }
    }

    /// Decodes and normalizes the set on the rayon pool, then backs up and
    /// stages each image in index order. `None` when no image needs a
    /// rebuild and nothing is forced; nothing is staged then.
    fn stage(
        &self,
        entity_id: &str,
        label: &str,
        images: Vec<RemoteImage>,
        stats: &mut RunStats,
    ) -> Result<Option<Vec<StagedImage>>, EntityError> {
        let rules = self.rules;
        let normalized: Vec<Result<Normalized, CanvasError>> = images
            .par_iter()
            .map(|image| {
                canvas::ensure_image_content_type(&image.content_type)?;
                canvas::normalize(&image.bytes, rules)
            })
            .collect();

        let mut planned = Vec::with_capacity(images.len());
        for (image, result) in images.iter().zip(normalized) {
            let image_label = format!("{} #{}", label, image.index);
            let normalized = result?;
            record_plan(
                entity_id,
                &image_label,
                image,
                &normalized.plan,
                normalized.trim,
                &normalized.source,
                rules,
                self.options,
                stats,
            )?;
            planned.push((image, image_label, normalized));
        }

        if !self.options.force_upload_noscale
            && planned.iter().all(|(_, _, normalized)| normalized.rendered.is_none())
        {
            return Ok(None);
        }

        let mut staged = Vec::with_capacity(planned.len());
        for (image, image_label, normalized) in planned {
            let (bytes, content_type) = match &normalized.rendered {
                Some(rendered) => (rendered.bytes.as_slice(), rendered.content_type),
                None => (image.bytes.as_slice(), image.content_type.as_str()),
            };
            let path = self
                .staging
                .stage(entity_id, self.kind(), image.index, content_type, bytes)
                .map_err(EntityError::Staging)?;
            debug!("  -> Staged {} at {}", image_label, path.display());
            staged.push(StagedImage {
                index: image.index,
                path,
                content_type: content_type.to_string(),
            });
        }
        Ok(Some(staged))
    }

    fn unchanged(&self, entity_id: &str, label: &str, stats: &mut RunStats) -> ReplaceOutcome {
        info!(
            "[SKIP] Every {} image of {} already fits the canvas; leaving the set untouched.",
            self.kind().api_name(),
            label
        );
        stats.record_skip();
        let mut outcome = ReplaceOutcome::new(entity_id, self.kind());
        outcome.success = true;
        outcome
    }

    /// Highest index first, so earlier indices never shift underneath us.
    fn delete_all(&self, entity_id: &str, existing: usize) -> Result<(), EntityError> {
        for index in (0..existing).rev() {
            self.api
                .delete_image(entity_id, self.kind(), index)
                .map_err(EntityError::Delete)?;
        }
        debug!(
            "  -> Deleted {} original {} images for {}",
            existing,
            self.kind().api_name(),
            entity_id
        );
        Ok(())
    }

    fn verify(&self, entity_id: &str, label: &str, stats: &mut RunStats) -> Verification {
        if self.api.dry_run() {
            debug!("[DRY-RUN] Skipping delete verification for {}", label);
            return Verification::Simulated;
        }
        match self.api.head_image(entity_id, self.kind(), 0, false) {
            Ok(false) => Verification::Confirmed,
            Ok(true) => {
                error!(
                    "[ERROR] Delete verification failed for {}: an image is still present at index 0; continuing with re-upload.",
                    label
                );
                stats.record_warning();
                Verification::StillPresent
            }
            Err(e) => {
                warn!("[WARN] Delete verification check failed for {}: {}", label, e);
                stats.record_warning();
                Verification::Failed
            }
        }
    }

    fn reupload(
        &self,
        entity_id: &str,
        label: &str,
        staged: Vec<StagedImage>,
        verification: Verification,
        origin: Origin,
        stats: &mut RunStats,
    ) -> ReplaceOutcome {
        let mut outcome = ReplaceOutcome::new(entity_id, self.kind());
        outcome.verification = verification;

        for image in &staged {
            let image_label = format!("{} #{}", label, image.index);
            let result = self
                .staging
                .read(&image.path)
                .map_err(EntityError::Staging)
                .and_then(|bytes| {
                    self.api
                        .upload_image(entity_id, self.kind(), image.index, &bytes, &image.content_type)
                        .map_err(EntityError::Upload)
                });
            match result {
                Ok(()) => {
                    stats.record_success();
                    outcome.per_image_status.push(ImageStatus {
                        index: image.index,
                        uploaded: true,
                        error: None,
                    });
                }
                Err(e) => {
                    error!("[ERROR] Failed to upload {}: {}", image_label, e);
                    stats.record_error(image_label, e.to_string());
                    outcome.per_image_status.push(ImageStatus {
                        index: image.index,
                        uploaded: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        outcome.success = outcome.per_image_status.iter().all(|s| s.uploaded);
        match (outcome.success, origin) {
            (true, Origin::Staging) => self.discard(entity_id),
            (false, Origin::Staging) => {
                outcome.staging_retained = true;
                error!(
                    "[ERROR] One or more uploads failed for {}; retaining staged files at {}.",
                    label,
                    self.staged_location(entity_id)
                );
            }
            (false, Origin::External) => error!(
                "[ERROR] One or more uploads failed for {}; source files were left in place.",
                label
            ),
            (true, Origin::External) => {}
        }
        if outcome.success {
            info!("[SUCCESS] All {} images processed for {}.", self.kind().api_name(), label);
        }
        outcome
    }

    fn abort(
        &self,
        entity_id: &str,
        label: &str,
        err: EntityError,
        stats: &mut RunStats,
    ) -> ReplaceOutcome {
        error!("[ERROR] Aborting {} before any change: {}", label, err);
        stats.record_error(label, err.to_string());
        let mut outcome = ReplaceOutcome::new(entity_id, self.kind());
        outcome.aborted = Some(err.to_string());
        outcome
    }

    fn delete_failed(
        &self,
        entity_id: &str,
        label: &str,
        staged: &[StagedImage],
        origin: Origin,
        err: EntityError,
        stats: &mut RunStats,
    ) -> ReplaceOutcome {
        let kept = match origin {
            Origin::Staging => format!("staged files kept at {}", self.staged_location(entity_id)),
            Origin::External => "source files left in place".to_string(),
        };
        error!(
            "[ERROR] Delete phase failed for {}; nothing re-uploaded, {}: {}",
            label, kept, err
        );
        stats.record_error(label, err.to_string());
        let mut outcome = ReplaceOutcome::new(entity_id, self.kind());
        outcome.per_image_status = staged
            .iter()
            .map(|image| ImageStatus {
                index: image.index,
                uploaded: false,
                error: Some(err.to_string()),
            })
            .collect();
        outcome.aborted = Some(err.to_string());
        outcome.staging_retained = origin == Origin::Staging;
        outcome
    }

    fn discard(&self, entity_id: &str) {
        if let Err(e) = self.staging.discard(entity_id) {
            warn!("[WARN] Could not clean staging for {}: {}", entity_id, e);
        }
    }

    fn staged_location(&self, entity_id: &str) -> String {
        self.staging
            .entity_dir(entity_id)
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|_| "<invalid entity id>".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;
    use crate::api::WriteGate;
    use crate::backup::{BackupMode, BackupStore};
    use crate::canvas::tests::jpeg_bytes;
    use crate::orchestrator::BackupPolicy;

    const LABEL: &str = "Movie [b1] backdrop";

    struct Fixture {
        tmp: tempfile::TempDir,
        staging: StagingArea,
        rules: ModeRules,
        options: ProcessOptions,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(&tmp.path().join(".staging"), "run");
        Fixture {
            staging,
            rules: ModeRules {
                width: 64,
                height: 36,
                ..ModeRules::defaults(ImageKind::Backdrop)
            },
            options: ProcessOptions::default(),
            tmp,
        }
    }

    fn backdrops(sizes: &[(u32, u32)]) -> FakeApi {
        FakeApi::with_images(
            "b1",
            ImageKind::Backdrop,
            sizes
                .iter()
                .map(|(w, h)| (jpeg_bytes(*w, *h), "image/jpeg"))
                .collect(),
        )
    }

    fn staged_files(fx: &Fixture) -> usize {
        fx.staging
            .entity_dir("b1")
            .ok()
            .and_then(|dir| std::fs::read_dir(dir).ok())
            .map_or(0, |it| it.count())
    }

    #[test]
    fn sequence_validation() {
        assert!(validate_sequence([0, 1, 2]).is_ok());
        assert!(validate_sequence(Vec::new()).is_ok());
        assert!(matches!(
            validate_sequence([0, 1, 3]),
            Err(EntityError::IndexSequence { found }) if found == vec![0, 1, 3]
        ));
        assert!(validate_sequence([0, 0]).is_err());
        assert!(validate_sequence([1]).is_err());
    }

    #[test]
    fn replaces_whole_set_in_order() {
        let fx = fixture();
        let api = backdrops(&[(128, 72), (640, 200)]);
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();

        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert!(outcome.success);
        assert_eq!(outcome.verification, Verification::Confirmed);
        assert_eq!(
            *api.deletes.borrow(),
            vec![
                ("b1".to_string(), ImageKind::Backdrop, 1),
                ("b1".to_string(), ImageKind::Backdrop, 0)
            ]
        );
        let stored = api.stored("b1", ImageKind::Backdrop);
        assert_eq!(stored.len(), 2);
        for (bytes, _) in stored {
            let img = image::load_from_memory(&bytes).unwrap();
            assert_eq!((img.width(), img.height()), (64, 36));
        }
        assert_eq!(stats.successes, 2);
        assert!(!outcome.staging_retained);
        assert_eq!(staged_files(&fx), 0);
    }

    #[test]
    fn partial_upload_failure_keeps_going_and_keeps_staging() {
        let fx = fixture();
        let api = backdrops(&[(128, 72), (128, 72), (128, 72)]);
        api.failing_uploads.borrow_mut().insert(1);
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();

        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert!(!outcome.success);
        let summary: Vec<_> = outcome
            .per_image_status
            .iter()
            .map(|s| (s.index, s.uploaded, s.error.is_some()))
            .collect();
        assert_eq!(summary, vec![(0, true, false), (1, false, true), (2, true, false)]);
        assert!(outcome.staging_retained);
        assert_eq!(staged_files(&fx), 3);
        assert_eq!((stats.successes, stats.errors), (2, 1));
    }

    #[test]
    fn dry_run_runs_every_phase_without_mutations() {
        let fx = fixture();
        let api = backdrops(&[(128, 72), (32, 18)]);
        let gate = WriteGate::new(&api, true);
        let coordinator = Coordinator::new(&gate, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();

        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert!(outcome.success);
        assert_eq!(outcome.verification, Verification::Simulated);
        assert_eq!(
            outcome.per_image_status,
            vec![
                ImageStatus { index: 0, uploaded: true, error: None },
                ImageStatus { index: 1, uploaded: true, error: None },
            ]
        );
        assert_eq!(api.mutations(), 0);
        assert_eq!(api.heads.get(), 0);
        assert_eq!(api.stored("b1", ImageKind::Backdrop).len(), 2);
    }

    #[test]
    fn no_images_is_a_trivial_success() {
        let fx = fixture();
        let api = FakeApi::default();
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert!(outcome.success);
        assert!(outcome.per_image_status.is_empty());
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn bad_image_aborts_before_any_delete() {
        let fx = fixture();
        let api = FakeApi::with_images(
            "b1",
            ImageKind::Backdrop,
            vec![
                (jpeg_bytes(128, 72), "image/jpeg"),
                (b"<html>oops</html>".to_vec(), "text/html"),
            ],
        );
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert!(!outcome.success);
        assert!(outcome.aborted.is_some());
        assert_eq!(api.mutations(), 0);
        assert_eq!(staged_files(&fx), 0);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn still_present_after_delete_is_reported_and_reuploaded() {
        let fx = fixture();
        let api = backdrops(&[(128, 72)]);
        api.ignore_deletes.set(true);
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert_eq!(outcome.verification, Verification::StillPresent);
        assert_eq!(stats.warnings, 1);
        assert_eq!(api.uploads.borrow().len(), 1);
        assert!(outcome.success);
    }

    #[test]
    fn existence_check_failure_still_reuploads() {
        let fx = fixture();
        let api = backdrops(&[(128, 72), (128, 72)]);
        api.fail_heads.set(true);
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert_eq!(outcome.verification, Verification::Failed);
        assert_eq!(stats.warnings, 1);
        assert_eq!(api.heads.get(), 1);
        assert_eq!(api.uploads.borrow().len(), 2);
        assert!(outcome.success);
        assert_eq!(stats.successes, 2);
    }

    #[test]
    fn second_pass_over_normalized_set_changes_nothing() {
        let fx = fixture();
        let api = backdrops(&[(128, 72), (128, 72)]);
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);

        let mut first = RunStats::new();
        assert!(coordinator.run("b1", LABEL, &mut first).success);
        assert_eq!((api.deletes.borrow().len(), api.uploads.borrow().len()), (2, 2));

        let mut second = RunStats::new();
        let outcome = coordinator.run("b1", LABEL, &mut second);
        assert!(outcome.success);
        assert_eq!(outcome.verification, Verification::NotReached);
        assert!(outcome.per_image_status.is_empty());
        assert_eq!((api.deletes.borrow().len(), api.uploads.borrow().len()), (2, 2));
        assert_eq!(api.heads.get(), 1);
        assert_eq!((second.skipped, second.successes), (1, 0));
        assert_eq!(staged_files(&fx), 0);
    }

    #[test]
    fn forced_upload_replaces_unchanged_set() {
        let mut fx = fixture();
        fx.options.force_upload_noscale = true;
        let api = backdrops(&[(64, 36), (64, 36)]);
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert!(outcome.success);
        assert_eq!(api.deletes.borrow().len(), 2);
        assert_eq!(api.uploads.borrow().len(), 2);
        assert_eq!(api.stored("b1", ImageKind::Backdrop)[0].0, jpeg_bytes(64, 36));
    }

    #[test]
    fn failed_replace_from_outside_files_retains_no_staging() {
        let fx = fixture();
        let api = backdrops(&[(64, 36), (64, 36)]);
        api.failing_uploads.borrow_mut().insert(1);
        let source = fx.tmp.path().join("originals");
        std::fs::create_dir_all(&source).unwrap();
        let staged: Vec<StagedImage> = (0..2)
            .map(|index| {
                let path = source.join(format!("backdrop{}.jpg", index));
                std::fs::write(&path, jpeg_bytes(80, 45)).unwrap();
                StagedImage {
                    index,
                    path,
                    content_type: "image/jpeg".into(),
                }
            })
            .collect();
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();

        let outcome = coordinator.replace_with("b1", LABEL, staged, &mut stats);
        assert!(!outcome.success);
        assert!(!outcome.staging_retained);
        assert!(source.join("backdrop0.jpg").is_file());
        assert!(source.join("backdrop1.jpg").is_file());
        assert_eq!(staged_files(&fx), 0);
    }

    #[test]
    fn delete_failure_stops_before_upload() {
        let fx = fixture();
        let api = backdrops(&[(128, 72), (128, 72)]);
        api.fail_deletes.set(true);
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();
        let outcome = coordinator.run("b1", LABEL, &mut stats);
        assert!(!outcome.success);
        assert!(api.uploads.borrow().is_empty());
        assert!(outcome.per_image_status.iter().all(|s| !s.uploaded));
        assert!(outcome.staging_retained);
        assert_eq!(staged_files(&fx), 2);
    }

    #[test]
    fn originals_are_backed_up_per_index() {
        let mut fx = fixture();
        fx.options.backup = Some(BackupPolicy {
            store: BackupStore::new(fx.tmp.path()),
            mode: BackupMode::Full,
        });
        let api = backdrops(&[(64, 36), (128, 72)]);
        let coordinator = Coordinator::new(&api, &fx.rules, &fx.options, &fx.staging);
        let mut stats = RunStats::new();
        coordinator.run("b1", LABEL, &mut stats);

        let store = BackupStore::new(fx.tmp.path());
        assert_eq!(store.get("b1", ImageKind::Backdrop, 0).unwrap().0, jpeg_bytes(64, 36));
        assert_eq!(store.get("b1", ImageKind::Backdrop, 1).unwrap().0, jpeg_bytes(128, 72));
    }
}
