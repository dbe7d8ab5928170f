use crate::api::ImageApi;
use crate::discovery::{
    self, Catalog, DiscoveredItem, DiscoveryError, DiscoveryFilter, UserDto,
};
use crate::kind::ImageKind;
use crate::orchestrator::Orchestrator;
use crate::stats::RunStats;
use thiserror::Error;
use tracing::{error, info};

/// Images between two progress lines in the library pass.
const PROGRESS_EVERY: usize = 25;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("stopped after failure on {label} (fail_fast)")]
    Stopped { label: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub entities: usize,
    pub failed: usize,
}

impl PassReport {
    fn add(&mut self, failed: bool) {
        self.entities += 1;
        if failed {
            self.failed += 1;
        }
    }
}

/// Sequential driver over discovered entities. Stops after the first failed
/// entity when `fail_fast` is set.
pub struct Runner<'a, A, C: ?Sized> {
    orchestrator: Orchestrator<'a, A>,
    catalog: &'a C,
    kinds: Vec<ImageKind>,
    fail_fast: bool,
}

impl<'a, A: ImageApi, C: Catalog + ?Sized> Runner<'a, A, C> {
    pub fn new(
        orchestrator: Orchestrator<'a, A>,
        catalog: &'a C,
        kinds: Vec<ImageKind>,
        fail_fast: bool,
    ) -> Self {
        Self {
            orchestrator,
            catalog,
            kinds,
            fail_fast,
        }
    }

    fn item_kinds(&self) -> Vec<ImageKind> {
        self.kinds
            .iter()
            .copied()
            .filter(|k| *k != ImageKind::Profile)
            .collect()
    }

    /// Discovers items in the selected libraries and normalizes every
    /// selected non-profile kind they carry.
    pub fn run_libraries(
        &self,
        libraries: &[String],
        item_types: &[String],
        operator: Option<&str>,
        stats: &mut RunStats,
    ) -> Result<PassReport, RunError> {
        let mut report = PassReport::default();
        let kinds = self.item_kinds();
        if kinds.is_empty() {
            return Ok(report);
        }
        let user = discovery::resolve_operator(self.catalog, operator)?;
        info!("Using operator {}", user.label());
        let filter = DiscoveryFilter {
            library_names: libraries.to_vec(),
            item_types: item_types.to_vec(),
            kinds,
        };
        let found = discovery::discover_libraries(self.catalog, &user.id, &filter)?;

        for library in &found {
            let items = discovery::discover_items(self.catalog, &user.id, library, &filter, stats);
            let total: usize = items
                .iter()
                .map(|item| item.kinds.iter().map(|k| item.image_count(*k)).sum::<usize>())
                .sum();
            info!(
                "Library '{}': {} items, {} images to check.",
                library.name,
                items.len(),
                total
            );

            let mut done = 0;
            for item in &items {
                let failed = self.process_item(item, stats, &mut done, total);
                report.add(failed);
                self.check_fail_fast(failed, &item.name)?;
            }
            info!("[PROGRESS] '{}' done: {}/{} images.", library.name, done, total);
        }
        Ok(report)
    }

    /// Normalizes the profile image of every active user that has one.
    pub fn run_profiles(&self, stats: &mut RunStats) -> Result<PassReport, RunError> {
        let mut report = PassReport::default();
        let users = self.catalog.list_users().map_err(DiscoveryError::from)?;
        info!("[PROFILE] Checking {} active users.", users.len());
        for user in &users {
            let failed = self.process_profile(user, stats);
            report.add(failed);
            self.check_fail_fast(failed, &user.label())?;
        }
        Ok(report)
    }

    /// One item by id, without discovery.
    pub fn run_single_item(
        &self,
        item_id: &str,
        stats: &mut RunStats,
    ) -> Result<PassReport, RunError> {
        let mut report = PassReport::default();
        let dto = self.catalog.get_item(item_id).map_err(DiscoveryError::from)?;
        let item = DiscoveredItem::from_dto(&dto, &self.item_kinds());
        for kind in self.item_kinds() {
            if !item.kinds.contains(&kind) {
                info!("{} has no {} image; skipping.", item.name, kind.api_name());
                stats.record_entity(&item.id);
                stats.record_skip();
            }
        }
        let mut done = 0;
        let total = item.kinds.iter().map(|k| item.image_count(*k)).sum();
        report.add(self.process_item(&item, stats, &mut done, total));
        Ok(report)
    }

    /// One user's profile image, looked up by name.
    pub fn run_single_profile(
        &self,
        username: &str,
        stats: &mut RunStats,
    ) -> Result<PassReport, RunError> {
        let users = self.catalog.list_users().map_err(DiscoveryError::from)?;
        let user = discovery::find_user_by_name(&users, username)
            .ok_or_else(|| DiscoveryError::UserNotFound(username.to_string()))?;
        let mut report = PassReport::default();
        report.add(self.process_profile(user, stats));
        Ok(report)
    }

    fn process_item(
        &self,
        item: &DiscoveredItem,
        stats: &mut RunStats,
        done: &mut usize,
        total: usize,
    ) -> bool {
        let mut failed = false;
        for kind in self.kinds.iter().copied().filter(|k| item.kinds.contains(k)) {
            stats.record_entity(&item.id);
            let count = item.image_count(kind);
            stats.record_images_found(count);
            let outcome = self
                .orchestrator
                .process(&item.id, &item.label(kind), kind, stats);
            failed |= outcome.is_failure();

            let before = *done;
            *done += count;
            if *done / PROGRESS_EVERY > before / PROGRESS_EVERY {
                info!("[PROGRESS] {}/{} images checked.", done, total);
            }
        }
        failed
    }

    fn process_profile(&self, user: &UserDto, stats: &mut RunStats) -> bool {
        stats.record_entity(&user.id);
        if user.primary_image_tag.is_none() {
            info!("[PROFILE] {} has no profile image; skipping.", user.label());
            stats.record_skip();
            return false;
        }
        stats.record_images_found(1);
        self.orchestrator
            .process(&user.id, &user.label(), ImageKind::Profile, stats)
            .is_failure()
    }

    fn check_fail_fast(&self, failed: bool, label: &str) -> Result<(), RunError> {
        if failed && self.fail_fast {
            error!("[FAIL-FAST] Stopping run after failure on {}", label);
            return Err(RunError::Stopped {
                label: label.to_string(),
            });
        }
        Ok(())
    }
}
