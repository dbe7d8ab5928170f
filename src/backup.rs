use crate::canvas::{content_type_for_extension, extension_for_content_type};
use crate::kind::ImageKind;
use crate::planner::ScaleDecision;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Extension used when the content type does not map to a known image format.
const FALLBACK_EXTENSION: &str = "img";
const KNOWN_EXTENSIONS: [&str; 5] = ["png", "jpg", "webp", "gif", FALLBACK_EXTENSION];

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no backup for {entity_id} {kind} #{index}")]
    NotFound {
        entity_id: String,
        kind: ImageKind,
        index: usize,
    },
    #[error("invalid entity id {0:?}")]
    InvalidEntityId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupMode {
    /// Only originals that are actually rescaled.
    #[default]
    Partial,
    Full,
}

impl BackupMode {
    /// Unknown values fall back to `Partial` with a warning.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => BackupMode::Full,
            "partial" => BackupMode::Partial,
            _ => {
                warn!("Unknown backup_mode '{}'; defaulting to 'partial'.", raw);
                BackupMode::Partial
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupMode::Partial => "partial",
            BackupMode::Full => "full",
        }
    }

    pub fn should_backup(self, decision: ScaleDecision) -> bool {
        match self {
            BackupMode::Full => true,
            BackupMode::Partial => decision != ScaleDecision::NoScale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub entity_id: String,
    pub kind: ImageKind,
    pub index: usize,
    pub path: PathBuf,
}

impl BackupEntry {
    pub fn content_type(&self) -> &'static str {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(content_type_for_extension)
            .unwrap_or("application/octet-stream")
    }
}

/// Durable store of original images, laid out as
/// `<root>/<first two chars of id>/<id>/<stem>[index].<ext>`.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity_dir(&self, entity_id: &str) -> Result<PathBuf, BackupError> {
        validate_entity_id(entity_id)?;
        let prefix: String = entity_id.chars().take(2).collect();
        Ok(self.root.join(prefix).join(entity_id))
    }

    pub fn path_for(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        content_type: &str,
    ) -> Result<PathBuf, BackupError> {
        let ext = extension_for_content_type(content_type).unwrap_or(FALLBACK_EXTENSION);
        Ok(self
            .entity_dir(entity_id)?
            .join(format!("{}.{}", file_stem(kind, index), ext)))
    }

    /// Writes `bytes` unless an identical backup already exists. A previous
    /// backup of the same image under another extension is replaced.
    pub fn put(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, BackupError> {
        let path = self.path_for(entity_id, kind, index, content_type)?;

        if path.exists() {
            let current = fs::read(&path)?;
            if blake3::hash(&current) == blake3::hash(bytes) {
                info!("  -> Backup already up to date at {}", path.display());
                return Ok(path);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let existed = path.exists();
        fs::write(&path, bytes)?;
        self.remove_stale_variants(&path, entity_id, kind, index)?;
        if existed {
            info!("  -> Backup updated at {}", path.display());
        } else {
            info!("  -> Backup saved to {}", path.display());
        }
        Ok(path)
    }

    pub fn get(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<(Vec<u8>, &'static str), BackupError> {
        let dir = self.entity_dir(entity_id)?;
        let stem = file_stem(kind, index);
        for ext in KNOWN_EXTENSIONS {
            let path = dir.join(format!("{}.{}", stem, ext));
            if path.is_file() {
                let content_type =
                    content_type_for_extension(ext).unwrap_or("application/octet-stream");
                return Ok((fs::read(&path)?, content_type));
            }
        }
        Err(BackupError::NotFound {
            entity_id: entity_id.to_string(),
            kind,
            index,
        })
    }

    /// Lazily walks the store in file-name order. Dot-directories (the
    /// staging area lives under one by default) are skipped.
    pub fn list(&self) -> impl Iterator<Item = BackupEntry> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(3)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry))
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.depth() == 3)
            .filter_map(backup_entry)
    }

    fn remove_stale_variants(
        &self,
        keep: &Path,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
    ) -> Result<(), BackupError> {
        let dir = self.entity_dir(entity_id)?;
        let stem = file_stem(kind, index);
        for ext in KNOWN_EXTENSIONS {
            let candidate = dir.join(format!("{}.{}", stem, ext));
            if candidate != keep && candidate.is_file() {
                debug!("  -> Removing stale backup {}", candidate.display());
                fs::remove_file(&candidate)?;
            }
        }
        Ok(())
    }
}

fn validate_entity_id(entity_id: &str) -> Result<(), BackupError> {
    let trimmed = entity_id.trim();
    if trimmed.is_empty()
        || trimmed != entity_id
        || entity_id.contains(|c| c == '/' || c == '\\')
        || entity_id.contains("..")
        || entity_id.starts_with('.')
    {
        return Err(BackupError::InvalidEntityId(entity_id.to_string()));
    }
    Ok(())
}

fn file_stem(kind: ImageKind, index: usize) -> String {
    if kind.is_ordered() {
        format!("{}{}", kind.backup_stem(), index)
    } else {
        kind.backup_stem().to_string()
    }
}

/// Inverse of `file_stem`. A bare ordered stem maps to index 0.
fn parse_stem(stem: &str) -> Option<(ImageKind, usize)> {
    let stem = stem.to_ascii_lowercase();
    for kind in ImageKind::ALL {
        let base = kind.backup_stem();
        if stem == base {
            return Some((kind, 0));
        }
        if kind.is_ordered() {
            if let Some(digits) = stem.strip_prefix(base) {
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    return digits.parse().ok().map(|index| (kind, index));
                }
            }
        }
    }
    None
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map_or(true, |name| name.starts_with('.'))
}

/// `<prefix>/<entity id>/<file>` to an entry, or `None` for anything else.
fn backup_entry(entry: DirEntry) -> Option<BackupEntry> {
    if !entry.file_type().is_file() {
        return None;
    }
    let path = entry.into_path();
    let parsed = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(parse_stem);
    let Some((kind, index)) = parsed else {
        debug!("Ignoring unrecognised backup file {}", path.display());
        return None;
    };
    let entity_id = path
        .parent()
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())?
        .to_string();
    Some(BackupEntry {
        entity_id,
        kind,
        index,
        path,
    })
}

/// Run-scoped scratch space for normalized images awaiting upload:
/// `<staging root>/<run id>/<entity id>/<stem><index>.<ext>`.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(root: &Path, run_id: &str) -> Self {
        Self {
            dir: root.join(run_id),
        }
    }

    pub fn entity_dir(&self, entity_id: &str) -> Result<PathBuf, BackupError> {
        validate_entity_id(entity_id)?;
        Ok(self.dir.join(entity_id))
    }

    pub fn stage(
        &self,
        entity_id: &str,
        kind: ImageKind,
        index: usize,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, BackupError> {
        let dir = self.entity_dir(entity_id)?;
        fs::create_dir_all(&dir)?;
        let ext = extension_for_content_type(content_type).unwrap_or(FALLBACK_EXTENSION);
        let path = dir.join(format!("{}{}.{}", kind.backup_stem(), index, ext));
        fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, BackupError> {
        Ok(fs::read(path)?)
    }

    /// Removes the entity's staged files, and the run directory once empty.
    pub fn discard(&self, entity_id: &str) -> Result<(), BackupError> {
        let dir = self.entity_dir(entity_id)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        if fs::read_dir(&self.dir).map_or(false, |mut it| it.next().is_none()) {
            fs::remove_dir(&self.dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_mode_skips_no_scale() {
        assert!(BackupMode::Partial.should_backup(ScaleDecision::ScaleUp));
        assert!(BackupMode::Partial.should_backup(ScaleDecision::ScaleDown));
        assert!(!BackupMode::Partial.should_backup(ScaleDecision::NoScale));
        assert!(BackupMode::Full.should_backup(ScaleDecision::NoScale));
    }

    #[test]
    fn unknown_backup_mode_defaults_to_partial() {
        assert_eq!(BackupMode::parse(" FULL "), BackupMode::Full);
        assert_eq!(BackupMode::parse("sometimes"), BackupMode::Partial);
    }

    #[test]
    fn path_scheme_partitions_by_prefix() {
        let store = BackupStore::new("/backups");
        let path = store
            .path_for("abcdef", ImageKind::Thumb, 0, "image/jpeg")
            .unwrap();
        assert_eq!(path, PathBuf::from("/backups/ab/abcdef/landscape.jpg"));
        let path = store
            .path_for("abcdef", ImageKind::Backdrop, 2, "image/png")
            .unwrap();
        assert_eq!(path, PathBuf::from("/backups/ab/abcdef/backdrop2.png"));
        let path = store
            .path_for("abcdef", ImageKind::Logo, 0, "application/x-unknown")
            .unwrap();
        assert_eq!(path, PathBuf::from("/backups/ab/abcdef/logo.img"));
    }

    #[test]
    fn rejects_path_like_entity_ids() {
        let store = BackupStore::new("/backups");
        for id in ["", "../etc", "a/b", ".hidden", " padded"] {
            assert!(matches!(
                store.path_for(id, ImageKind::Logo, 0, "image/png"),
                Err(BackupError::InvalidEntityId(_))
            ));
        }
    }

    #[test]
    fn identical_bytes_are_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(tmp.path());
        let path = store
            .put("item1", ImageKind::Logo, 0, "image/png", b"original")
            .unwrap();
        let before = fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store
            .put("item1", ImageKind::Logo, 0, "image/png", b"original")
            .unwrap();
        let after = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);

        store
            .put("item1", ImageKind::Logo, 0, "image/png", b"changed")
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"changed");
    }

    #[test]
    fn new_extension_replaces_stale_variant() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(tmp.path());
        let png = store
            .put("item1", ImageKind::Thumb, 0, "image/png", b"one")
            .unwrap();
        let jpg = store
            .put("item1", ImageKind::Thumb, 0, "image/jpeg", b"two")
            .unwrap();
        assert!(!png.exists());
        assert!(jpg.exists());
        let (bytes, content_type) = store.get("item1", ImageKind::Thumb, 0).unwrap();
        assert_eq!(bytes, b"two");
        assert_eq!(content_type, "image/jpeg");
    }

    #[test]
    fn missing_backup_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(tmp.path());
        assert!(matches!(
            store.get("item1", ImageKind::Backdrop, 3),
            Err(BackupError::NotFound { index: 3, .. })
        ));
    }

    #[test]
    fn list_walks_every_backup_and_skips_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(tmp.path());
        store.put("aa11", ImageKind::Logo, 0, "image/png", b"l").unwrap();
        store.put("aa11", ImageKind::Backdrop, 0, "image/jpeg", b"b0").unwrap();
        store.put("aa11", ImageKind::Backdrop, 1, "image/jpeg", b"b1").unwrap();
        store.put("bb22", ImageKind::Profile, 0, "image/webp", b"p").unwrap();
        fs::write(store.entity_dir("bb22").unwrap().join("notes.txt"), b"x").unwrap();
        fs::write(tmp.path().join("aa").join("logo.png"), b"misplaced").unwrap();
        let staging = StagingArea::new(&tmp.path().join(".staging"), "run1");
        staging.stage("aa11", ImageKind::Backdrop, 0, "image/jpeg", b"s").unwrap();

        let mut entries: Vec<_> = store
            .list()
            .map(|e| (e.entity_id, e.kind, e.index))
            .collect();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("aa11".to_string(), ImageKind::Logo, 0),
                ("aa11".to_string(), ImageKind::Backdrop, 0),
                ("aa11".to_string(), ImageKind::Backdrop, 1),
                ("bb22".to_string(), ImageKind::Profile, 0),
            ]
        );
        assert_eq!(store.list().count(), 4);
    }

    #[test]
    fn bare_ordered_stem_is_index_zero() {
        assert_eq!(parse_stem("backdrop"), Some((ImageKind::Backdrop, 0)));
        assert_eq!(parse_stem("backdrop12"), Some((ImageKind::Backdrop, 12)));
        assert_eq!(parse_stem("landscape"), Some((ImageKind::Thumb, 0)));
        assert_eq!(parse_stem("logo1"), None);
    }

    #[test]
    fn staging_discard_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path(), "run1");
        let path = staging
            .stage("item1", ImageKind::Backdrop, 1, "image/jpeg", b"x")
            .unwrap();
        assert!(path.ends_with("run1/item1/backdrop1.jpg"));
        assert_eq!(staging.read(&path).unwrap(), b"x");
        staging.discard("item1").unwrap();
        assert!(!path.exists());
        assert!(!tmp.path().join("run1").exists());
    }
}
