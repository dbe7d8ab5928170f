use crate::backup::BackupMode;
use crate::cli::{split_list, Cli, Size};
use crate::client::ClientSettings;
use crate::kind::{ImageKind, ModeRules, OutputFormat, Padding, RuleSet};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_ITEM_TYPES: [&str; 2] = ["Movie", "Series"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
    #[error("config generation supports only .toml files (got {0})")]
    NotToml(String),
    #[error("refusing to overwrite existing config {0}")]
    Exists(String),
    #[error("failed to write config {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// A list given either as a TOML array or as one `a|b,c` string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    Joined(String),
    Items(Vec<String>),
}

impl Default for StringList {
    fn default() -> Self {
        StringList::Items(Vec::new())
    }
}

impl StringList {
    pub fn items(&self) -> Vec<String> {
        match self {
            StringList::Joined(raw) => split_list(raw),
            StringList::Items(items) => items
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub jf_url: String,
    pub jf_api_key: String,
    /// Seconds.
    pub timeout: f64,
    pub jf_delay_ms: u64,
    pub api_retry_count: u32,
    pub api_retry_backoff_ms: u64,
    pub fail_fast: bool,
    pub dry_run: bool,
    pub backup: bool,
    pub backup_mode: String,
    pub backup_dir: PathBuf,
    pub staging_dir: Option<PathBuf>,
    pub force_upload_noscale: bool,
    pub operations: StringList,
    pub item_types: StringList,
    pub libraries: LibrariesConfig,
    pub operator: OperatorConfig,
    pub logging: LoggingConfig,
    pub logo: ModeConfig,
    pub thumb: ModeConfig,
    pub backdrop: ModeConfig,
    pub profile: ModeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jf_url: String::new(),
            jf_api_key: String::new(),
            timeout: 15.0,
            jf_delay_ms: 0,
            api_retry_count: 3,
            api_retry_backoff_ms: 500,
            fail_fast: false,
            dry_run: false,
            backup: false,
            backup_mode: "partial".into(),
            backup_dir: PathBuf::from("backup"),
            staging_dir: None,
            force_upload_noscale: false,
            operations: StringList::default(),
            item_types: StringList::default(),
            libraries: LibrariesConfig::default(),
            operator: OperatorConfig::default(),
            logging: LoggingConfig::default(),
            logo: ModeConfig::default(),
            thumb: ModeConfig::default(),
            backdrop: ModeConfig::default(),
            profile: ModeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LibrariesConfig {
    pub names: StringList,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OperatorConfig {
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub silent: bool,
    pub cli_level: String,
    pub file_enabled: bool,
    pub file_level: String,
    pub file_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            silent: false,
            cli_level: "info".into(),
            file_enabled: true,
            file_level: "info".into(),
            file_path: PathBuf::from("artnorm.log"),
        }
    }
}

/// One `[logo]`/`[thumb]`/`[backdrop]`/`[profile]` section. Keys that do
/// not apply to a kind are ignored for it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub no_upscale: bool,
    pub no_downscale: bool,
    pub jpeg_quality: u8,
    pub webp_quality: u8,
    pub webp_method: u8,
    pub padding: Padding,
    pub padding_remove_sensitivity: u8,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            no_upscale: false,
            no_downscale: false,
            jpeg_quality: 85,
            webp_quality: 80,
            webp_method: 6,
            padding: Padding::Add,
            padding_remove_sensitivity: 1,
        }
    }
}

impl ModeConfig {
    fn normalize(&mut self) {
        self.jpeg_quality = self.jpeg_quality.clamp(1, 95);
        self.webp_quality = self.webp_quality.clamp(1, 100);
        self.webp_method = self.webp_method.min(6);
    }

    fn set_size(&mut self, size: Option<Size>) {
        if let Some(size) = size {
            self.width = Some(size.width);
            self.height = Some(size.height);
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display(path),
            source,
        })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: display(path),
            source,
        })?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        self.jf_url = self.jf_url.trim().trim_end_matches('/').to_string();
        self.jf_api_key = self.jf_api_key.trim().to_string();
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            self.timeout = 15.0;
        }
        if self.backup_dir.as_os_str().is_empty() {
            self.backup_dir = PathBuf::from("backup");
        }
        if self
            .staging_dir
            .as_ref()
            .map_or(false, |p| p.as_os_str().is_empty())
        {
            self.staging_dir = None;
        }
        if self
            .operator
            .username
            .as_deref()
            .map_or(false, |name| name.trim().is_empty())
        {
            self.operator.username = None;
        }
        if self.logging.file_path.as_os_str().is_empty() {
            self.logging.file_path = PathBuf::from("artnorm.log");
        }
        for kind in ImageKind::ALL {
            self.section_mut(kind).normalize();
        }
    }

    pub fn section(&self, kind: ImageKind) -> &ModeConfig {
        match kind {
            ImageKind::Logo => &self.logo,
            ImageKind::Thumb => &self.thumb,
            ImageKind::Backdrop => &self.backdrop,
            ImageKind::Profile => &self.profile,
        }
    }

    fn section_mut(&mut self, kind: ImageKind) -> &mut ModeConfig {
        match kind {
            ImageKind::Logo => &mut self.logo,
            ImageKind::Thumb => &mut self.thumb,
            ImageKind::Backdrop => &mut self.backdrop,
            ImageKind::Profile => &mut self.profile,
        }
    }

    /// Merges command-line overrides into the loaded file. Returns a
    /// warning for every override that has no effect on the selected
    /// operations.
    pub fn apply_overrides(&mut self, cli: &Cli) -> Vec<String> {
        if let Some(modes) = cli.modes() {
            self.operations = StringList::Items(
                modes.iter().map(|k| k.mode_name().to_string()).collect(),
            );
        }
        if cli.restore_all {
            self.operations = StringList::Items(
                ImageKind::ALL.iter().map(|k| k.mode_name().to_string()).collect(),
            );
        }
        if let Some(url) = &cli.jf_url {
            self.jf_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(key) = &cli.jf_api_key {
            self.jf_api_key = key.trim().to_string();
        }
        if let Some(names) = &cli.libraries {
            self.libraries.names = StringList::Joined(names.clone());
        }
        if let Some(types) = &cli.item_types {
            self.item_types = StringList::Joined(types.clone());
        }
        if let Some(delay) = cli.jf_delay_ms {
            self.jf_delay_ms = delay;
        }
        self.dry_run |= cli.dry_run;
        self.backup |= cli.backup;
        self.force_upload_noscale |= cli.force_upload_noscale;
        if cli.silent {
            self.logging.silent = true;
        }

        for kind in ImageKind::ALL {
            let section = self.section_mut(kind);
            section.no_upscale |= cli.no_upscale;
            section.no_downscale |= cli.no_downscale;
        }
        self.logo.set_size(cli.logo_target_size);
        self.thumb.set_size(cli.thumb_target_size);
        self.backdrop.set_size(cli.backdrop_target_size);
        self.profile.set_size(cli.profile_target_size);
        if let Some(q) = cli.thumb_jpeg_quality {
            self.thumb.jpeg_quality = q;
        }
        if let Some(q) = cli.backdrop_jpeg_quality {
            self.backdrop.jpeg_quality = q;
        }
        if let Some(q) = cli.profile_webp_quality {
            self.profile.webp_quality = q;
        }
        if let Some(padding) = cli.logo_padding {
            self.logo.padding = padding;
        }
        for kind in ImageKind::ALL {
            self.section_mut(kind).normalize();
        }

        let ops = self.operations().unwrap_or_default();
        let selected = |kind: ImageKind| ops.contains(&kind);
        let mut warnings: Vec<String> = Vec::new();
        if cli.no_upscale && cli.no_downscale {
            warnings.push("--no-upscale and --no-downscale together disable all scaling.".into());
        }
        let unused = [
            (cli.thumb_jpeg_quality.is_some(), "--thumb-jpeg-quality", ImageKind::Thumb),
            (cli.backdrop_jpeg_quality.is_some(), "--backdrop-jpeg-quality", ImageKind::Backdrop),
            (cli.profile_webp_quality.is_some(), "--profile-webp-quality", ImageKind::Profile),
            (cli.logo_padding.is_some(), "--logo-padding", ImageKind::Logo),
            (cli.logo_target_size.is_some(), "--logo-target-size", ImageKind::Logo),
            (cli.thumb_target_size.is_some(), "--thumb-target-size", ImageKind::Thumb),
            (cli.backdrop_target_size.is_some(), "--backdrop-target-size", ImageKind::Backdrop),
            (cli.profile_target_size.is_some(), "--profile-target-size", ImageKind::Profile),
        ];
        for (given, flag, kind) in unused {
            if given && !selected(kind) {
                warnings.push(format!(
                    "{} has no effect because '{}' mode is not selected.",
                    flag, kind
                ));
            }
        }
        let item_modes = [ImageKind::Logo, ImageKind::Thumb, ImageKind::Backdrop];
        if cli.item_types.is_some() && !item_modes.iter().any(|k| selected(*k)) {
            warnings.push(
                "--item-types has no effect without 'logo', 'thumb', or 'backdrop' modes selected."
                    .into(),
            );
        }
        warnings
    }

    /// Selected operations in configured order, deduplicated.
    pub fn operations(&self) -> Result<Vec<ImageKind>, ConfigError> {
        let mut kinds = Vec::new();
        let mut problems = Vec::new();
        for name in self.operations.items() {
            match ImageKind::from_mode_name(&name) {
                Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
                Some(_) => {}
                None => problems.push(format!(
                    "invalid mode '{}' (valid: logo, thumb, backdrop, profile)",
                    name
                )),
            }
        }
        if kinds.is_empty() && problems.is_empty() {
            problems.push(
                "specify --mode or set 'operations' in config (e.g. operations = \"logo|thumb\")"
                    .into(),
            );
        }
        if problems.is_empty() {
            Ok(kinds)
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Server item types; `movies`/`series` map to `Movie`/`Series`.
    pub fn item_types(&self) -> Result<Vec<String>, ConfigError> {
        let raw = self.item_types.items();
        if raw.is_empty() {
            return Ok(DEFAULT_ITEM_TYPES.iter().map(|s| s.to_string()).collect());
        }
        let mut types: Vec<String> = Vec::new();
        for part in raw {
            let mapped = match part.to_lowercase().as_str() {
                "movie" | "movies" => "Movie",
                "series" => "Series",
                _ => {
                    return Err(ConfigError::Invalid(vec![format!(
                        "item_types must contain only movies and/or series (got '{}')",
                        part
                    )]))
                }
            };
            if !types.iter().any(|t| t == mapped) {
                types.push(mapped.to_string());
            }
        }
        Ok(types)
    }

    pub fn library_names(&self) -> Vec<String> {
        self.libraries.names.items()
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self, require_operations: bool) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.jf_url.is_empty() {
            problems.push("jf_url is required".to_string());
        } else if !(self.jf_url.starts_with("http://") || self.jf_url.starts_with("https://")) {
            problems.push(format!("jf_url must start with http:// or https:// (got '{}')", self.jf_url));
        }
        if self.jf_api_key.is_empty() {
            problems.push("jf_api_key is required".to_string());
        }
        for kind in ImageKind::ALL {
            let section = self.section(kind);
            if section.width == Some(0) || section.height == Some(0) {
                problems.push(format!("[{}] width and height must be positive", kind));
            }
        }
        if require_operations {
            if let Err(ConfigError::Invalid(mut found)) = self.operations() {
                problems.append(&mut found);
            }
            if let Err(ConfigError::Invalid(mut found)) = self.item_types() {
                problems.append(&mut found);
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn rule_set(&self) -> RuleSet {
        RuleSet::new(|kind| {
            let section = self.section(kind);
            let defaults = ModeRules::defaults(kind);
            let output = match kind {
                ImageKind::Logo => OutputFormat::Png,
                ImageKind::Thumb | ImageKind::Backdrop => OutputFormat::Jpeg {
                    quality: section.jpeg_quality,
                },
                ImageKind::Profile => OutputFormat::WebP {
                    quality: section.webp_quality,
                    method: section.webp_method,
                },
            };
            ModeRules {
                width: section.width.unwrap_or(defaults.width),
                height: section.height.unwrap_or(defaults.height),
                allow_upscale: !section.no_upscale,
                allow_downscale: !section.no_downscale,
                padding: section.padding,
                padding_remove_sensitivity: section.padding_remove_sensitivity,
                output,
                ..defaults
            }
        })
    }

    /// One message per selected kind whose canvas ratio, rounded to two
    /// decimals, differs from the kind's default.
    pub fn aspect_warnings(&self, rules: &RuleSet, kinds: &[ImageKind]) -> Vec<String> {
        let ratio = |w: u32, h: u32| (w as f64 / h as f64 * 100.0).round() / 100.0;
        kinds
            .iter()
            .filter_map(|kind| {
                let rules = rules.get(*kind);
                let (rec_w, rec_h) = kind.default_canvas();
                let recommended = ratio(rec_w, rec_h);
                let actual = ratio(rules.width, rules.height);
                (actual != recommended).then(|| {
                    format!(
                        "Unusual {} aspect ratio: configured {}x{} has {:.2} (w/h); recommended {} (~{:.2}), e.g. {}x{}.",
                        kind,
                        rules.width,
                        rules.height,
                        actual,
                        kind.recommended_aspect_label(),
                        recommended,
                        rec_w,
                        rec_h
                    )
                })
            })
            .collect()
    }

    pub fn backup_mode(&self) -> BackupMode {
        BackupMode::parse(&self.backup_mode)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.backup_dir.join(".staging"))
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.jf_url.clone(),
            api_key: self.jf_api_key.clone(),
            timeout: Duration::from_secs_f64(self.timeout),
            write_delay: Duration::from_millis(self.jf_delay_ms),
            retry_count: self.api_retry_count.max(1),
            retry_backoff: Duration::from_millis(self.api_retry_backoff_ms),
        }
    }
}

/// Writes the commented starter config. Never overwrites.
pub fn generate_config(path: &Path) -> Result<(), ConfigError> {
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("toml"));
    if !is_toml {
        return Err(ConfigError::NotToml(display(path)));
    }
    if path.exists() {
        return Err(ConfigError::Exists(display(path)));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: display(path),
            source,
        })?;
    }
    fs::write(path, DEFAULT_TEMPLATE).map_err(|source| ConfigError::Write {
        path: display(path),
        source,
    })
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub const DEFAULT_TEMPLATE: &str = r#"# artnorm configuration

# Jellyfin server and API key (Dashboard > API Keys).
jf_url = "http://localhost:8096"
jf_api_key = ""

# Any of logo, thumb, backdrop, profile. Overridden by --mode.
operations = ["logo", "thumb", "backdrop"]

# movies and/or series
item_types = ["movies", "series"]

# HTTP timeout in seconds, pause after each upload/delete, retry policy.
timeout = 15
jf_delay_ms = 0
api_retry_count = 3
api_retry_backoff_ms = 500

# Stop after the first entity that fails.
fail_fast = false

# Plan, back up and log, but never upload or delete.
dry_run = false

# Keep originals before changing them. "partial" backs up only images that
# get rescaled, "full" backs up everything that is checked.
backup = false
backup_mode = "partial"
backup_dir = "backup"
# staging_dir = "backup/.staging"

# Re-upload images that already match their canvas.
force_upload_noscale = false

[libraries]
# Empty means every movie/show library.
names = []

[operator]
# Account used for discovery. Defaults to the first active user.
# username = "admin"

[logging]
silent = false
cli_level = "info"
file_enabled = true
file_level = "info"
file_path = "artnorm.log"

[logo]
width = 800
height = 310
no_upscale = false
no_downscale = false
# add: pad to canvas, remove: trim transparent borders then fit, none: fit only
padding = "add"
padding_remove_sensitivity = 1

[thumb]
width = 1000
height = 562
no_upscale = false
no_downscale = false
jpeg_quality = 85

[backdrop]
width = 1920
height = 1080
no_upscale = false
no_downscale = false
jpeg_quality = 85

[profile]
width = 256
height = 256
no_upscale = false
no_downscale = false
webp_quality = 80
webp_method = 6
"#;
