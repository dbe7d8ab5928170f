use serde::Deserialize;
use std::fmt;

/// Image categories handled by the normalizer. Each variant carries its own
/// canvas, fit and output rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageKind {
    Logo,
    Thumb,
    Backdrop,
    Profile,
}

impl ImageKind {
    pub const ALL: [ImageKind; 4] = [
        ImageKind::Logo,
        ImageKind::Thumb,
        ImageKind::Backdrop,
        ImageKind::Profile,
    ];

    /// Name used in config sections and on the command line.
    pub fn mode_name(self) -> &'static str {
        match self {
            ImageKind::Logo => "logo",
            ImageKind::Thumb => "thumb",
            ImageKind::Backdrop => "backdrop",
            ImageKind::Profile => "profile",
        }
    }

    pub fn from_mode_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "logo" => Some(ImageKind::Logo),
            "thumb" => Some(ImageKind::Thumb),
            "backdrop" => Some(ImageKind::Backdrop),
            "profile" => Some(ImageKind::Profile),
            _ => None,
        }
    }

    /// Image type name used by the server API.
    pub fn api_name(self) -> &'static str {
        match self {
            ImageKind::Logo => "Logo",
            ImageKind::Thumb => "Thumb",
            ImageKind::Backdrop => "Backdrop",
            ImageKind::Profile => "Primary",
        }
    }

    /// Ordered kinds own a list of images addressed by a zero-based index.
    pub fn is_ordered(self) -> bool {
        matches!(self, ImageKind::Backdrop)
    }

    pub fn backup_stem(self) -> &'static str {
        match self {
            ImageKind::Logo => "logo",
            ImageKind::Thumb => "landscape",
            ImageKind::Backdrop => "backdrop",
            ImageKind::Profile => "profile",
        }
    }

    pub fn fit(self) -> FitStrategy {
        match self {
            ImageKind::Logo => FitStrategy::Fit,
            _ => FitStrategy::Cover,
        }
    }

    pub fn default_canvas(self) -> (u32, u32) {
        match self {
            ImageKind::Logo => (800, 310),
            ImageKind::Thumb => (1000, 562),
            ImageKind::Backdrop => (1920, 1080),
            ImageKind::Profile => (256, 256),
        }
    }

    pub fn recommended_aspect_label(self) -> &'static str {
        match self {
            ImageKind::Logo => "~2.58:1 wide logo",
            ImageKind::Thumb | ImageKind::Backdrop => "16:9",
            ImageKind::Profile => "1:1",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStrategy {
    /// Letterbox inside the canvas, preserving aspect ratio.
    Fit,
    /// Fill the canvas and crop the overflow.
    Cover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Center the resized logo on a transparent canvas.
    #[default]
    Add,
    /// Crop transparent borders before scaling and never pad.
    Remove,
    /// Scale only.
    None,
}

impl Padding {
    pub fn as_str(self) -> &'static str {
        match self {
            Padding::Add => "add",
            Padding::Remove => "remove",
            Padding::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg { quality: u8 },
    WebP { quality: u8, method: u8 },
}

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg { .. } => "image/jpeg",
            OutputFormat::WebP { .. } => "image/webp",
        }
    }
}

/// Per-kind normalization rules. Built once from configuration and borrowed
/// read-only for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeRules {
    pub kind: ImageKind,
    pub width: u32,
    pub height: u32,
    pub allow_upscale: bool,
    pub allow_downscale: bool,
    pub padding: Padding,
    /// Alpha values at or below this are treated as empty border when
    /// removing logo padding.
    pub padding_remove_sensitivity: u8,
    pub output: OutputFormat,
}

impl ModeRules {
    pub fn fit(&self) -> FitStrategy {
        self.kind.fit()
    }

    /// Rules with the kind's default canvas and output settings.
    pub fn defaults(kind: ImageKind) -> Self {
        let (width, height) = kind.default_canvas();
        let output = match kind {
            ImageKind::Logo => OutputFormat::Png,
            ImageKind::Thumb | ImageKind::Backdrop => OutputFormat::Jpeg { quality: 85 },
            ImageKind::Profile => OutputFormat::WebP {
                quality: 80,
                method: 6,
            },
        };
        Self {
            kind,
            width,
            height,
            allow_upscale: true,
            allow_downscale: true,
            padding: Padding::Add,
            padding_remove_sensitivity: 1,
            output,
        }
    }
}

/// Rules for every kind, fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    logo: ModeRules,
    thumb: ModeRules,
    backdrop: ModeRules,
    profile: ModeRules,
}

impl RuleSet {
    pub fn new(mut build: impl FnMut(ImageKind) -> ModeRules) -> Self {
        Self {
            logo: build(ImageKind::Logo),
            thumb: build(ImageKind::Thumb),
            backdrop: build(ImageKind::Backdrop),
            profile: build(ImageKind::Profile),
        }
    }

    pub fn get(&self, kind: ImageKind) -> &ModeRules {
        match kind {
            ImageKind::Logo => &self.logo,
            ImageKind::Thumb => &self.thumb,
            ImageKind::Backdrop => &self.backdrop,
            ImageKind::Profile => &self.profile,
        }
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new(ModeRules::defaults)
    }
}
