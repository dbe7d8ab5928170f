use crate::kind::{ImageKind, Padding};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Canvas size given as `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let (w, h) = lower
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let parse = |v: &str| -> Result<u32, String> {
            match v.trim().parse::<u32>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(format!("invalid dimension '{}' in '{}'", v, s)),
            }
        };
        Ok(Size {
            width: parse(w)?,
            height: parse(h)?,
        })
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Splits `a|b,c` style lists, dropping empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c| c == '|' || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `--mode logo|thumb`, deduplicated, in the order given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeList(pub Vec<ImageKind>);

impl FromStr for ModeList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut kinds = Vec::new();
        for name in split_list(s) {
            let kind = ImageKind::from_mode_name(&name).ok_or_else(|| {
                format!(
                    "unknown mode '{}' (expected logo, thumb, backdrop or profile)",
                    name
                )
            })?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if kinds.is_empty() {
            return Err("no mode given".into());
        }
        Ok(ModeList(kinds))
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "artnorm",
    version,
    about = "Normalize logo, thumbnail, backdrop and profile artwork on a Jellyfin server"
)]
pub struct Cli {
    /// Configuration file
    #[arg(long, value_name = "PATH", default_value = "config.toml")]
    pub config: PathBuf,

    /// Write a commented starter config to --config and exit
    #[arg(long, conflicts_with_all = [
        "test_jf", "mode", "single", "restore", "restore_all", "dry_run", "backup",
    ])]
    pub generate_config: bool,

    /// Check connectivity and credentials, then exit
    #[arg(long = "test-jf", conflicts_with_all = [
        "mode", "single", "restore", "restore_all", "dry_run", "backup",
    ])]
    pub test_jf: bool,

    /// Operations to run, e.g. "logo|thumb"
    #[arg(long, value_name = "MODES")]
    pub mode: Option<ModeList>,

    /// Process one item id (or one username with --mode profile)
    #[arg(long, value_name = "ID", requires = "mode")]
    pub single: Option<String>,

    /// Upload backed-up originals for the selected modes
    #[arg(long)]
    pub restore: bool,

    /// Upload every backed-up original
    #[arg(long, conflicts_with_all = ["mode", "single", "restore", "backup"])]
    pub restore_all: bool,

    #[arg(long)]
    pub dry_run: bool,

    /// Back up originals before changing them
    #[arg(long, conflicts_with = "restore")]
    pub backup: bool,

    #[arg(long, value_name = "WxH")]
    pub logo_target_size: Option<Size>,

    #[arg(long, value_name = "WxH")]
    pub thumb_target_size: Option<Size>,

    #[arg(long, value_name = "WxH")]
    pub backdrop_target_size: Option<Size>,

    #[arg(long, value_name = "WxH")]
    pub profile_target_size: Option<Size>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=95))]
    pub thumb_jpeg_quality: Option<u8>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=95))]
    pub backdrop_jpeg_quality: Option<u8>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub profile_webp_quality: Option<u8>,

    /// Never enlarge images
    #[arg(long)]
    pub no_upscale: bool,

    /// Never shrink images
    #[arg(long)]
    pub no_downscale: bool,

    #[arg(long, value_enum)]
    pub logo_padding: Option<Padding>,

    #[arg(long, value_name = "URL")]
    pub jf_url: Option<String>,

    #[arg(long, value_name = "KEY")]
    pub jf_api_key: Option<String>,

    /// Library names, "|" or "," separated
    #[arg(long, value_name = "NAMES")]
    pub libraries: Option<String>,

    /// Item types, e.g. "movies|series"
    #[arg(long, value_name = "TYPES")]
    pub item_types: Option<String>,

    /// Pause after each upload or delete
    #[arg(long, value_name = "MS")]
    pub jf_delay_ms: Option<u64>,

    /// Re-upload images that already match their canvas
    #[arg(long)]
    pub force_upload_noscale: bool,

    /// Only print errors to the console
    #[arg(short, long, conflicts_with = "verbose")]
    pub silent: bool,

    /// Debug output on the console
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Rules clap cannot express declaratively.
    pub fn check(&self) -> Result<(), clap::Error> {
        if let (Some(_), Some(ModeList(kinds))) = (&self.single, &self.mode) {
            if kinds.contains(&ImageKind::Profile) && kinds.len() > 1 {
                return Err(Cli::command().error(
                    ErrorKind::ArgumentConflict,
                    "--single with profile cannot be combined with other modes",
                ));
            }
        }
        Ok(())
    }

    pub fn modes(&self) -> Option<&[ImageKind]> {
        self.mode.as_ref().map(|m| m.0.as_slice())
    }

    /// `--single` in profile mode names a user, not an item.
    pub fn single_profile(&self) -> Option<&str> {
        match (&self.single, self.modes()) {
            (Some(name), Some([ImageKind::Profile])) => Some(name.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("artnorm").chain(args.iter().copied()))
    }

    #[test]
    fn size_parsing() {
        assert_eq!("800x310".parse::<Size>().unwrap(), Size { width: 800, height: 310 });
        assert_eq!(" 64X36 ".parse::<Size>().unwrap(), Size { width: 64, height: 36 });
        assert!("800".parse::<Size>().is_err());
        assert!("0x310".parse::<Size>().is_err());
        assert!("axb".parse::<Size>().is_err());
    }

    #[test]
    fn mode_list_accepts_pipes_and_commas() {
        let modes: ModeList = "logo|thumb, backdrop|logo".parse().unwrap();
        assert_eq!(
            modes.0,
            vec![ImageKind::Logo, ImageKind::Thumb, ImageKind::Backdrop]
        );
        assert!("poster".parse::<ModeList>().is_err());
        assert!(" | ".parse::<ModeList>().is_err());
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config.toml"));
        assert!(cli.mode.is_none());
        assert!(!cli.dry_run);
    }

    #[test]
    fn overrides_parse() {
        let cli = parse(&[
            "--mode",
            "logo",
            "--logo-target-size",
            "400x155",
            "--logo-padding",
            "remove",
            "--thumb-jpeg-quality",
            "90",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.logo_target_size, Some(Size { width: 400, height: 155 }));
        assert_eq!(cli.logo_padding, Some(Padding::Remove));
        assert_eq!(cli.thumb_jpeg_quality, Some(90));
        assert!(parse(&["--thumb-jpeg-quality", "96"]).is_err());
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        assert!(parse(&["--generate-config", "--dry-run"]).is_err());
        assert!(parse(&["--test-jf", "--mode", "logo"]).is_err());
        assert!(parse(&["--restore-all", "--mode", "logo"]).is_err());
        assert!(parse(&["--backup", "--restore"]).is_err());
        assert!(parse(&["--single", "abc"]).is_err());
        assert!(parse(&["-s", "-v"]).is_err());
    }

    #[test]
    fn single_profile_must_stand_alone() {
        let cli = parse(&["--single", "alice", "--mode", "profile|logo"]).unwrap();
        assert!(cli.check().is_err());

        let cli = parse(&["--single", "alice", "--mode", "profile"]).unwrap();
        assert!(cli.check().is_ok());
        assert_eq!(cli.single_profile(), Some("alice"));

        let cli = parse(&["--single", "abc123", "--mode", "logo|thumb"]).unwrap();
        assert!(cli.check().is_ok());
        assert_eq!(cli.single_profile(), None);
    }

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }
}
