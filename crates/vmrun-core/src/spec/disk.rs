use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// How aggressively the engine flushes writes to the backing disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    None,
    Fsync,
    #[default]
    Full,
}

impl SyncMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "fsync" => Some(Self::Fsync),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fsync => "fsync",
            Self::Full => "full",
        }
    }
}

/// Host-side page cache policy requested for the attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachingMode {
    #[default]
    Automatic,
    Cached,
    Uncached,
    Unspecified,
}

impl CachingMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(Self::Automatic),
            "cached" => Some(Self::Cached),
            "uncached" => Some(Self::Uncached),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Cached => "cached",
            Self::Uncached => "uncached",
            Self::Unspecified => "unspecified",
        }
    }
}

/// The classified location of a disk attachment, before read-only/sync/caching
/// options are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskLocation {
    Image(PathBuf),
    BlockDevice(PathBuf),
    NetworkBlockDevice(String),
    RemoteImageRef(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachmentPlan {
    pub location: DiskLocation,
    pub read_only: bool,
    pub sync_mode: SyncMode,
    pub caching_mode: CachingMode,
}

const NBD_SCHEMES: &[&str] = &["nbd://", "nbds://", "nbd+unix://", "nbds+unix://"];

fn is_option_token_shape(token: &str) -> bool {
    token == "ro" || token.starts_with("sync=") || token.starts_with("caching=")
}

/// Splits `<location>[:<opt>[,<opt>]*]` into its location and raw option
/// tokens. Colons inside the location (URLs, registry refs) are preserved
/// unless the final colon-separated segment is entirely made of recognized
/// option tokens.
fn split_location_and_options(spec: &str) -> (String, Vec<String>) {
    let segments: Vec<&str> = spec.split(':').collect();
    if segments.len() < 2 {
        return (spec.to_string(), vec![]);
    }

    let last = segments[segments.len() - 1];
    let tokens: Vec<&str> = last.split(',').collect();
    if !tokens.is_empty() && tokens.iter().all(|t| is_option_token_shape(t)) {
        let location = segments[..segments.len() - 1].join(":");
        (location, tokens.into_iter().map(str::to_string).collect())
    } else {
        (spec.to_string(), vec![])
    }
}

fn looks_like_remote_image_ref(location: &str) -> bool {
    let Some((first_segment, rest)) = location.split_once('/') else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    if location.starts_with('.') || location.starts_with('/') {
        return false;
    }
    first_segment.contains('.') || first_segment.contains(':')
}

fn is_special_file(path: &Path) -> bool {
    use nix::sys::stat::{SFlag, stat};
    match stat(path) {
        Ok(st) => {
            let mode = SFlag::from_bits_truncate(st.st_mode);
            mode.contains(SFlag::S_IFBLK) || mode.contains(SFlag::S_IFCHR)
        }
        Err(_) => false,
    }
}

fn check_arch_mismatch(location: &str) -> Result<()> {
    let filename = Path::new(location)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(location);
    if filename.ends_with("-amd64.iso") {
        return Err(Error::ArchMismatch(location.to_string()));
    }
    Ok(())
}

fn classify_location(location: &str) -> DiskLocation {
    if let Some(scheme) = NBD_SCHEMES.iter().find(|s| location.starts_with(**s)) {
        let _ = scheme;
        return DiskLocation::NetworkBlockDevice(location.to_string());
    }

    let path = PathBuf::from(location);
    if is_special_file(&path) {
        return DiskLocation::BlockDevice(path);
    }

    if looks_like_remote_image_ref(location) {
        return DiskLocation::RemoteImageRef(location.to_string());
    }

    DiskLocation::Image(path)
}

/// Parses a single `--disk` argument into an attachment plan.
pub fn parse_disk_spec(spec: &str) -> Result<DiskAttachmentPlan> {
    let (location, option_tokens) = split_location_and_options(spec);

    check_arch_mismatch(&location)?;

    let mut read_only = false;
    let mut sync_mode = None;
    let mut caching_mode = None;

    for token in &option_tokens {
        if token == "ro" {
            read_only = true;
        } else if let Some(value) = token.strip_prefix("sync=") {
            sync_mode = Some(SyncMode::parse(value).ok_or_else(|| Error::InvalidSpec {
                spec: spec.to_string(),
                reason: format!("unknown sync mode '{value}'"),
            })?);
        } else if let Some(value) = token.strip_prefix("caching=") {
            caching_mode = Some(CachingMode::parse(value).ok_or_else(|| Error::InvalidSpec {
                spec: spec.to_string(),
                reason: format!("unknown caching mode '{value}'"),
            })?);
        } else {
            return Err(Error::InvalidSpec {
                spec: spec.to_string(),
                reason: format!("unrecognized option '{token}'"),
            });
        }
    }

    Ok(DiskAttachmentPlan {
        location: classify_location(&location),
        read_only,
        sync_mode: sync_mode.unwrap_or_default(),
        caching_mode: caching_mode.unwrap_or_default(),
    })
}
