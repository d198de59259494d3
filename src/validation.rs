//! Media validation and name sanitisation
//!
//! Everything client- or wire-supplied that ends up in a storage path goes
//! through here first.

use crate::config::MediaLimits;
use crate::error::{Error, Result};
use crate::types::MediaKind;

/// Longest sanitised file name kept in artifact names and session ids
const MAX_FILE_NAME_LEN: usize = 120;

/// Fallback when a file name sanitises to nothing
const FALLBACK_FILE_NAME: &str = "file";

/// Lowercased extension of `file_name`, if it has a non-empty stem and extension
///
/// ```
/// use synthgate::validation::extension_of;
///
/// assert_eq!(extension_of("Clip.MP4").as_deref(), Some("mp4"));
/// assert_eq!(extension_of(".bashrc"), None);
/// assert_eq!(extension_of("README"), None);
/// ```
pub fn extension_of(file_name: &str) -> Option<String> {
    let base = base_name(file_name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Reduce a client-supplied file name to `[A-Za-z0-9._-]`
///
/// Directory components are dropped, other characters become `_`, leading
/// dots are stripped and the result is truncated while keeping the
/// extension. Never returns an empty string.
///
/// ```
/// use synthgate::validation::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
/// assert_eq!(sanitize_file_name("my clip (1).mp4"), "my_clip__1_.mp4");
/// ```
pub fn sanitize_file_name(file_name: &str) -> String {
    let cleaned: String = base_name(file_name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        return FALLBACK_FILE_NAME.to_string();
    }
    if cleaned.len() <= MAX_FILE_NAME_LEN {
        return cleaned.to_string();
    }

    // Keep the extension so media-type inference still works
    match cleaned.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() < MAX_FILE_NAME_LEN / 2 => {
            let keep = MAX_FILE_NAME_LEN - ext.len() - 1;
            format!("{}.{}", &stem[..keep.min(stem.len())], ext)
        }
        _ => cleaned[..MAX_FILE_NAME_LEN].to_string(),
    }
}

/// Check an artifact name taken from a URL path
///
/// Artifact names are generated by the gateway, so anything outside the
/// sanitised alphabet cannot refer to a stored artifact.
pub fn validate_artifact_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "invalid artifact name {name:?}"
        )))
    }
}

/// Validate a file against the accepted media types and size limits
///
/// Unlike [`MediaKind::from_file_name`], which treats every non-video as an
/// image, this rejects extensions on neither allow-list.
pub fn check_media(file_name: &str, size: u64, limits: &MediaLimits) -> Result<MediaKind> {
    let ext = extension_of(file_name).ok_or_else(|| {
        Error::InvalidParameter(format!("file {file_name:?} has no extension"))
    })?;

    let (kind, limit) = if limits.video_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
        (MediaKind::Video, limits.max_video_bytes)
    } else if limits.image_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
        (MediaKind::Image, limits.max_image_bytes)
    } else {
        return Err(Error::InvalidParameter(format!(
            "unsupported file type .{ext}, expected one of {}",
            limits
                .image_extensions
                .iter()
                .chain(&limits.video_extensions)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )));
    };

    if size > limit {
        return Err(Error::PayloadTooLarge { size, limit });
    }
    Ok(kind)
}

/// MIME type for a file name, by extension
pub fn content_type_for(file_name: &str) -> &'static str {
    match extension_of(file_name).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

fn base_name(file_name: &str) -> &str {
    file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
}
