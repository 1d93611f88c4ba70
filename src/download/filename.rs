//! Filename derivation, sanitization, and path resolution for downloads.
//!
//! [`derive_filename`] applies a fixed chain and stops at the first step that
//! yields a name:
//!
//! 1. The resolved URL's last path segment, when it carries the multi-field
//!    `Title -- Author -- Publisher -- Identifier -- Source` layout. Title and
//!    author are kept, illegal characters stripped, the base capped at 200
//!    characters, and the detected extension (or the catalog format) appended.
//! 2. A `Content-Disposition` filename.
//! 3. `{hash}.{ext}` when the URL's trailing extension is short and plausible.
//! 4. `{hash}.{format}` (or `{hash}.bin`).

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::constants::MAX_FILENAME_BASE_CHARS;

/// Separator between metadata fields in mirror path segments.
#[allow(clippy::expect_used)]
static FIELD_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+-{2,}\s+").expect("field separator regex is valid") // Static pattern, safe to panic
});

/// Longest extension accepted from a URL tail.
const MAX_URL_EXTENSION_CHARS: usize = 5;

/// Derives the on-disk filename for a payload.
#[must_use]
pub fn derive_filename(
    url: &str,
    content_disposition: Option<&str>,
    hash: &str,
    format: Option<&str>,
) -> String {
    let parsed = Url::parse(url).ok();
    let segment = parsed.as_ref().and_then(last_segment);
    let (stem, url_extension) = segment
        .as_deref()
        .map_or(("", None), split_extension);
    let format = format
        .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|f| is_plausible_extension(f));

    if let Some(base) = structured_base(stem) {
        let extension = url_extension.clone().or_else(|| format.clone());
        return with_extension(&base, extension.as_deref());
    }

    if let Some(name) = content_disposition
        .and_then(parse_content_disposition)
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.trim_matches('_').is_empty())
    {
        return cap_base_length(&name);
    }

    if let Some(extension) = url_extension {
        return format!("{hash}.{extension}");
    }

    format!("{hash}.{}", format.as_deref().unwrap_or("bin"))
}

fn last_segment(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    Some(decoded)
}

/// Splits `stem.ext` when `ext` is a short alphanumeric extension.
fn split_extension(segment: &str) -> (&str, Option<String>) {
    match segment.rfind('.') {
        Some(pos) if is_plausible_extension(&segment[pos + 1..]) => {
            (&segment[..pos], Some(segment[pos + 1..].to_ascii_lowercase()))
        }
        _ => (segment, None),
    }
}

fn is_plausible_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.len() <= MAX_URL_EXTENSION_CHARS
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Title and author from a multi-field segment, or `None` if the separator is
/// absent.
fn structured_base(stem: &str) -> Option<String> {
    let fields: Vec<&str> = FIELD_SEPARATOR.split(stem).collect();
    if fields.len() < 2 {
        return None;
    }

    let kept: Vec<String> = fields
        .iter()
        .take(2)
        .map(|field| strip_illegal_chars(field))
        .filter(|field| !field.is_empty())
        .collect();
    if kept.is_empty() {
        return None;
    }

    let base = truncate_chars(&kept.join(" - "), MAX_FILENAME_BASE_CHARS);
    let base = base.trim().to_string();
    (!base.is_empty()).then_some(base)
}

fn with_extension(base: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("{base}.{ext}"),
        None => base.to_string(),
    }
}

/// Caps the part before the extension at the filename base limit.
fn cap_base_length(name: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    format!("{}{ext}", truncate_chars(stem, MAX_FILENAME_BASE_CHARS))
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Removes characters that are invalid on common filesystems and collapses
/// runs of whitespace.
fn strip_illegal_chars(value: &str) -> String {
    let stripped: String = value
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles both:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename*=UTF-8''example%20file.pdf`
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        // Format: charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();

        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |`) and rewrites dot-only names.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Resolves a unique file path in `dir`, adding a numeric suffix if taken.
pub(crate) fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.trim_matches('_').is_empty() {
            "download.bin".to_string()
        } else {
            sanitized
        }
    };
    let base_path = dir.join(&filename);

    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) => (&filename[..pos], &filename[pos..]),
        None => (filename.as_str(), ""),
    };

    for i in 1..1000 {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }

    dir.join(format!("{stem}_{}{ext}", chrono::Utc::now().timestamp_millis()))
}
