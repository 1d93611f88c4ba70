//! Moving and copying finished artifacts into their directories.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Linux `EXDEV`, reported when `rename` crosses filesystems.
const EXDEV: i32 = 18;

/// Whether the source survives placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMode {
    Move,
    Copy,
}

/// Errors from placing a file.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("source file not found: {path}")]
    MissingSource { path: PathBuf },

    #[error(
        "cannot create directory {path}: {source}\n  Suggestion: Check that the configured directory is writable"
    )]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("placed file {path} is missing or empty")]
    Validation { path: PathBuf },
}

/// Places `source` into `dir` keeping its file name.
///
/// # Errors
///
/// See [`place_file_with`].
pub fn place_file(
    source: &Path,
    dir: &Path,
    mode: PlacementMode,
    declared_size: Option<u64>,
) -> Result<PathBuf, PlacementError> {
    place_file_with(source, dir, mode, declared_size, |from, to| {
        std::fs::rename(from, to)
    })
}

/// Places `source` into `dir` using `rename` for the move fast path.
///
/// - A source already sitting at its target is left alone.
/// - A copy whose target already holds identical bytes is left alone.
/// - An existing file with the same name gets a timestamp suffix.
/// - A cross-device rename falls back to copy then delete.
/// - The placed file must exist and be non-empty; a declared-size mismatch is
///   only logged.
///
/// # Errors
///
/// Returns [`PlacementError`] when the source is missing, the directory cannot
/// be created, the move/copy fails, or the result is empty.
pub fn place_file_with<R>(
    source: &Path,
    dir: &Path,
    mode: PlacementMode,
    declared_size: Option<u64>,
    rename: R,
) -> Result<PathBuf, PlacementError>
where
    R: Fn(&Path, &Path) -> io::Result<()>,
{
    if !source.is_file() {
        return Err(PlacementError::MissingSource {
            path: source.to_path_buf(),
        });
    }

    std::fs::create_dir_all(dir).map_err(|e| PlacementError::CreateDir {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let file_name = source
        .file_name()
        .map_or_else(|| "download.bin".into(), |n| n.to_string_lossy().into_owned());
    let natural = dir.join(&file_name);

    if same_file(source, &natural) {
        debug!(path = %natural.display(), "already in place");
        validate(&natural, declared_size)?;
        return Ok(natural);
    }

    if mode == PlacementMode::Copy && natural.is_file() && same_contents(source, &natural) {
        debug!(path = %natural.display(), "identical copy already present");
        validate(&natural, declared_size)?;
        return Ok(natural);
    }

    let target = if natural.exists() {
        timestamped_path(dir, &file_name)
    } else {
        natural
    };

    match mode {
        PlacementMode::Copy => copy(source, &target)?,
        PlacementMode::Move => match rename(source, &target) {
            Ok(()) => {}
            Err(error) if is_cross_device(&error) => {
                debug!(
                    from = %source.display(),
                    to = %target.display(),
                    "cross-device rename, copying instead"
                );
                copy(source, &target)?;
                std::fs::remove_file(source).map_err(|e| PlacementError::Move {
                    from: source.to_path_buf(),
                    to: target.clone(),
                    source: e,
                })?;
            }
            Err(error) => {
                return Err(PlacementError::Move {
                    from: source.to_path_buf(),
                    to: target,
                    source: error,
                });
            }
        },
    }

    validate(&target, declared_size)?;
    Ok(target)
}

fn copy(from: &Path, to: &Path) -> Result<(), PlacementError> {
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|e| PlacementError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: e,
        })
}

fn is_cross_device(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::CrossesDevices || error.raw_os_error() == Some(EXDEV)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Byte-for-byte comparison; any read error counts as different.
fn same_contents(a: &Path, b: &Path) -> bool {
    let sizes = (std::fs::metadata(a), std::fs::metadata(b));
    match sizes {
        (Ok(ma), Ok(mb)) if ma.len() == mb.len() => {}
        _ => return false,
    }
    let (Ok(fa), Ok(fb)) = (File::open(a), File::open(b)) else {
        return false;
    };
    let (mut ra, mut rb) = (BufReader::new(fa), BufReader::new(fb));
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];
    loop {
        let Ok(n) = ra.read(&mut buf_a) else {
            return false;
        };
        if n == 0 {
            return true;
        }
        if rb.read_exact(&mut buf_b[..n]).is_err() || buf_a[..n] != buf_b[..n] {
            return false;
        }
    }
}

fn timestamped_path(dir: &Path, file_name: &str) -> PathBuf {
    let (stem, ext) = match file_name.rfind('.') {
        Some(pos) if pos > 0 => (&file_name[..pos], &file_name[pos..]),
        _ => (file_name, ""),
    };
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let candidate = dir.join(format!("{stem}_{stamp}{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    // Two placements within the same second.
    (1..)
        .map(|i| dir.join(format!("{stem}_{stamp}_{i}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn validate(path: &Path, declared_size: Option<u64>) -> Result<(), PlacementError> {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(PlacementError::Validation {
            path: path.to_path_buf(),
        });
    }
    if let Some(declared) = declared_size.filter(|d| *d > 0 && *d != size) {
        warn!(
            path = %path.display(),
            declared,
            actual = size,
            "placed file size differs from declared size"
        );
    }
    Ok(())
}
