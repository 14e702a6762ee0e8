// SPDX-License-Identifier: MIT OR Apache-2.0
//! Asset capture and restoration.
//!
//! Files upload verbatim; directories are archived (`tar.gz`) with an
//! optional glob filter. Every source and destination path must resolve
//! inside the execution's working directory.

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::json;
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use weft_core::{Metadata, TargetError};

use crate::frame::AssetKind;

// ---------------------------------------------------------------------------
// Path containment
// ---------------------------------------------------------------------------

/// Resolve `candidate` against `base` and reject anything that escapes it.
///
/// The check is lexical (`..` and `.` are folded without touching the
/// filesystem) so it also covers paths that do not exist yet.
pub fn resolve_within(base: &Path, candidate: &Path) -> Result<PathBuf, TargetError> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(outside(candidate, base));
                }
            }
            other => resolved.push(other),
        }
    }
    if !resolved.starts_with(base) {
        return Err(outside(candidate, base));
    }
    Ok(resolved)
}

fn outside(candidate: &Path, base: &Path) -> TargetError {
    TargetError::failure(
        "invalid_path",
        format!(
            "path ({}) is not inside the working directory ({})",
            candidate.display(),
            base.display()
        ),
    )
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// A filesystem entry prepared for upload.
#[derive(Debug)]
pub struct Capture {
    /// File or directory.
    pub kind: AssetKind,
    /// Path relative to the working directory, as recorded on the server.
    pub relative_path: String,
    /// The file to upload: the captured file itself, or the built archive.
    pub upload_path: PathBuf,
    /// Size of the file at `upload_path`.
    pub size: u64,
    /// Capture metadata.
    pub metadata: Metadata,
    // Keeps a directory archive alive until the upload finishes.
    _archive: Option<NamedTempFile>,
}

/// Capture `path` (default: the working directory itself) for persistence.
pub fn capture(
    working_dir: &Path,
    path: Option<&Path>,
    match_glob: Option<&str>,
) -> Result<Capture, TargetError> {
    let resolved = resolve_within(working_dir, path.unwrap_or_else(|| Path::new(".")))?;
    let relative_path = resolved
        .strip_prefix(working_dir)
        .map_err(|_| outside(&resolved, working_dir))?
        .to_string_lossy()
        .into_owned();

    if resolved.is_file() {
        let size = resolved
            .metadata()
            .map_err(|err| capture_failure(&resolved, err))?
            .len();
        let mut metadata = Metadata::new();
        metadata.insert("size".into(), json!(size));
        Ok(Capture {
            kind: AssetKind::File,
            relative_path,
            upload_path: resolved,
            size,
            metadata,
            _archive: None,
        })
    } else if resolved.is_dir() {
        let matcher = match match_glob {
            Some(pattern) => Some(build_matcher(pattern)?),
            None => None,
        };
        let archive = NamedTempFile::new().map_err(|err| capture_failure(&resolved, err))?;
        let (count, total_size) = archive_directory(&resolved, matcher.as_ref(), archive.path())
            .map_err(|err| capture_failure(&resolved, err))?;
        let size = archive
            .path()
            .metadata()
            .map_err(|err| capture_failure(&resolved, err))?
            .len();
        let mut metadata = Metadata::new();
        metadata.insert("count".into(), json!(count));
        metadata.insert("total_size".into(), json!(total_size));
        Ok(Capture {
            kind: AssetKind::Directory,
            relative_path,
            upload_path: archive.path().to_path_buf(),
            size,
            metadata,
            _archive: Some(archive),
        })
    } else {
        Err(TargetError::failure(
            "invalid_path",
            format!("path ({}) doesn't exist", resolved.display()),
        ))
    }
}

fn build_matcher(pattern: &str) -> Result<GlobSet, TargetError> {
    let glob = Glob::new(pattern)
        .map_err(|err| TargetError::failure("invalid_pattern", err.to_string()))?;
    GlobSetBuilder::new()
        .add(glob)
        .build()
        .map_err(|err| TargetError::failure("invalid_pattern", err.to_string()))
}

fn capture_failure(path: &Path, err: impl std::fmt::Display) -> TargetError {
    TargetError::failure(
        "asset_capture",
        format!("failed to capture {}: {err}", path.display()),
    )
}

fn archive_directory(
    dir: &Path,
    matcher: Option<&GlobSet>,
    out: &Path,
) -> std::io::Result<(u64, u64)> {
    let encoder = GzEncoder::new(File::create(out)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut count = 0u64;
    let mut total_size = 0u64;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .expect("walkdir stays under its root");
        if let Some(matcher) = matcher {
            if !matcher.is_match(relative) {
                continue;
            }
        }
        builder.append_path_with_name(entry.path(), relative)?;
        count += 1;
        total_size += entry.metadata().map_err(std::io::Error::other)?.len();
    }
    builder.into_inner()?.finish()?;
    Ok((count, total_size))
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// Unpack a downloaded directory archive into `dest`.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), TargetError> {
    let failure = |err: std::io::Error| {
        TargetError::failure(
            "asset_restore",
            format!("failed to unpack into {}: {err}", dest.display()),
        )
    };
    std::fs::create_dir_all(dest).map_err(failure)?;
    let decoder = GzDecoder::new(File::open(archive).map_err(failure)?);
    tar::Archive::new(decoder).unpack(dest).map_err(failure)
}
