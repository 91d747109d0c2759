#![forbid(unsafe_code)]

//! Transient download artifacts: locating them after a fetch, streaming them
//! to the browser, and making sure they are deleted afterwards.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use axum::{
    body::Body,
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use mime_guess::MimeGuess;
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::extractor::is_partial_artifact;
use crate::security::{escapes_root, secure_filename};

pub const DEFAULT_DISPLAY_TITLE: &str = "video";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid filename")]
    InvalidName,
    #[error("access denied")]
    AccessDenied,
    #[error("file not found")]
    NotFound,
    #[error("artifact I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid response header: {0}")]
    Header(#[from] axum::http::header::InvalidHeaderValue),
}

/// Serves completed artifacts out of a single download directory.
#[derive(Debug, Clone)]
pub struct ArtifactServer {
    root: PathBuf,
}

impl ArtifactServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a client supplied file reference to a file inside the root.
    ///
    /// Names that sanitize to nothing are rejected as invalid, references
    /// that would climb out of the root (lexically or through a symlink) are
    /// denied, and anything else that is not a regular file is missing.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ArtifactError> {
        let safe_name = secure_filename(raw);
        if safe_name.is_empty() {
            warn!(requested = raw, "rejecting artifact request with invalid filename");
            return Err(ArtifactError::InvalidName);
        }
        if escapes_root(raw) {
            warn!(requested = raw, "path traversal attempt on artifact endpoint");
            return Err(ArtifactError::AccessDenied);
        }

        let candidate = self.root.join(&safe_name);
        let Ok(real_path) = candidate.canonicalize() else {
            return Err(ArtifactError::NotFound);
        };
        let real_root = self.root.canonicalize()?;
        if !real_path.starts_with(&real_root) {
            warn!(
                requested = raw,
                resolved = %real_path.display(),
                "artifact resolves outside the download directory"
            );
            return Err(ArtifactError::AccessDenied);
        }
        if !real_path.is_file() {
            return Err(ArtifactError::NotFound);
        }
        Ok(candidate)
    }

    /// Streams the artifact as an attachment. The file is removed once the
    /// response body is finished or dropped, whichever happens first.
    pub async fn serve(&self, raw: &str, title: Option<&str>) -> Result<Response, ArtifactError> {
        let path = self.resolve(raw)?;
        let file = File::open(&path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => ArtifactError::NotFound,
            _ => ArtifactError::Io(err),
        })?;
        let guard = CleanupGuard::new(path.clone());
        let size = file.metadata().await?.len();

        let stream = ReaderStream::new(file).map(move |chunk| {
            let _ = &guard;
            chunk
        });
        let response = attachment_response(Body::from_stream(stream), &path, size, title)?;
        info!(artifact = %path.display(), bytes = size, "streaming artifact");
        Ok(response)
    }

    /// Answers a `HEAD` request: same headers as [`ArtifactServer::serve`],
    /// no body, and the file stays in place.
    pub async fn describe(&self, raw: &str, title: Option<&str>) -> Result<Response, ArtifactError> {
        let path = self.resolve(raw)?;
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => ArtifactError::NotFound,
                _ => ArtifactError::Io(err),
            })?
            .len();
        debug!(artifact = %path.display(), "describing artifact without serving it");
        attachment_response(Body::empty(), &path, size, title)
    }
}

fn attachment_response(
    body: Body,
    path: &Path,
    size: u64,
    title: Option<&str>,
) -> Result<Response, ArtifactError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    let disposition = content_disposition(title.unwrap_or(DEFAULT_DISPLAY_TITLE), &extension);
    let mime = MimeGuess::from_path(path).first_or_octet_stream();

    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(mime.as_ref())?);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_str(&disposition)?);
    Ok(response)
}

/// Deletes its file exactly once, when dropped.
struct CleanupGuard {
    path: Option<PathBuf>,
}

impl CleanupGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(artifact = %path.display(), "removed served artifact"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(artifact = %path.display(), "served artifact already removed")
            }
            Err(err) => warn!(artifact = %path.display(), "failed to remove served artifact: {err}"),
        }
    }
}

/// `attachment; filename="<ascii>"; filename*=UTF-8''<percent-encoded>`.
pub fn content_disposition(title: &str, extension: &str) -> String {
    let ascii = attachment_filename(title, extension);
    let display = display_title(title);
    format!(
        "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(&format!("{display}{extension}"))
    )
}

/// Sanitized ASCII download name for the given title and real extension.
pub fn attachment_filename(title: &str, extension: &str) -> String {
    let stem = secure_filename(title);
    let stem = if stem.is_empty() {
        DEFAULT_DISPLAY_TITLE.to_string()
    } else {
        stem
    };
    secure_filename(&format!("{stem}{extension}"))
}

fn display_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        DEFAULT_DISPLAY_TITLE.to_string()
    } else {
        collapsed
    }
}

/// Relative URL a client uses to fetch a completed artifact.
pub fn download_reference(artifact_name: &str, title: &str) -> String {
    format!(
        "/download/{}?title={}",
        urlencoding::encode(artifact_name),
        urlencoding::encode(title)
    )
}

/// The produced file's extension is only known after the extractor ran, so
/// look for the single finished `<stem>.*` entry in `dir`.
pub fn find_artifact(dir: &Path, stem: &str) -> io::Result<Option<String>> {
    let prefix = format!("{stem}.");
    let mut matches: Vec<String> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() || is_partial_artifact(entry.path()) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(&prefix)
        {
            matches.push(name.to_string());
        }
    }
    matches.sort();
    if matches.len() > 1 {
        warn!(stem, candidates = ?matches, "several artifacts share a stem; using the first");
    }
    Ok(matches.into_iter().next())
}

/// Removes every file belonging to `stem`, including partial downloads.
pub fn remove_stem_files(dir: &Path, stem: &str) -> usize {
    let prefix = format!("{stem}.");
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
        let is_match = entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix));
        if !is_match {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) => warn!(file = %entry.path().display(), "failed to remove leftover download file: {err}"),
        }
    }
    removed
}

/// Deletes files older than `max_age` unless their stem belongs to a job that
/// is still running. Returns how many files were removed.
pub fn purge_stale_artifacts(dir: &Path, max_age: Duration, keep: &HashSet<String>) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let stem = entry
            .file_name()
            .to_str()
            .and_then(|name| name.split('.').next())
            .unwrap_or_default();
        if keep.contains(stem) {
            continue;
        }
        let age = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| modified.elapsed().ok());
        if !matches!(age, Some(age) if age >= max_age) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                removed += 1;
                debug!(file = %entry.path().display(), "purged stale artifact");
            }
            Err(err) => warn!(file = %entry.path().display(), "failed to purge stale artifact: {err}"),
        }
    }
    removed
}
