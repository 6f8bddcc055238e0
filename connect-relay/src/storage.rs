use std::io;
use std::path::{Path, PathBuf};

use connect_proto::{DecodeError, FileUpload};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FileWriteError {
    #[error("invalid filename: {0}")]
    InvalidFilename(&'static str),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("creating {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("writing {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Device names Windows resolves regardless of directory or extension.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Rejects anything that is not a single plain path component.
pub fn sanitize_filename(name: &str) -> Result<&str, FileWriteError> {
    if name.is_empty() {
        return Err(FileWriteError::InvalidFilename("empty"));
    }
    if name == "." || name == ".." {
        return Err(FileWriteError::InvalidFilename("refers to a directory"));
    }
    if name.contains(['/', '\\']) {
        return Err(FileWriteError::InvalidFilename("contains a path separator"));
    }
    if name.contains('\0') {
        return Err(FileWriteError::InvalidFilename("contains a NUL byte"));
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(FileWriteError::InvalidFilename("has a drive prefix"));
    }
    if name.ends_with(['.', ' ']) {
        return Err(FileWriteError::InvalidFilename("ends with a dot or space"));
    }
    let stem = name.split('.').next().unwrap_or(name).trim_end();
    if RESERVED_STEMS.iter().any(|r| stem.eq_ignore_ascii_case(r)) {
        return Err(FileWriteError::InvalidFilename("is a reserved device name"));
    }
    Ok(name)
}

/// The fixed directory uploads are written into.
#[derive(Debug, Clone)]
pub struct DownloadDir {
    root: PathBuf,
}

impl DownloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes the upload, replacing any file of the same name, and returns
    /// the path written. The content goes to a sibling temp file first, so
    /// a failed write leaves any previous file intact.
    pub async fn store(&self, upload: &FileUpload) -> Result<PathBuf, FileWriteError> {
        let name = sanitize_filename(&upload.filename)?;
        let bytes = upload.bytes()?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| FileWriteError::CreateDir {
                path: self.root.clone(),
                source,
            })?;

        let path = self.root.join(name);
        let partial = self.root.join(format!(".{name}.{}.part", Uuid::new_v4().simple()));
        let written = match tokio::fs::write(&partial, &bytes).await {
            Ok(()) => tokio::fs::rename(&partial, &path).await,
            Err(e) => Err(e),
        };
        if let Err(source) = written {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                log::debug!("could not remove {}: {}", partial.display(), e);
            }
            return Err(FileWriteError::Write { path, source });
        }
        Ok(path)
    }
}
