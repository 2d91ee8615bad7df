//! Directory transfer plans
//!
//! `put_dir` and `get_dir` walk the whole source tree before the first byte
//! moves, so a tree that cannot be read fails before anything is written.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::ports::{TransportError, TransportSession};

/// Normalise a remote path to `/`-separated form.
///
/// Backslashes become `/`, repeated separators collapse, a trailing `/` is
/// dropped (except for the root) and the empty path becomes `.`.
#[must_use]
pub fn normalize_remote(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let absolute = replaced.starts_with('/');
    let joined = replaced
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => ".".to_string(),
        (true, false) => format!("/{joined}"),
        (false, false) => joined,
    }
}

/// Join a child name onto a normalised remote directory.
#[must_use]
pub fn join_remote(base: &str, name: &str) -> String {
    match base {
        "" | "." => normalize_remote(name),
        "/" => normalize_remote(&format!("/{name}")),
        _ => normalize_remote(&format!("{base}/{name}")),
    }
}

/// One planned action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferStep {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub is_directory: bool,
    /// File size in bytes; 0 for directories
    pub size: u64,
}

/// Ordered, immutable list of steps for one directory transfer
///
/// The first step is always the root directory. Within each directory its
/// files come first (sorted by name), then each subdirectory (sorted by name)
/// followed by its own contents.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferPlan {
    steps: Vec<TransferStep>,
}

impl TransferPlan {
    #[must_use]
    pub fn steps(&self) -> &[TransferStep] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.is_directory).count()
    }

    #[must_use]
    pub fn directory_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_directory).count()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.steps.iter().map(|s| s.size).sum()
    }

    /// Walk a local tree for upload. Blocking.
    ///
    /// Entries that are neither regular files nor directories are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first local filesystem error.
    pub fn from_local(local_root: &Path, remote_root: &str) -> Result<Self, TransportError> {
        let mut steps = Vec::new();
        let mut stack = vec![(local_root.to_path_buf(), normalize_remote(remote_root))];

        while let Some((local_dir, remote_dir)) = stack.pop() {
            let mut files = Vec::new();
            let mut dirs = Vec::new();

            let entries =
                std::fs::read_dir(&local_dir).map_err(|e| TransportError::local(&local_dir, &e))?;
            for entry in entries {
                let entry = entry.map_err(|e| TransportError::local(&local_dir, &e))?;
                let path = entry.path();
                // Follows symlinks
                let metadata =
                    std::fs::metadata(&path).map_err(|e| TransportError::local(&path, &e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if metadata.is_dir() {
                    dirs.push((name, path));
                } else if metadata.is_file() {
                    files.push((name, path, metadata.len()));
                }
            }

            steps.push(TransferStep {
                local_path: local_dir,
                remote_path: remote_dir.clone(),
                is_directory: true,
                size: 0,
            });

            files.sort_by(|a, b| a.0.cmp(&b.0));
            steps.extend(files.into_iter().map(|(name, path, size)| TransferStep {
                local_path: path,
                remote_path: join_remote(&remote_dir, &name),
                is_directory: false,
                size,
            }));

            // Reverse so the smallest name is popped first
            dirs.sort_by(|a, b| b.0.cmp(&a.0));
            stack.extend(
                dirs.into_iter()
                    .map(|(name, path)| (path, join_remote(&remote_dir, &name))),
            );
        }

        Ok(Self { steps })
    }

    /// Walk a remote tree for download, using one session for the whole walk.
    ///
    /// # Errors
    ///
    /// Returns the first transport error.
    pub fn from_remote(
        session: &mut dyn TransportSession,
        remote_root: &str,
        local_root: &Path,
    ) -> Result<Self, TransportError> {
        let mut steps = Vec::new();
        let mut stack = vec![(normalize_remote(remote_root), local_root.to_path_buf())];

        while let Some((remote_dir, local_dir)) = stack.pop() {
            let mut files = Vec::new();
            let mut dirs = Vec::new();

            for entry in session.read_dir(&remote_dir)? {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                if entry.attrs.is_dir() {
                    dirs.push(entry.name);
                } else {
                    files.push((entry.name, entry.attrs.size.unwrap_or(0)));
                }
            }

            steps.push(TransferStep {
                local_path: local_dir.clone(),
                remote_path: remote_dir.clone(),
                is_directory: true,
                size: 0,
            });

            files.sort();
            steps.extend(files.into_iter().map(|(name, size)| TransferStep {
                local_path: local_dir.join(&name),
                remote_path: join_remote(&remote_dir, &name),
                is_directory: false,
                size,
            }));

            dirs.sort_by(|a, b| b.cmp(a));
            stack.extend(
                dirs.into_iter()
                    .map(|name| (join_remote(&remote_dir, &name), local_dir.join(&name))),
            );
        }

        Ok(Self { steps })
    }
}

/// Outcome of `put_dir` / `get_dir`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    /// Directories that did not exist before the transfer
    pub directories_created: u64,
    pub duration_ms: u64,
}
