//! Ephemeral per-call directories.
//!
//! A [`Workspace`] is created fresh for every `compile` or `execute`
//! call and is torn down on every exit path, including panics unwound
//! through `Drop`. Readable only by the sandbox call that created it.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// A uniquely-named directory under the configured root, removed when
/// dropped.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Creates a new workspace directory under `root`, with a random
    /// unique name.
    pub fn create(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let name = format!("ws-{}", Uuid::new_v4());
        let path = root.as_ref().join(name);
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full path to the emitted source file for `filename`.
    pub fn source_path(&self, filename: &str) -> PathBuf {
        self.path.join(filename)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
            }
        }
    }
}
