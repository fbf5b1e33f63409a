//! Read access to a project snapshot.
//!
//! Cloning and credentials belong to the caller; this module only reads a
//! directory that already holds the checkout.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::debug;

/// A file located inside a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFile {
    path: String,
    full_path: PathBuf,
}

impl ProjectFile {
    /// Path relative to the project root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn get_content(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.full_path)
            .await
            .with_context(|| format!("read {}", self.full_path.display()))
    }
}

#[async_trait]
pub trait Project: Send + Sync {
    /// Directory holding the checkout; build and deploy commands run here.
    fn base_dir(&self) -> &Path;

    /// Look up a file by project-relative path. `Ok(None)` when absent.
    async fn find_file(&self, path: &str) -> Result<Option<ProjectFile>>;
}

/// Project backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalProject {
    base_dir: PathBuf,
}

impl LocalProject {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl Project for LocalProject {
    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn find_file(&self, path: &str) -> Result<Option<ProjectFile>> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(anyhow!("project path must be relative and stay inside the project: {path}"));
        }
        let full_path = self.base_dir.join(relative);
        let is_file = tokio::fs::metadata(&full_path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        debug!(path, found = is_file, "find_file");
        if !is_file {
            return Ok(None);
        }
        Ok(Some(ProjectFile {
            path: path.to_string(),
            full_path,
        }))
    }
}
