use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use swarming_core::{atomic_write_bytes, ensure_dir_with_mode, DIR_MODE, OFFLOAD_MARKER_NAME};

/// A task results directory. Closing it seals the directory for offload.
#[derive(Debug)]
pub struct ResultsDir {
    path: PathBuf,
    sealed: bool,
}

impl ResultsDir {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_dir_with_mode(path, DIR_MODE)
            .with_context(|| format!("create results dir {}", path.display()))?;
        tracing::info!(path = %path.display(), "created results directory");
        Ok(Self {
            path: path.to_path_buf(),
            sealed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open_subdir(&self, relative: &str) -> Result<PathBuf> {
        if self.sealed {
            return Err(anyhow!(
                "results dir {} is sealed; cannot open {}",
                self.path.display(),
                relative
            ));
        }
        let rel = Path::new(relative);
        if relative.is_empty() || rel.is_absolute() {
            return Err(anyhow!("results sub-dir must be a relative path, got {:?}", relative));
        }
        let path = self.path.join(rel);
        ensure_dir_with_mode(&path, DIR_MODE)
            .with_context(|| format!("create results sub-dir {}", path.display()))?;
        Ok(path)
    }

    /// Writes the offload marker. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        let marker = self.path.join(OFFLOAD_MARKER_NAME);
        atomic_write_bytes(&marker, Utc::now().timestamp().to_string().as_bytes())
            .with_context(|| format!("seal results dir {}", self.path.display()))?;
        self.sealed = true;
        tracing::info!(path = %self.path.display(), "sealed results directory for offload");
        Ok(())
    }
}
