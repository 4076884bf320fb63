use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crossmatrix_contracts::{
    ARTIFACT_MANIFEST_FILE, BUILD_SCRIPT_PREFIX, DOCKERFILE_PREFIX, LOG_FILE_PREFIX, REPORT_FILE,
    SCRATCH_DIR, STAGE_MARKER_FILE,
};

use crate::artifact::ArtifactLayout;

/// The persisted working directory and the fixed names inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Anchors `root` at the current directory when relative.
    pub fn resolve(root: &Path) -> Result<Self> {
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .context("current_dir")?
                .join(root)
        };
        Ok(WorkDir { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("create work dir: {}", self.root.display()))
    }

    pub fn marker(&self) -> PathBuf {
        self.root.join(STAGE_MARKER_FILE)
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(ARTIFACT_MANIFEST_FILE)
    }

    pub fn report(&self) -> PathBuf {
        self.root.join(REPORT_FILE)
    }

    pub fn log_file(&self, seq: usize) -> PathBuf {
        self.root.join(format!("{LOG_FILE_PREFIX}{seq}"))
    }

    pub fn dockerfile(&self, image_tag: &str) -> PathBuf {
        self.root.join(format!("{DOCKERFILE_PREFIX}{image_tag}"))
    }

    pub fn build_script_name(platform: &str) -> String {
        format!("{BUILD_SCRIPT_PREFIX}{platform}.sh")
    }

    pub fn build_script(&self, platform: &str) -> PathBuf {
        self.root.join(Self::build_script_name(platform))
    }

    pub fn payload(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    /// Per-invocation scratch directory, removed and recreated empty.
    pub fn fresh_scratch(&self, seq: usize) -> Result<PathBuf> {
        let dir = self.root.join(SCRATCH_DIR).join(seq.to_string());
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("clear scratch dir: {}", dir.display()))?;
        }
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create scratch dir: {}", dir.display()))?;
        Ok(dir)
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(self.root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_names() {
        let wd = WorkDir::resolve(Path::new("/w/tmp")).unwrap();
        assert_eq!(wd.marker(), PathBuf::from("/w/tmp/stage1-ok"));
        assert_eq!(wd.log_file(4), PathBuf::from("/w/tmp/logfile-4"));
        assert_eq!(wd.dockerfile("arm64-ubuntu"), PathBuf::from("/w/tmp/dockerfile-arm64-ubuntu"));
        assert_eq!(
            wd.build_script("linux-arm64-ubuntu"),
            PathBuf::from("/w/tmp/build-linux-arm64-ubuntu.sh")
        );
    }

    #[test]
    fn relative_root_is_anchored() {
        let wd = WorkDir::resolve(Path::new("tmp")).unwrap();
        assert!(wd.root().is_absolute());
        assert!(wd.root().ends_with("tmp"));
    }

    #[test]
    fn scratch_is_recreated_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = WorkDir::resolve(tmp.path()).unwrap();
        let dir = wd.fresh_scratch(2).unwrap();
        std::fs::write(dir.join("leftover"), b"x").unwrap();
        let again = wd.fresh_scratch(2).unwrap();
        assert_eq!(dir, again);
        assert!(!again.join("leftover").exists());
    }
}
