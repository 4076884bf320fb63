use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crossmatrix_contracts::{BUILT_BY_PREFIX, RUNS_ON_PREFIX};

use crate::config::MatrixConfig;

/// `(runs-on, built-by)`: where a built executable lives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactKey {
    pub runs_on: String,
    pub built_by: String,
}

impl ArtifactKey {
    pub fn new(runs_on: impl Into<String>, built_by: impl Into<String>) -> Self {
        ArtifactKey {
            runs_on: runs_on.into(),
            built_by: built_by.into(),
        }
    }

    pub fn rel_dir(&self) -> PathBuf {
        PathBuf::from(format!("{RUNS_ON_PREFIX}{}", self.runs_on))
            .join(format!("{BUILT_BY_PREFIX}{}", self.built_by))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{RUNS_ON_PREFIX}{}/{BUILT_BY_PREFIX}{}",
            self.runs_on, self.built_by
        )
    }
}

/// Every key the provisioning stage must leave behind: one per platform per
/// target it declares it produces.
pub fn expected_keys(config: &MatrixConfig) -> Vec<ArtifactKey> {
    let mut keys = Vec::new();
    for p in &config.platforms {
        for t in &p.produces {
            keys.push(ArtifactKey::new(t, &p.tag));
        }
    }
    keys
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: PathBuf) -> Self {
        ArtifactLayout { root }
    }

    pub fn dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.rel_dir())
    }

    pub fn file(&self, key: &ArtifactKey, name: &str) -> PathBuf {
        self.dir(key).join(name)
    }

    pub fn exists(&self, key: &ArtifactKey, name: &str) -> bool {
        self.file(key, name).is_file()
    }

    /// Copies `src` into `key`'s location as `name`, replacing any previous
    /// file. The replacement is atomic: readers see the old or the new file.
    pub fn stage(&self, key: &ArtifactKey, src: &Path, name: &str) -> Result<PathBuf> {
        let dir = self.dir(key);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create artifact dir: {}", dir.display()))?;
        let dst = dir.join(name);
        let tmp = dir.join(format!(".{name}.tmp-{}", std::process::id()));
        std::fs::copy(src, &tmp)
            .with_context(|| format!("copy {} -> {}", src.display(), tmp.display()))?;
        set_executable(&tmp)?;
        std::fs::rename(&tmp, &dst)
            .with_context(|| format!("rename {} -> {}", tmp.display(), dst.display()))?;
        tracing::info!(artifact = %key, file = name, "staged artifact");
        Ok(dst)
    }
}

/// Copies `src` into `dir` as `name` with mode 0755.
pub fn stage_executable(src: &Path, dir: &Path, name: &str) -> Result<PathBuf> {
    let dst = dir.join(name);
    std::fs::copy(src, &dst)
        .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
    set_executable(&dst)?;
    Ok(dst)
}

pub fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod 755 {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
