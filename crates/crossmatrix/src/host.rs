use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Toolchain-style platform tag (`darwin-arm64`, `linux-amd64`, ...) for an
/// `(os, arch)` pair as spelled by `std::env::consts`.
pub fn platform_tag(os: &str, arch: &str) -> String {
    let os = match os {
        "macos" => "darwin",
        other => other,
    };
    let arch = match arch {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        "x86" => "386",
        other => other,
    };
    format!("{os}-{arch}")
}

pub fn detect_host_tag() -> String {
    platform_tag(std::env::consts::OS, std::env::consts::ARCH)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedHost {
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for UnsupportedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ERROR: currently only works on {} (this host is {})",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for UnsupportedHost {}

pub fn check_host(expected: &str, actual: &str) -> Result<(), UnsupportedHost> {
    if expected == actual {
        Ok(())
    } else {
        Err(UnsupportedHost {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Host-side locations substituted into invocation templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub cwd: PathBuf,
    pub home: PathBuf,
    pub sdk_dir: PathBuf,
}

impl HostPaths {
    /// `sdk_dir` defaults to `$HOME/sdk/setup`.
    pub fn from_env(sdk_dir: Option<&Path>) -> Result<Self> {
        let cwd = std::env::current_dir().context("current_dir")?;
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .context("HOME is not set")?;
        let sdk_dir = match sdk_dir {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => cwd.join(p),
            None => home.join("sdk").join("setup"),
        };
        Ok(HostPaths { cwd, home, sdk_dir })
    }
}
