//! Provisioning tier: environment images, then per-platform artifact builds.
//!
//! Every failure here is fatal for the run and carries the underlying tool's
//! exit status as a [`ToolFailure`].

use std::fmt;
use std::process::Command;

use anyhow::{Context, Result};
use crossmatrix_contracts::{ARTIFACT_MANIFEST_SCHEMA_VERSION, GUEST_SDK_DIR, GUEST_SHARED_DIR};
use crossmatrix_vm::{
    preflight_vm_backend, run_command_inherit, sha256_file_hex, RunOutput, VmBackend, VmDriver,
};
use serde::{Deserialize, Serialize};

use crate::artifact::{set_executable, ArtifactKey};
use crate::config::{MatrixConfig, Platform};
use crate::host::HostPaths;
use crate::template::{self, InvocationVars, ProvisionVars};
use crate::workdir::WorkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub what: String,
    pub exit_status: i32,
    pub timed_out: bool,
}

impl ToolFailure {
    /// Process exit code for this failure (never 0).
    pub fn exit_code(&self) -> u8 {
        crate::report::exit_code_u8(self.exit_status).max(1)
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            write!(f, "{} timed out", self.what)
        } else {
            write!(f, "{} failed with exit status {}", self.what, self.exit_status)
        }
    }
}

impl std::error::Error for ToolFailure {}

/// Fails with the runtime's own status when `<runtime> info` does not succeed.
pub fn preflight_runtime(backend: VmBackend) -> Result<()> {
    let out = preflight_vm_backend(backend)?;
    match runtime_failure(backend, &out) {
        Some(failure) => Err(failure.into()),
        None => Ok(()),
    }
}

fn runtime_failure(backend: VmBackend, out: &RunOutput) -> Option<ToolFailure> {
    if out.success() {
        return None;
    }
    let stderr = String::from_utf8_lossy(&out.stderr);
    tracing::error!(%backend, stderr = %stderr.trim(), "container runtime preflight failed");
    Some(ToolFailure {
        what: format!("{backend} info"),
        exit_status: out.exit_status,
        timed_out: out.timed_out,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub runs_on: String,
    pub built_by: String,
    pub path: String,
    pub sha256: String,
}

/// Written next to the stage marker after a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub schema_version: String,
    pub backend: VmBackend,
    pub images: Vec<ImageRecord>,
    pub artifacts: Vec<ArtifactRecord>,
}

pub struct Provisioner<'a> {
    pub config: &'a MatrixConfig,
    pub work: &'a WorkDir,
    pub paths: &'a HostPaths,
    pub driver: &'a dyn VmDriver,
}

impl Provisioner<'_> {
    /// Creates the working directory, builds images and artifacts, and writes
    /// the artifact manifest.
    pub fn run(&self) -> Result<ArtifactManifest> {
        self.work.create()?;
        let images = self.build_images()?;
        let artifacts = self.build_artifacts()?;
        let manifest = ArtifactManifest {
            schema_version: ARTIFACT_MANIFEST_SCHEMA_VERSION.to_string(),
            backend: self.driver.backend(),
            images,
            artifacts,
        };
        let path = self.work.manifest();
        let mut bytes = serde_json::to_vec_pretty(&manifest)?;
        bytes.push(b'\n');
        std::fs::write(&path, &bytes)
            .with_context(|| format!("write artifact manifest: {}", path.display()))?;
        Ok(manifest)
    }

    pub fn build_images(&self) -> Result<Vec<ImageRecord>> {
        let mut out = Vec::with_capacity(self.config.images.len());
        for image in &self.config.images {
            let dockerfile = self.work.dockerfile(&image.tag);
            std::fs::write(&dockerfile, image.build_script.as_bytes())
                .with_context(|| format!("write {}", dockerfile.display()))?;

            tracing::info!(tag = %image.tag, "building environment image");
            let (exit_status, timed_out) = self.driver.build_image(
                &dockerfile,
                &image.tag,
                self.work.root(),
                self.config.timeouts.provision_ms,
            )?;
            if exit_status != 0 || timed_out {
                return Err(ToolFailure {
                    what: format!("{} build of image {}", self.driver.backend(), image.tag),
                    exit_status,
                    timed_out,
                }
                .into());
            }

            let image_id = match self.driver.image_id(&image.tag) {
                Ok(id) => Some(id),
                Err(err) => {
                    tracing::warn!(tag = %image.tag, "image id lookup failed: {err:#}");
                    None
                }
            };
            out.push(ImageRecord {
                tag: image.tag.clone(),
                image_id,
            });
        }
        Ok(out)
    }

    pub fn build_artifacts(&self) -> Result<Vec<ArtifactRecord>> {
        let mut out = Vec::new();
        for platform in &self.config.platforms {
            self.build_platform(platform)?;
            out.extend(self.collect_artifacts(platform)?);
        }
        Ok(out)
    }

    fn build_platform(&self, platform: &Platform) -> Result<()> {
        let script = template::render(
            &platform.provision_script,
            &ProvisionVars {
                sdk: GUEST_SDK_DIR.to_string(),
                shared: GUEST_SHARED_DIR.to_string(),
                toolchain_archive: platform.toolchain_archive.clone(),
                platform: platform.tag.clone(),
            },
        )?;
        let script_path = self.work.build_script(&platform.tag);
        std::fs::write(&script_path, script.as_bytes())
            .with_context(|| format!("write {}", script_path.display()))?;
        set_executable(&script_path)?;

        let line = template::render(
            &platform.invocation,
            &InvocationVars {
                runtime: self.driver.backend().bin().to_string(),
                cwd: self.paths.cwd.display().to_string(),
                home: self.paths.home.display().to_string(),
                work_dir: self.work.root().display().to_string(),
                sdk_dir: self.paths.sdk_dir.display().to_string(),
                script: WorkDir::build_script_name(&platform.tag),
            },
        )?;
        let argv = template::split_command_line(&line);
        let Some((program, args)) = argv.split_first() else {
            anyhow::bail!("platform {}: invocation renders to an empty command", platform.tag);
        };

        tracing::info!(platform = %platform.tag, command = %line, "building artifacts");
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.paths.cwd);
        let (exit_status, timed_out) =
            run_command_inherit(cmd, self.config.timeouts.provision_ms)
                .with_context(|| format!("run platform {} build: {line}", platform.tag))?;
        if exit_status != 0 || timed_out {
            return Err(ToolFailure {
                what: format!("artifact build for platform {}", platform.tag),
                exit_status,
                timed_out,
            }
            .into());
        }
        Ok(())
    }

    fn collect_artifacts(&self, platform: &Platform) -> Result<Vec<ArtifactRecord>> {
        let layout = self.work.layout();
        let mut out = Vec::with_capacity(platform.produces.len());
        for target in &platform.produces {
            let key = ArtifactKey::new(target, &platform.tag);
            let path = layout.file(&key, &self.config.tool.exe);
            if !path.is_file() {
                return Err(ToolFailure {
                    what: format!(
                        "artifact build for platform {} (missing {key}/{})",
                        platform.tag, self.config.tool.exe
                    ),
                    exit_status: 1,
                    timed_out: false,
                }
                .into());
            }
            out.push(ArtifactRecord {
                runs_on: key.runs_on.clone(),
                built_by: key.built_by.clone(),
                path: key.rel_dir().join(&self.config.tool.exe).display().to_string(),
                sha256: sha256_file_hex(&path)?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_runtime_preflight_keeps_its_status() {
        let out = RunOutput {
            exit_status: 125,
            stderr: b"Cannot connect to Podman\n".to_vec(),
            ..RunOutput::default()
        };
        let failure = runtime_failure(VmBackend::Podman, &out).unwrap();
        assert_eq!(failure.exit_code(), 125);
        assert_eq!(failure.to_string(), "podman info failed with exit status 125");

        let ok = RunOutput::default();
        assert!(runtime_failure(VmBackend::Docker, &ok).is_none());
    }
}
