use std::path::Path;

use anyhow::Result;

use crate::{
    build_image_docker_like, digest::docker_like_image_id, run_docker_like, RunOutput, RunSpec,
    VmBackend,
};

/// Seam between the harness and the container runtime.
pub trait VmDriver {
    fn backend(&self) -> VmBackend;

    /// Runs `spec` to completion; a non-zero exit is data in the returned output.
    fn run(&self, spec: &RunSpec) -> Result<RunOutput>;

    /// Builds `tag` from `dockerfile`; returns `(exit_status, timed_out)`.
    fn build_image(
        &self,
        dockerfile: &Path,
        tag: &str,
        context_dir: &Path,
        wall_ms: Option<u64>,
    ) -> Result<(i32, bool)>;

    fn image_id(&self, image: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy)]
pub struct DefaultVmDriver {
    backend: VmBackend,
}

impl DefaultVmDriver {
    pub fn new(backend: VmBackend) -> Self {
        Self { backend }
    }
}

impl Default for DefaultVmDriver {
    fn default() -> Self {
        Self {
            backend: VmBackend::Podman,
        }
    }
}

impl VmDriver for DefaultVmDriver {
    fn backend(&self) -> VmBackend {
        self.backend
    }

    fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        tracing::debug!(
            backend = %self.backend,
            image = %spec.image,
            argv = ?spec.argv,
            "container run"
        );
        run_docker_like(self.backend, spec)
    }

    fn build_image(
        &self,
        dockerfile: &Path,
        tag: &str,
        context_dir: &Path,
        wall_ms: Option<u64>,
    ) -> Result<(i32, bool)> {
        tracing::debug!(
            backend = %self.backend,
            tag,
            dockerfile = %dockerfile.display(),
            "image build"
        );
        build_image_docker_like(self.backend, dockerfile, tag, context_dir, wall_ms)
    }

    fn image_id(&self, image: &str) -> Result<String> {
        docker_like_image_id(self.backend, image)
    }
}
