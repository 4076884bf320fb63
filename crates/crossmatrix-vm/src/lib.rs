use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

mod digest;
mod driver;
mod exec;

pub use digest::{normalize_sha256_digest, sha256_file_hex};
pub use driver::{DefaultVmDriver, VmDriver};
pub use exec::{
    hard_kill_pid_and_group, read_to_end_capped, run_command_capped, run_command_inherit,
    wait_child_output_capped,
};

pub const ENV_VM_BACKEND: &str = "CROSSMATRIX_BACKEND";

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub guest_path: PathBuf,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitsSpec {
    /// `None` waits for the child indefinitely.
    pub wall_ms: Option<u64>,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
}

impl LimitsSpec {
    pub fn with_wall_ms(wall_ms: Option<u64>) -> Self {
        LimitsSpec {
            wall_ms,
            max_stdout_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_stderr_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl Default for LimitsSpec {
    fn default() -> Self {
        LimitsSpec::with_wall_ms(None)
    }
}

#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Container name; lets a timed-out run be killed by name.
    pub name: Option<String>,
    pub image: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub workdir: Option<PathBuf>,
    pub limits: LimitsSpec,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub exit_status: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0 && !self.timed_out
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_lossy(&self) -> String {
        let mut s = String::from_utf8_lossy(&self.stdout).into_owned();
        s.push_str(&String::from_utf8_lossy(&self.stderr));
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmBackend {
    Docker,
    Podman,
}

impl VmBackend {
    pub fn bin(self) -> &'static str {
        match self {
            VmBackend::Docker => "docker",
            VmBackend::Podman => "podman",
        }
    }
}

impl std::fmt::Display for VmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.bin())
    }
}

impl std::str::FromStr for VmBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "docker" => Ok(VmBackend::Docker),
            "podman" => Ok(VmBackend::Podman),
            other => anyhow::bail!(
                "invalid {ENV_VM_BACKEND}={other:?} (expected one of: docker, podman)"
            ),
        }
    }
}

/// Picks the runtime from `CROSSMATRIX_BACKEND`, falling back to `configured`.
pub fn resolve_vm_backend(configured: VmBackend) -> Result<VmBackend> {
    match std::env::var(ENV_VM_BACKEND) {
        Ok(raw) if !raw.trim().is_empty() => VmBackend::from_str(&raw),
        _ => Ok(configured),
    }
}

/// Runs `<bin> info`. Errors only if the runtime cannot be spawned; its
/// answer, failing or not, comes back as output.
pub fn preflight_vm_backend(backend: VmBackend) -> Result<RunOutput> {
    let mut cmd = Command::new(backend.bin());
    cmd.arg("info");
    cmd.stdin(Stdio::null());
    run_command_capped(cmd, Some(10_000), 64 * 1024, 64 * 1024)
        .with_context(|| format!("preflight {backend}"))
}

pub(crate) fn validate_mount_kv_string_safe(path: &Path, label: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt as _;
        for &bad in [b',', b'\0', b'\n', b'\r'].iter() {
            if path.as_os_str().as_bytes().contains(&bad) {
                anyhow::bail!(
                    "{label} mount path contains disallowed byte {bad:?}: {}",
                    path.display()
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        let s = path.as_os_str().to_string_lossy();
        for bad in [",", "\0", "\n", "\r"] {
            if s.contains(bad) {
                anyhow::bail!(
                    "{label} mount path contains disallowed sequence {bad:?}: {}",
                    path.display()
                );
            }
        }
    }

    Ok(())
}

/// Builds the `<runtime> run ...` command line for `spec` without spawning it.
pub fn docker_like_run_command(backend: VmBackend, spec: &RunSpec) -> Result<Command> {
    let mut cmd = Command::new(backend.bin());
    cmd.arg("run");
    cmd.arg("--rm");

    if let Some(name) = spec.name.as_ref() {
        cmd.arg("--name").arg(name);
    }

    if let Some(workdir) = spec.workdir.as_ref() {
        cmd.arg("--workdir").arg(workdir);
    }

    for (k, v) in &spec.env {
        cmd.arg("--env").arg(format!("{k}={v}"));
    }

    for m in &spec.mounts {
        validate_mount_kv_string_safe(&m.host_path, "host")?;
        validate_mount_kv_string_safe(&m.guest_path, "guest")?;

        let mut mount = format!(
            "type=bind,source={},target={}",
            m.host_path.display(),
            m.guest_path.display()
        );
        if m.readonly {
            mount.push_str(",readonly");
        }
        cmd.arg("--mount").arg(mount);
    }

    cmd.arg(&spec.image);
    for a in &spec.argv {
        cmd.arg(a);
    }
    Ok(cmd)
}

pub fn run_docker_like(backend: VmBackend, spec: &RunSpec) -> Result<RunOutput> {
    let cmd = docker_like_run_command(backend, spec)?;
    let out = run_command_capped(
        cmd,
        spec.limits.wall_ms,
        spec.limits.max_stdout_bytes,
        spec.limits.max_stderr_bytes,
    )
    .with_context(|| format!("{backend} run {}", spec.image))?;
    if out.timed_out {
        if let Some(name) = spec.name.as_deref() {
            docker_like_hard_kill(backend, name);
        }
    }
    Ok(out)
}

/// A container name unique to this process and call.
pub fn unique_container_name(prefix: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{n}", std::process::id())
}

/// `<runtime> kill --signal SIGKILL <name>` then `<runtime> rm -f <name>`.
pub fn docker_like_stop_commands(backend: VmBackend, name: &str) -> [Command; 2] {
    let mut kill = Command::new(backend.bin());
    kill.arg("kill").arg("--signal").arg("SIGKILL").arg(name);
    let mut rm = Command::new(backend.bin());
    rm.arg("rm").arg("-f").arg(name);
    [kill, rm]
}

/// Stops a container whose client was killed. Failures are logged, not
/// returned; the container may already be gone.
fn docker_like_hard_kill(backend: VmBackend, name: &str) {
    tracing::warn!(%backend, container = name, "killing timed-out container");
    for cmd in docker_like_stop_commands(backend, name) {
        match run_command_capped(cmd, Some(10_000), 64 * 1024, 64 * 1024) {
            Ok(out) if out.exit_status == 0 => {}
            Ok(out) => tracing::debug!(
                container = name,
                status = out.exit_status,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "container stop step failed"
            ),
            Err(err) => tracing::debug!(
                container = name,
                error = %format!("{err:#}"),
                "container stop step failed"
            ),
        }
    }
}

/// `<runtime> build -f <dockerfile> --tag <tag> <context>`, streaming to the parent's stdio.
pub fn build_image_docker_like(
    backend: VmBackend,
    dockerfile: &Path,
    tag: &str,
    context_dir: &Path,
    wall_ms: Option<u64>,
) -> Result<(i32, bool)> {
    let mut cmd = Command::new(backend.bin());
    cmd.arg("build")
        .arg("-f")
        .arg(dockerfile)
        .arg("--tag")
        .arg(tag)
        .arg(context_dir);
    run_command_inherit(cmd, wall_ms).with_context(|| format!("{backend} build --tag {tag}"))
}

pub fn normalize_abs_path(p: &Path) -> Result<PathBuf> {
    if !p.is_absolute() {
        anyhow::bail!("expected absolute path, got {}", p.display());
    }

    let mut out = PathBuf::new();
    out.push(Path::new("/"));
    for comp in p.components() {
        use std::path::Component;
        match comp {
            Component::RootDir => {}
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
                if out.as_os_str().is_empty() {
                    out.push(Path::new("/"));
                }
            }
            Component::Normal(c) => out.push(c),
            Component::Prefix(_) => {
                anyhow::bail!("unexpected Windows prefix in path {}", p.display());
            }
        }
    }
    Ok(out)
}

/// Rewrites `path` from under `from` to under `to`; `None` if `path` is outside `from`.
pub fn rebase_path(path: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(from).ok()?;
    if rel.as_os_str().is_empty() {
        return Some(to.to_path_buf());
    }
    Some(to.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parse_and_display() {
        assert_eq!(" Podman ".parse::<VmBackend>().unwrap(), VmBackend::Podman);
        assert_eq!("docker".parse::<VmBackend>().unwrap(), VmBackend::Docker);
        assert!("firecracker".parse::<VmBackend>().is_err());
        assert_eq!(VmBackend::Podman.to_string(), "podman");
    }

    #[test]
    fn mount_kv_string_validation_rejects_comma() {
        assert!(validate_mount_kv_string_safe(Path::new("/tmp/has,comma"), "host").is_err());
        validate_mount_kv_string_safe(Path::new("/tmp/ok"), "host").unwrap();
    }

    #[test]
    fn run_command_line_has_mounts_env_and_argv() {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/tmp2/home".to_string());
        let spec = RunSpec {
            name: Some("crossmatrix-7-0".to_string()),
            image: "arm64-ubuntu".to_string(),
            argv: vec!["/tmp2/gorun".to_string(), "/tmp2/goscript-blue".to_string()],
            env,
            mounts: vec![MountSpec {
                host_path: PathBuf::from("/work/tmp"),
                guest_path: PathBuf::from("/tmp2"),
                readonly: false,
            }],
            workdir: Some(PathBuf::from("/tmp2")),
            limits: LimitsSpec::default(),
        };
        let cmd = docker_like_run_command(VmBackend::Podman, &spec).unwrap();
        assert_eq!(cmd.get_program(), "podman");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--name",
                "crossmatrix-7-0",
                "--workdir",
                "/tmp2",
                "--env",
                "HOME=/tmp2/home",
                "--mount",
                "type=bind,source=/work/tmp,target=/tmp2",
                "arm64-ubuntu",
                "/tmp2/gorun",
                "/tmp2/goscript-blue",
            ]
        );
    }

    #[test]
    fn readonly_mount_is_flagged() {
        let spec = RunSpec {
            name: None,
            image: "img".to_string(),
            argv: Vec::new(),
            env: BTreeMap::new(),
            mounts: vec![MountSpec {
                host_path: PathBuf::from("/home/u/sdk/setup"),
                guest_path: PathBuf::from("/sdk/setup"),
                readonly: true,
            }],
            workdir: None,
            limits: LimitsSpec::default(),
        };
        let cmd = docker_like_run_command(VmBackend::Docker, &spec).unwrap();
        assert!(!cmd.get_args().any(|a| a == "--name"));
        assert!(cmd
            .get_args()
            .any(|a| a == "type=bind,source=/home/u/sdk/setup,target=/sdk/setup,readonly"));
    }

    #[test]
    fn normalize_abs_path_resolves_dots() {
        assert_eq!(
            normalize_abs_path(Path::new("/a/./b/../c")).unwrap(),
            PathBuf::from("/a/c")
        );
        assert!(normalize_abs_path(Path::new("rel/path")).is_err());
    }

    #[test]
    fn rebase_path_maps_between_roots() {
        let host = Path::new("/work/tmp");
        let guest = Path::new("/tmp2");
        assert_eq!(
            rebase_path(Path::new("/tmp2/home/x/main"), guest, host),
            Some(PathBuf::from("/work/tmp/home/x/main"))
        );
        assert_eq!(rebase_path(Path::new("/tmp2"), guest, host), Some(host.to_path_buf()));
        assert_eq!(rebase_path(Path::new("/root/.cache/main"), guest, host), None);
    }

    #[test]
    fn timed_out_container_is_killed_then_removed() {
        let [kill, rm] = docker_like_stop_commands(VmBackend::Podman, "crossmatrix-7-3");
        let args = |c: &Command| -> Vec<String> {
            c.get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(kill.get_program(), "podman");
        assert_eq!(args(&kill), vec!["kill", "--signal", "SIGKILL", "crossmatrix-7-3"]);
        assert_eq!(args(&rm), vec!["rm", "-f", "crossmatrix-7-3"]);
    }

    #[test]
    fn container_names_do_not_repeat() {
        let a = unique_container_name("crossmatrix");
        let b = unique_container_name("crossmatrix");
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("crossmatrix-{}-", std::process::id())));
    }
}
