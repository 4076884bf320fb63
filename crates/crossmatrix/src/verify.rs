//! The two-phase verification protocol and the places it can run.
//!
//! Phase one runs the provisioned tool on the first payload and uses it to
//! cross-build the second payload for every other target. Phase two runs the
//! programs staged by phase one. Each step's output is appended to a
//! [`Transcript`], which becomes the invocation's log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossmatrix_contracts::GUEST_SHARED_DIR;
use crossmatrix_vm::{
    normalize_abs_path, rebase_path, run_command_capped, unique_container_name, LimitsSpec,
    MountSpec, RunOutput, RunSpec, VmDriver, DEFAULT_MAX_OUTPUT_BYTES,
};

use crate::artifact::{stage_executable, ArtifactKey};
use crate::config::{Isolation, MatrixConfig, TestCase};
use crate::matrix::{CaseResult, Phase};
use crate::template::{self, IsolationVars, PayloadVars};
use crate::workdir::WorkDir;

/// An argument to a built executable. Host paths are translated by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltArg {
    Text(String),
    HostPath(PathBuf),
}

/// Somewhere a built executable can be run.
pub trait BuiltRunner {
    fn describe(&self) -> String;

    /// Runs `artifact` (a host path inside the working directory) with its
    /// directory as the working directory.
    fn run_built(
        &self,
        artifact: &Path,
        args: &[BuiltArg],
        env: &BTreeMap<String, String>,
        wall_ms: Option<u64>,
    ) -> Result<RunOutput>;

    /// Maps a path printed by a program run here back to a host path.
    fn host_path(&self, reported: &Path) -> Result<PathBuf>;
}

fn render_isolation_env(
    isolation: &Isolation,
    vars: &IsolationVars,
) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for (k, v) in &isolation.env {
        let value = template::render(v, vars).with_context(|| format!("isolation env {k}"))?;
        env.insert(k.clone(), value);
    }
    Ok(env)
}

fn create_isolation_dirs(isolation: &Isolation, vars: &IsolationVars) -> Result<()> {
    for d in &isolation.create_dirs {
        let dir = template::render(d, vars)?;
        std::fs::create_dir_all(&dir).with_context(|| format!("create dir: {dir}"))?;
    }
    Ok(())
}

/// Runs directly on the host with the host isolation environment.
#[derive(Debug, Clone)]
pub struct HostRunner {
    env: BTreeMap<String, String>,
}

impl HostRunner {
    pub fn new(isolation: &Isolation, work: &WorkDir, case: &str) -> Result<Self> {
        let vars = IsolationVars {
            root: work.root().display().to_string(),
            case: case.to_string(),
        };
        create_isolation_dirs(isolation, &vars)?;
        Ok(HostRunner {
            env: render_isolation_env(isolation, &vars)?,
        })
    }
}

impl BuiltRunner for HostRunner {
    fn describe(&self) -> String {
        "host".to_string()
    }

    fn run_built(
        &self,
        artifact: &Path,
        args: &[BuiltArg],
        env: &BTreeMap<String, String>,
        wall_ms: Option<u64>,
    ) -> Result<RunOutput> {
        let mut cmd = Command::new(artifact);
        for arg in args {
            match arg {
                BuiltArg::Text(s) => cmd.arg(s),
                BuiltArg::HostPath(p) => cmd.arg(p),
            };
        }
        cmd.envs(&self.env).envs(env);
        if let Some(dir) = artifact.parent() {
            cmd.current_dir(dir);
        }
        run_command_capped(cmd, wall_ms, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MAX_OUTPUT_BYTES)
    }

    fn host_path(&self, reported: &Path) -> Result<PathBuf> {
        Ok(reported.to_path_buf())
    }
}

/// Runs inside a container image with the working directory mounted at the
/// shared guest path.
pub struct ContainerRunner<'a> {
    driver: &'a dyn VmDriver,
    image: String,
    host_root: PathBuf,
    guest_root: PathBuf,
    env: BTreeMap<String, String>,
}

impl<'a> ContainerRunner<'a> {
    pub fn new(
        driver: &'a dyn VmDriver,
        image: &str,
        isolation: &Isolation,
        work: &WorkDir,
        case: &str,
    ) -> Result<Self> {
        create_isolation_dirs(
            isolation,
            &IsolationVars {
                root: work.root().display().to_string(),
                case: case.to_string(),
            },
        )?;
        let env = render_isolation_env(
            isolation,
            &IsolationVars {
                root: GUEST_SHARED_DIR.to_string(),
                case: case.to_string(),
            },
        )?;
        Ok(ContainerRunner {
            driver,
            image: image.to_string(),
            host_root: work.root().to_path_buf(),
            guest_root: PathBuf::from(GUEST_SHARED_DIR),
            env,
        })
    }

    fn to_guest(&self, host: &Path) -> Result<PathBuf> {
        rebase_path(host, &self.host_root, &self.guest_root).with_context(|| {
            format!(
                "path is outside the shared working directory {}: {}",
                self.host_root.display(),
                host.display()
            )
        })
    }
}

impl BuiltRunner for ContainerRunner<'_> {
    fn describe(&self) -> String {
        format!("{} {}", self.driver.backend(), self.image)
    }

    fn run_built(
        &self,
        artifact: &Path,
        args: &[BuiltArg],
        env: &BTreeMap<String, String>,
        wall_ms: Option<u64>,
    ) -> Result<RunOutput> {
        let guest_artifact = self.to_guest(artifact)?;
        let mut argv = vec![guest_artifact.display().to_string()];
        for arg in args {
            match arg {
                BuiltArg::Text(s) => argv.push(s.clone()),
                BuiltArg::HostPath(p) => argv.push(self.to_guest(p)?.display().to_string()),
            }
        }
        let mut run_env = self.env.clone();
        run_env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let spec = RunSpec {
            name: Some(unique_container_name("crossmatrix")),
            image: self.image.clone(),
            argv,
            env: run_env,
            mounts: vec![MountSpec {
                host_path: self.host_root.clone(),
                guest_path: self.guest_root.clone(),
                readonly: false,
            }],
            workdir: guest_artifact.parent().map(Path::to_path_buf),
            limits: LimitsSpec::with_wall_ms(wall_ms),
        };
        self.driver.run(&spec)
    }

    fn host_path(&self, reported: &Path) -> Result<PathBuf> {
        let reported = normalize_abs_path(reported)?;
        rebase_path(&reported, &self.guest_root, &self.host_root).with_context(|| {
            format!(
                "reported path is outside the shared mount {}: {}",
                self.guest_root.display(),
                reported.display()
            )
        })
    }
}

/// Wall-clock budget shared by every step of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    pub fn after_ms(ms: Option<u64>) -> Self {
        Deadline {
            end: ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
        }
    }

    pub fn unbounded() -> Self {
        Deadline { end: None }
    }

    /// Remaining budget; at least 1ms so an exhausted budget still times out.
    pub fn remaining_ms(&self) -> Option<u64> {
        self.end.map(|end| {
            let left = end.saturating_duration_since(Instant::now()).as_millis();
            u64::try_from(left).unwrap_or(u64::MAX).max(1)
        })
    }
}

/// Log of one invocation, step by step.
#[derive(Debug, Default)]
pub struct Transcript {
    buf: Vec<u8>,
}

impl Transcript {
    pub fn note(&mut self, line: impl AsRef<str>) {
        self.buf.extend_from_slice(line.as_ref().as_bytes());
        self.buf.push(b'\n');
    }

    pub fn output(&mut self, out: &RunOutput) {
        self.buf.extend_from_slice(&out.stdout);
        self.buf.extend_from_slice(&out.stderr);
        if !self.buf.is_empty() && !self.buf.ends_with(b"\n") {
            self.buf.push(b'\n');
        }
        if out.stdout_truncated || out.stderr_truncated {
            self.note("note: output truncated");
        }
    }

    pub fn finish(self, exit_status: i32, timed_out: bool) -> CaseResult {
        CaseResult {
            exit_status,
            timed_out,
            stdout: self.buf,
            stderr: Vec::new(),
        }
    }
}

/// Writes both payload sources into the working directory.
pub fn write_payloads(config: &MatrixConfig, work: &WorkDir) -> Result<()> {
    for payload in [&config.payloads.first, &config.payloads.second] {
        let body = template::render(
            &config.payloads.body,
            &PayloadVars {
                marker: payload.marker.clone(),
            },
        )?;
        let path = work.payload(&payload.file);
        std::fs::write(&path, body.as_bytes())
            .with_context(|| format!("write payload: {}", path.display()))?;
    }
    Ok(())
}

pub struct VerifyContext<'a> {
    pub config: &'a MatrixConfig,
    pub work: &'a WorkDir,
    pub deadline: Deadline,
}

enum Step {
    Passed(RunOutput),
    Failed { exit_status: i32, timed_out: bool },
}

fn run_step(
    runner: &dyn BuiltRunner,
    ctx: &VerifyContext<'_>,
    t: &mut Transcript,
    artifact: &Path,
    args: &[BuiltArg],
    env: &BTreeMap<String, String>,
    marker: Option<&str>,
) -> Result<Step> {
    let shown: Vec<String> = args
        .iter()
        .map(|a| match a {
            BuiltArg::Text(s) => s.clone(),
            BuiltArg::HostPath(p) => p.display().to_string(),
        })
        .collect();
    let env_shown: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    t.note(format!(
        "+ [{}] {}{} {}",
        runner.describe(),
        env_shown.iter().map(|e| format!("{e} ")).collect::<String>(),
        artifact.display(),
        shown.join(" ")
    ));

    let out = runner.run_built(artifact, args, env, ctx.deadline.remaining_ms())?;
    t.output(&out);
    if !out.success() {
        if out.timed_out {
            t.note("note: timed out");
        }
        return Ok(Step::Failed {
            exit_status: out.exit_status,
            timed_out: out.timed_out,
        });
    }
    if let Some(marker) = marker {
        if !out.combined_lossy().contains(marker) {
            t.note(format!("error: output does not contain marker {marker:?}"));
            return Ok(Step::Failed {
                exit_status: 1,
                timed_out: false,
            });
        }
    }
    Ok(Step::Passed(out))
}

/// Copies the artifact `key/name` into `scratch`, or records it as missing.
fn fetch_artifact(
    ctx: &VerifyContext<'_>,
    t: &mut Transcript,
    key: &ArtifactKey,
    name: &str,
    scratch: &Path,
) -> Result<Option<PathBuf>> {
    let layout = ctx.work.layout();
    if !layout.exists(key, name) {
        t.note(format!(
            "error: missing artifact {key}/{name} (not produced by platform {})",
            key.built_by
        ));
        return Ok(None);
    }
    let staged = stage_executable(&layout.file(key, name), scratch, name)?;
    Ok(Some(staged))
}

/// Runs one phase of `case`. Failures of the system under test, and harness
/// errors hit partway through, come back as a non-zero [`CaseResult`] whose
/// log keeps the output of every step that already ran.
pub fn run_phase(
    runner: &dyn BuiltRunner,
    ctx: &VerifyContext<'_>,
    case: &TestCase,
    phase: Phase,
    scratch: &Path,
) -> Result<CaseResult> {
    let mut t = Transcript::default();
    t.note(format!("# phase {phase}: {} via {}", case.label(), runner.describe()));
    match run_phase_steps(runner, ctx, case, phase, scratch, &mut t) {
        Ok((exit_status, timed_out)) => Ok(t.finish(exit_status, timed_out)),
        Err(err) => {
            t.note(format!("error: {err:#}"));
            Ok(t.finish(1, false))
        }
    }
}

/// Returns `(exit_status, timed_out)`; the transcript collects everything else.
fn run_phase_steps(
    runner: &dyn BuiltRunner,
    ctx: &VerifyContext<'_>,
    case: &TestCase,
    phase: Phase,
    scratch: &Path,
    t: &mut Transcript,
) -> Result<(i32, bool)> {
    let key = ArtifactKey::new(&case.runs_on, &case.built_by);
    let no_env = BTreeMap::new();

    match phase {
        Phase::One => {
            let tool = &ctx.config.tool;
            let payloads = &ctx.config.payloads;
            let Some(exe) = fetch_artifact(ctx, t, &key, &tool.exe, scratch)? else {
                return Ok((1, false));
            };

            let first = [BuiltArg::HostPath(ctx.work.payload(&payloads.first.file))];
            if let Step::Failed {
                exit_status,
                timed_out,
            } = run_step(
                runner,
                ctx,
                t,
                &exe,
                &first,
                &no_env,
                Some(&payloads.first.marker),
            )? {
                return Ok((exit_status, timed_out));
            }
            t.note(format!(
                "ok: built by {} runs on {} in {}",
                case.built_by,
                case.runs_on,
                runner.describe()
            ));

            let mut cross_args: Vec<BuiltArg> =
                tool.cross_args.iter().cloned().map(BuiltArg::Text).collect();
            cross_args.push(BuiltArg::HostPath(ctx.work.payload(&payloads.second.file)));

            for target in ctx.config.targets.iter().filter(|tg| tg.tag != case.runs_on) {
                let out = match run_step(
                    runner,
                    ctx,
                    t,
                    &exe,
                    &cross_args,
                    &target.cross_env,
                    Some(&payloads.second.marker),
                )? {
                    Step::Passed(out) => out,
                    Step::Failed {
                        exit_status,
                        timed_out,
                    } => return Ok((exit_status, timed_out)),
                };
                let Some(reported) = tool.locate.locate(&out.combined_lossy()) else {
                    t.note(format!(
                        "error: no line containing {:?} in cross-build output for {}",
                        tool.locate.line_marker, target.tag
                    ));
                    return Ok((1, false));
                };
                let built = runner.host_path(&reported)?;
                if !built.is_file() {
                    t.note(format!("error: cross-built program not found: {}", built.display()));
                    return Ok((1, false));
                }
                let dest = ArtifactKey::new(&target.tag, &case.built_by);
                let staged = ctx.work.layout().stage(&dest, &built, &tool.program)?;
                t.note(format!("staged {}", staged.display()));
            }
            Ok((0, false))
        }
        Phase::Two => {
            let Some(program) = fetch_artifact(ctx, t, &key, &ctx.config.tool.program, scratch)?
            else {
                return Ok((1, false));
            };
            match run_step(runner, ctx, t, &program, &[], &no_env, None)? {
                Step::Passed(_) => Ok((0, false)),
                Step::Failed {
                    exit_status,
                    timed_out,
                } => Ok((exit_status, timed_out)),
            }
        }
    }
}
