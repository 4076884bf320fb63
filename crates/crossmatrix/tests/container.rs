use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use crossmatrix::config::{
    EnvironmentImage, Isolation, Payload, Payloads, Platform, ProgramLocator, Target, Timeouts,
    ToolSpec,
};
use crossmatrix::{
    ArtifactKey, CaseDispatcher, CaseResult, EnvSelector, Invocation, MatrixConfig, Phase,
    ProtocolDispatcher, TestCase, WorkDir,
};
use crossmatrix_contracts::{EXIT_STATUS_TIMED_OUT, MATRIX_CONFIG_SCHEMA_VERSION};
use crossmatrix_vm::{MountSpec, RunOutput, RunSpec, VmBackend, VmDriver};

type Respond = Box<dyn Fn(&RunSpec) -> Result<RunOutput>>;

/// Answers container runs from a closure and remembers every spec it saw.
struct ScriptedDriver {
    runs: RefCell<Vec<RunSpec>>,
    respond: Respond,
}

impl ScriptedDriver {
    fn new(respond: impl Fn(&RunSpec) -> Result<RunOutput> + 'static) -> Self {
        ScriptedDriver {
            runs: RefCell::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    fn runs(&self) -> Vec<RunSpec> {
        self.runs.borrow().clone()
    }
}

impl VmDriver for ScriptedDriver {
    fn backend(&self) -> VmBackend {
        VmBackend::Podman
    }

    fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        self.runs.borrow_mut().push(spec.clone());
        (self.respond)(spec)
    }

    fn build_image(
        &self,
        _dockerfile: &Path,
        _tag: &str,
        _context_dir: &Path,
        _wall_ms: Option<u64>,
    ) -> Result<(i32, bool)> {
        anyhow::bail!("no image builds during verification")
    }

    fn image_id(&self, _image: &str) -> Result<String> {
        anyhow::bail!("no image lookups during verification")
    }
}

fn stdout(text: &str) -> RunOutput {
    RunOutput {
        stdout: text.as_bytes().to_vec(),
        ..RunOutput::default()
    }
}

/// Host side of a guest path, through the spec's single bind mount.
fn on_host(spec: &RunSpec, guest: &str) -> PathBuf {
    let m = &spec.mounts[0];
    m.host_path.join(Path::new(guest).strip_prefix(&m.guest_path).unwrap())
}

/// The tool inside the image: prints the payload it is given and, in cross
/// mode, writes a program under $HOME and reports it on a `->` line.
fn tool_in_image(spec: &RunSpec) -> Result<RunOutput> {
    let exe = spec.argv[0].as_str();
    if exe.ends_with("/goscript") {
        return Ok(stdout("hello from goscript\n"));
    }
    if spec.argv.get(1).map(String::as_str) == Some("-show") {
        let goos = &spec.env["GOOS"];
        let guest_dir = format!("{}/build-{goos}", spec.env["HOME"]);
        let host_dir = on_host(spec, &guest_dir);
        std::fs::create_dir_all(&host_dir)?;
        std::fs::write(host_dir.join("main"), format!("built for {goos}\n"))?;
        let payload = std::fs::read_to_string(on_host(spec, &spec.argv[2]))?;
        return Ok(stdout(&format!("{payload}cache -> {guest_dir}/exe\n")));
    }
    Ok(stdout(&std::fs::read_to_string(on_host(spec, &spec.argv[1]))?))
}

fn config() -> MatrixConfig {
    let s = |v: &str| v.to_string();
    let case = |runs_on: &str| TestCase {
        env: EnvSelector::Image(s("arm64-ubuntu")),
        runs_on: s(runs_on),
        built_by: s("builder"),
        command: None,
    };
    MatrixConfig {
        schema_version: s(MATRIX_CONFIG_SCHEMA_VERSION),
        host: s("here"),
        backend: VmBackend::Podman,
        timeouts: Timeouts {
            provision_ms: None,
            case_ms: Some(60_000),
        },
        images: vec![EnvironmentImage {
            tag: s("arm64-ubuntu"),
            build_script: s("FROM scratch\n"),
        }],
        platforms: vec![Platform {
            tag: s("builder"),
            invocation: s("sh {{work_dir}}/{{script}}"),
            toolchain_archive: s("toolchain.tar.gz"),
            provision_script: s("#!/bin/sh\ntrue\n"),
            produces: vec![s("linux")],
        }],
        targets: vec![
            Target {
                tag: s("linux"),
                cross_env: BTreeMap::from([(s("GOOS"), s("linux"))]),
            },
            Target {
                tag: s("elsewhere"),
                cross_env: BTreeMap::from([(s("GOOS"), s("elsewhere"))]),
            },
        ],
        tool: ToolSpec {
            exe: s("gorun"),
            cross_args: vec![s("-show")],
            locate: ProgramLocator {
                line_marker: s("->"),
                field: 2,
                file_name: s("main"),
            },
            program: s("goscript"),
        },
        payloads: Payloads {
            body: s("payload says {{marker}}\n"),
            first: Payload {
                file: s("payload-blue"),
                marker: s("blue"),
            },
            second: Payload {
                file: s("payload-green"),
                marker: s("green"),
            },
        },
        host_isolation: Isolation::default(),
        container_isolation: Isolation {
            env: BTreeMap::from([(s("HOME"), s("{{root}}/home/{{case}}"))]),
            create_dirs: vec![s("{{root}}/home/{{case}}")],
        },
        cases: vec![case("linux"), case("elsewhere")],
    }
}

fn setup() -> (tempfile::TempDir, WorkDir, MatrixConfig) {
    let tmp = tempfile::tempdir().unwrap();
    let work = WorkDir::resolve(&tmp.path().join("work")).unwrap();
    work.create().unwrap();
    let cfg = config();
    cfg.validate().unwrap();

    let src = work.root().join("src-gorun");
    std::fs::write(&src, "#!/bin/sh\n").unwrap();
    work.layout()
        .stage(&ArtifactKey::new("linux", "builder"), &src, "gorun")
        .unwrap();
    (tmp, work, cfg)
}

fn dispatch(
    dispatcher: &mut ProtocolDispatcher<'_>,
    cfg: &MatrixConfig,
    seq: usize,
    case_index: usize,
    phase: Phase,
) -> CaseResult {
    let inv = Invocation {
        seq,
        case_index,
        phase,
        case: &cfg.cases[case_index - 1],
    };
    dispatcher.dispatch(&inv).unwrap()
}

fn log_text(r: &CaseResult) -> String {
    String::from_utf8_lossy(&r.stdout).into_owned()
}

#[test]
fn container_case_bootstraps_the_other_target() {
    let (_tmp, work, cfg) = setup();
    let driver = ScriptedDriver::new(tool_in_image);
    let mut dispatcher = ProtocolDispatcher::new(&cfg, &work, &driver).unwrap();

    let r = dispatch(&mut dispatcher, &cfg, 1, 1, Phase::One);
    assert_eq!(r.exit_status, 0, "{}", log_text(&r));
    let text = log_text(&r);
    assert!(text.contains("payload says blue"), "{text}");
    assert!(text.contains("payload says green"), "{text}");
    assert!(text.contains("via podman arm64-ubuntu"), "{text}");

    let runs = driver.runs();
    assert_eq!(runs.len(), 2, "one direct run, one cross build");
    let first = &runs[0];
    assert_eq!(first.image, "arm64-ubuntu");
    assert_eq!(
        first.mounts,
        vec![MountSpec {
            host_path: work.root().to_path_buf(),
            guest_path: PathBuf::from("/tmp2"),
            readonly: false,
        }]
    );
    assert_eq!(first.env["HOME"], "/tmp2/home/case-1");
    assert_eq!(first.argv, vec!["/tmp2/scratch/1/gorun", "/tmp2/payload-blue"]);
    assert_eq!(first.workdir, Some(PathBuf::from("/tmp2/scratch/1")));
    assert!(first.limits.wall_ms.is_some());
    let name = first.name.clone().unwrap();
    assert!(name.starts_with("crossmatrix-"), "{name}");

    let cross = &runs[1];
    assert_eq!(
        cross.argv,
        vec!["/tmp2/scratch/1/gorun", "-show", "/tmp2/payload-green"]
    );
    assert_eq!(cross.env["GOOS"], "elsewhere");
    assert_eq!(cross.env["HOME"], "/tmp2/home/case-1");
    assert_ne!(cross.name, first.name);
    assert!(work.root().join("home/case-1").is_dir());

    let staged = work
        .layout()
        .file(&ArtifactKey::new("elsewhere", "builder"), "goscript");
    assert_eq!(
        std::fs::read_to_string(&staged).unwrap(),
        "built for elsewhere\n"
    );

    // Phase 2 of the other case runs what phase 1 staged for it.
    let r = dispatch(&mut dispatcher, &cfg, 4, 2, Phase::Two);
    assert_eq!(r.exit_status, 0, "{}", log_text(&r));
    assert!(log_text(&r).contains("hello from goscript"));
    let runs = driver.runs();
    let last = runs.last().unwrap();
    assert_eq!(last.argv, vec!["/tmp2/scratch/4/goscript"]);
    assert_eq!(last.env["HOME"], "/tmp2/home/case-2");
    assert_eq!(last.workdir, Some(PathBuf::from("/tmp2/scratch/4")));
}

#[test]
fn container_output_without_marker_fails() {
    let (_tmp, work, cfg) = setup();
    let driver = ScriptedDriver::new(|_| Ok(stdout("payload says red\n")));
    let mut dispatcher = ProtocolDispatcher::new(&cfg, &work, &driver).unwrap();

    let r = dispatch(&mut dispatcher, &cfg, 1, 1, Phase::One);
    assert_eq!(r.exit_status, 1);
    assert!(log_text(&r).contains("does not contain marker \"blue\""));
    assert_eq!(driver.runs().len(), 1, "no cross build after a failed run");
    assert!(!work
        .layout()
        .exists(&ArtifactKey::new("elsewhere", "builder"), "goscript"));
}

#[test]
fn container_timeout_is_reported() {
    let (_tmp, work, cfg) = setup();
    let driver = ScriptedDriver::new(|_| {
        Ok(RunOutput {
            exit_status: EXIT_STATUS_TIMED_OUT,
            timed_out: true,
            stdout: b"payload says bl".to_vec(),
            ..RunOutput::default()
        })
    });
    let mut dispatcher = ProtocolDispatcher::new(&cfg, &work, &driver).unwrap();

    let r = dispatch(&mut dispatcher, &cfg, 1, 1, Phase::One);
    assert!(r.timed_out);
    assert_eq!(r.exit_status, EXIT_STATUS_TIMED_OUT);
    assert!(log_text(&r).contains("payload says bl\nnote: timed out"));
}

#[test]
fn path_outside_mount_keeps_earlier_output() {
    let (_tmp, work, cfg) = setup();
    let driver = ScriptedDriver::new(|spec| {
        if spec.argv.get(1).map(String::as_str) == Some("-show") {
            return Ok(stdout(
                "standalone go code - green\nbuild -> /root/.cache/gorun/abc/main.go\n",
            ));
        }
        Ok(stdout("standalone go code - blue\n"))
    });
    let mut dispatcher = ProtocolDispatcher::new(&cfg, &work, &driver).unwrap();

    let r = dispatch(&mut dispatcher, &cfg, 1, 1, Phase::One);
    assert_eq!(r.exit_status, 1);
    assert!(!r.timed_out);
    let text = log_text(&r);
    assert!(text.contains("standalone go code - blue"), "{text}");
    assert!(text.contains("build -> /root/.cache/gorun/abc/main.go"), "{text}");
    assert!(
        text.contains("error: reported path is outside the shared mount /tmp2"),
        "{text}"
    );
}

#[test]
fn runtime_error_mid_phase_keeps_earlier_output() {
    let (_tmp, work, cfg) = setup();
    let driver = ScriptedDriver::new(|spec| {
        if spec.argv.get(1).map(String::as_str) == Some("-show") {
            anyhow::bail!("spawn \"podman\": No such file or directory");
        }
        Ok(stdout("payload says blue\n"))
    });
    let mut dispatcher = ProtocolDispatcher::new(&cfg, &work, &driver).unwrap();

    let r = dispatch(&mut dispatcher, &cfg, 1, 1, Phase::One);
    assert_eq!(r.exit_status, 1);
    let text = log_text(&r);
    let ran = text.find("payload says blue").unwrap();
    let failed = text.find("error: spawn \"podman\"").unwrap();
    assert!(ran < failed, "{text}");
}
