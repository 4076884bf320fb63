use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser};
use crossmatrix::artifact::expected_keys;
use crossmatrix::{
    check_host, detect_host_tag, exit_code_u8, preflight_runtime, run_matrix, EnvSelector,
    FsMarkerStore, HostPaths, MarkerStore, MatrixConfig, ProtocolDispatcher, Provisioner,
    ResultSink, StageGate, StageOutcome, ToolFailure, UnsupportedHost, WorkDir,
};
use crossmatrix_contracts::{DEFAULT_WORK_DIR, EXIT_CONFIG_ERROR, EXIT_UNSUPPORTED_HOST};
use crossmatrix_vm::{resolve_vm_backend, DefaultVmDriver, VmBackend};

const ENV_LOG: &str = "CROSSMATRIX_LOG";

#[derive(Parser, Debug)]
#[command(name = "crossmatrix")]
#[command(
    about = "Build a tool for every platform once, then verify each build on each target.",
    long_about = None
)]
#[command(version)]
#[command(subcommand_required = false)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Matrix config JSON (defaults to the built-in matrix).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Persistent working directory.
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_WORK_DIR)]
    work_dir: PathBuf,

    /// Directory holding toolchain archives (defaults to $HOME/sdk/setup).
    #[arg(long, global = true, value_name = "DIR")]
    sdk_dir: Option<PathBuf>,

    /// Container runtime; overrides the config and CROSSMATRIX_BACKEND.
    #[arg(long, global = true, value_parser = parse_backend)]
    backend: Option<VmBackend>,

    /// Run even if this host is not the configured host platform.
    #[arg(long, global = true)]
    skip_host_check: bool,

    /// Raise log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Provision if needed, then run the verification matrix (default).
    Run(MatrixArgs),
    /// Build environment images and artifacts.
    Provision(ProvisionArgs),
    /// Run the verification matrix against existing artifacts.
    Test(MatrixArgs),
    /// Remove the provisioning marker so the next run rebuilds everything.
    Reset,
    /// Print the effective matrix config as JSON.
    Config,
}

#[derive(Args, Debug, Default)]
struct MatrixArgs {
    /// Per-invocation wall-clock limit; 0 disables it.
    #[arg(long, value_name = "MS")]
    case_timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct ProvisionArgs {
    /// Clear the marker first.
    #[arg(long)]
    force: bool,
}

fn parse_backend(s: &str) -> Result<VmBackend, String> {
    s.parse::<VmBackend>().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            if let Some(host) = err.downcast_ref::<UnsupportedHost>() {
                eprintln!("{host}");
                return ExitCode::from(EXIT_UNSUPPORTED_HOST);
            }
            eprintln!("{err:#}");
            if let Some(failure) = err.downcast_ref::<ToolFailure>() {
                return ExitCode::from(failure.exit_code());
            }
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env(ENV_LOG)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn load_config(global: &GlobalArgs) -> Result<MatrixConfig> {
    let mut config = match &global.config {
        Some(path) => MatrixConfig::load(path)?,
        None => MatrixConfig::builtin(),
    };
    if let Some(backend) = global.backend {
        config.backend = backend;
    } else {
        config.backend = resolve_vm_backend(config.backend)?;
    }
    config.validate()?;
    Ok(config)
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let command = cli.command.unwrap_or(Command::Run(MatrixArgs::default()));
    let loaded = load_config(&cli.global);
    if command.needs_host() {
        // An unsupported host wins over a broken config.
        let expected = match &loaded {
            Ok(config) => config.host.clone(),
            Err(_) => MatrixConfig::builtin().host,
        };
        host_check(&expected, cli.global.skip_host_check)?;
    }
    let config = loaded?;
    let work = WorkDir::resolve(&cli.global.work_dir)?;
    let store = FsMarkerStore::new(work.marker());

    match command {
        Command::Config => {
            let bytes = config.to_json_pretty()?;
            println!("{}", String::from_utf8_lossy(&bytes).trim_end());
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset => {
            if store.clear()? {
                println!("removed {}", work.marker().display());
            } else {
                println!("no marker at {}", work.marker().display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Provision(args) => {
            if args.force {
                store.clear()?;
            }
            let outcome = provision(&config, &work, &store, cli.global.sdk_dir.as_deref())?;
            if outcome == StageOutcome::Skipped {
                println!(
                    "already provisioned; delete {} or pass --force to rebuild",
                    work.marker().display()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Test(args) => {
            if !store.exists()? {
                tracing::warn!(
                    marker = %work.marker().display(),
                    "not provisioned; cases without artifacts will fail"
                );
            }
            let layout = work.layout();
            for key in expected_keys(&config) {
                if !layout.exists(&key, &config.tool.exe) {
                    tracing::warn!(artifact = %key, "provisioned artifact missing");
                }
            }
            matrix(&config, &work, &args)
        }
        Command::Run(args) => {
            provision(&config, &work, &store, cli.global.sdk_dir.as_deref())?;
            matrix(&config, &work, &args)
        }
    }
}

impl Command {
    fn needs_host(&self) -> bool {
        matches!(self, Command::Run(_) | Command::Provision(_) | Command::Test(_))
    }
}

fn host_check(expected: &str, skip: bool) -> Result<()> {
    let actual = detect_host_tag();
    if skip {
        tracing::info!(host = %actual, expected, "host check skipped");
        return Ok(());
    }
    check_host(expected, &actual)?;
    Ok(())
}

fn provision(
    config: &MatrixConfig,
    work: &WorkDir,
    store: &dyn MarkerStore,
    sdk_dir: Option<&Path>,
) -> Result<StageOutcome> {
    let gate = StageGate::new(store);
    if gate.check()? {
        return Ok(StageOutcome::Skipped);
    }
    let paths = HostPaths::from_env(sdk_dir)?;
    if !config.images.is_empty() {
        preflight_runtime(config.backend)?;
    }
    let driver = DefaultVmDriver::new(config.backend);
    gate.run(|| {
        let manifest = Provisioner {
            config,
            work,
            paths: &paths,
            driver: &driver,
        }
        .run()?;
        tracing::info!(artifacts = manifest.artifacts.len(), "provisioning complete");
        Ok(())
    })
}

fn matrix(config: &MatrixConfig, work: &WorkDir, args: &MatrixArgs) -> Result<ExitCode> {
    work.create()?;
    let needs_runtime = config
        .cases
        .iter()
        .any(|c| c.command.is_none() && matches!(c.env, EnvSelector::Image(_)));
    if needs_runtime {
        preflight_runtime(config.backend)?;
    }

    let driver = DefaultVmDriver::new(config.backend);
    let mut dispatcher = ProtocolDispatcher::new(config, work, &driver)
        .context("prepare verification payloads")?;
    if let Some(ms) = args.case_timeout_ms {
        dispatcher = dispatcher.with_case_timeout_ms((ms > 0).then_some(ms));
    }

    let stdout = std::io::stdout();
    let sink = ResultSink::new(work.clone(), stdout.lock());
    let outcome = run_matrix(config, &mut dispatcher, sink)?;
    Ok(ExitCode::from(exit_code_u8(outcome.exit_status())))
}
