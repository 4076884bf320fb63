//! Provision tool builds for a set of platforms once, then verify every
//! `(built-by, runs-on)` combination in two phases.

pub mod artifact;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod matrix;
pub mod provision;
pub mod report;
pub mod stage;
pub mod template;
pub mod verify;
pub mod workdir;

pub use artifact::{ArtifactKey, ArtifactLayout};
pub use config::{ConfigError, EnvSelector, MatrixConfig, TestCase};
pub use dispatch::ProtocolDispatcher;
pub use host::{check_host, detect_host_tag, HostPaths, UnsupportedHost};
pub use matrix::{
    run_matrix, CaseDispatcher, CaseResult, CaseState, Invocation, MatrixOutcome, Phase,
};
pub use provision::{preflight_runtime, ArtifactManifest, Provisioner, ToolFailure};
pub use report::{exit_code_u8, MatrixReport, ResultSink};
pub use stage::{FsMarkerStore, MarkerStore, StageGate, StageOutcome};
pub use template::TemplateError;
pub use verify::{BuiltArg, BuiltRunner, ContainerRunner, HostRunner};
pub use workdir::WorkDir;
