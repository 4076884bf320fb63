//! Shared, version-pinned identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in machine-readable I/O and for the fixed names of the persisted
//! working-directory layout.

pub const MATRIX_CONFIG_SCHEMA_VERSION: &str = "crossmatrix.config@0.1.0";
pub const MATRIX_REPORT_SCHEMA_VERSION: &str = "crossmatrix.report@0.1.0";
pub const ARTIFACT_MANIFEST_SCHEMA_VERSION: &str = "crossmatrix.artifacts@0.1.0";

pub const DEFAULT_WORK_DIR: &str = "tmp";
pub const STAGE_MARKER_FILE: &str = "stage1-ok";
pub const ARTIFACT_MANIFEST_FILE: &str = "artifacts.json";
pub const REPORT_FILE: &str = "report.json";
pub const LOG_FILE_PREFIX: &str = "logfile-";
pub const DOCKERFILE_PREFIX: &str = "dockerfile-";
pub const BUILD_SCRIPT_PREFIX: &str = "build-";
pub const SCRATCH_DIR: &str = "scratch";

pub const RUNS_ON_PREFIX: &str = "runs-on-";
pub const BUILT_BY_PREFIX: &str = "built-by-";

/// Guest path the working directory is bind-mounted at inside isolated environments.
pub const GUEST_SHARED_DIR: &str = "/tmp2";
/// Guest path the SDK/setup directory is bind-mounted at (read-only).
pub const GUEST_SDK_DIR: &str = "/sdk";

pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_UNSUPPORTED_HOST: u8 = 3;
pub const EXIT_STATUS_TIMED_OUT: i32 = 124;
