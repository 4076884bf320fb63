use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crossmatrix_contracts::MATRIX_REPORT_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};

use crate::matrix::{CaseResult, Invocation, Phase};
use crate::workdir::WorkDir;

/// Exit code for a case/tool status: 0 stays 0, 1..=255 pass through, anything else is 1.
pub fn exit_code_u8(status: i32) -> u8 {
    match status {
        0 => 0,
        1..=255 => status as u8,
        _ => 1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub seq: usize,
    pub phase: u8,
    pub case: usize,
    pub label: String,
    pub env: String,
    pub runs_on: String,
    pub built_by: String,
    pub exit_status: i32,
    pub timed_out: bool,
    pub log_file: String,
}

impl InvocationRecord {
    pub fn ok(&self) -> bool {
        self.exit_status == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixReport {
    pub schema_version: String,
    pub ok: bool,
    /// Last non-zero case status, or 0.
    pub exit_status: i32,
    pub invocations: Vec<InvocationRecord>,
}

/// Persists one log file per invocation, prints the per-case lines and
/// tracks the overall status.
pub struct ResultSink<W: Write> {
    work: WorkDir,
    out: W,
    display_base: Option<PathBuf>,
    records: Vec<InvocationRecord>,
    last_failure: i32,
}

impl<W: Write> ResultSink<W> {
    pub fn new(work: WorkDir, out: W) -> Self {
        ResultSink {
            work,
            out,
            display_base: std::env::current_dir().ok(),
            records: Vec::new(),
            last_failure: 0,
        }
    }

    fn display(&self, path: &Path) -> String {
        self.display_base
            .as_deref()
            .and_then(|base| path.strip_prefix(base).ok())
            .unwrap_or(path)
            .display()
            .to_string()
    }

    pub fn phase_started(&mut self, phase: Phase) -> Result<()> {
        writeln!(self.out, "{}", "#".repeat(80)).context("write stdout")?;
        writeln!(self.out, "# test phase {phase} ...").context("write stdout")?;
        Ok(())
    }

    pub fn record(
        &mut self,
        inv: &Invocation<'_>,
        result: &CaseResult,
    ) -> Result<&InvocationRecord> {
        let log_path = self.work.log_file(inv.seq);
        let mut log = Vec::with_capacity(result.stdout.len() + result.stderr.len() + 32);
        log.extend_from_slice(&result.stdout);
        log.extend_from_slice(&result.stderr);
        log.extend_from_slice(format!("exit status {}\n", result.exit_status).as_bytes());
        if result.timed_out {
            log.extend_from_slice(b"timed out\n");
        }
        std::fs::write(&log_path, &log)
            .with_context(|| format!("write log file: {}", log_path.display()))?;

        let shown = self.display(&log_path);
        let label = inv.label();
        if result.success() {
            writeln!(self.out, "ok: {label} # {shown}").context("write stdout")?;
        } else {
            writeln!(self.out, "error: {label} # {shown}").context("write stdout")?;
            self.last_failure = if result.exit_status != 0 {
                result.exit_status
            } else {
                crossmatrix_contracts::EXIT_STATUS_TIMED_OUT
            };
        }

        self.records.push(InvocationRecord {
            seq: inv.seq,
            phase: inv.phase.number(),
            case: inv.case_index,
            label,
            env: inv.case.env.to_string(),
            runs_on: inv.case.runs_on.clone(),
            built_by: inv.case.built_by.clone(),
            exit_status: result.exit_status,
            timed_out: result.timed_out,
            log_file: shown,
        });
        let last = self.records.len() - 1;
        Ok(&self.records[last])
    }

    /// Prints the closing lines and writes `report.json`.
    pub fn finish(mut self) -> Result<MatrixReport> {
        let report = MatrixReport {
            schema_version: MATRIX_REPORT_SCHEMA_VERSION.to_string(),
            ok: self.last_failure == 0,
            exit_status: self.last_failure,
            invocations: std::mem::take(&mut self.records),
        };

        let path = self.work.report();
        let mut bytes = serde_json::to_vec_pretty(&report)?;
        bytes.push(b'\n');
        std::fs::write(&path, &bytes)
            .with_context(|| format!("write report: {}", path.display()))?;

        let root = self.display(self.work.root());
        writeln!(self.out, "note: delete {root} for a full test run").context("write stdout")?;
        if !report.ok {
            writeln!(self.out, "*** TEST FAILED ***").context("write stdout")?;
        }
        self.out.flush().context("flush stdout")?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatrixConfig;

    #[test]
    fn exit_code_clamping() {
        assert_eq!(exit_code_u8(0), 0);
        assert_eq!(exit_code_u8(3), 3);
        assert_eq!(exit_code_u8(255), 255);
        assert_eq!(exit_code_u8(256), 1);
        assert_eq!(exit_code_u8(-9), 1);
    }

    #[test]
    fn log_file_holds_streams_and_status() {
        let tmp = tempfile::tempdir().unwrap();
        let work = WorkDir::resolve(tmp.path()).unwrap();
        let cfg = MatrixConfig::builtin();
        let mut out = Vec::new();
        let mut sink = ResultSink::new(work.clone(), &mut out);

        let inv = Invocation {
            seq: 5,
            case_index: 2,
            phase: Phase::Two,
            case: &cfg.cases[1],
        };
        let rec = sink
            .record(
                &inv,
                &CaseResult {
                    exit_status: 2,
                    timed_out: false,
                    stdout: b"out\n".to_vec(),
                    stderr: b"err\n".to_vec(),
                },
            )
            .unwrap()
            .clone();
        assert!(!rec.ok());
        assert_eq!(rec.phase, 2);
        assert_eq!(rec.env, "docker.io/arm64v8/alpine:3.16");

        let report = sink.finish().unwrap();
        assert_eq!(
            std::fs::read_to_string(work.log_file(5)).unwrap(),
            "out\nerr\nexit status 2\n"
        );
        assert_eq!(report.exit_status, 2);
        assert!(!report.ok);

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("error: phase 2 case 2 env=docker.io/arm64v8/alpine:3.16"), "{text}");
        assert!(text.contains("logfile-5"), "{text}");
        assert!(text.ends_with("*** TEST FAILED ***\n"), "{text}");

        let on_disk: MatrixReport =
            serde_json::from_slice(&std::fs::read(work.report()).unwrap()).unwrap();
        assert_eq!(on_disk, report);
    }

    #[test]
    fn timeout_without_status_counts_as_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let work = WorkDir::resolve(tmp.path()).unwrap();
        let cfg = MatrixConfig::builtin();
        let mut sink = ResultSink::new(work.clone(), Vec::new());
        let inv = Invocation {
            seq: 1,
            case_index: 1,
            phase: Phase::One,
            case: &cfg.cases[0],
        };
        sink.record(
            &inv,
            &CaseResult {
                exit_status: 0,
                timed_out: true,
                ..CaseResult::default()
            },
        )
        .unwrap();
        let report = sink.finish().unwrap();
        assert_eq!(report.exit_status, crossmatrix_contracts::EXIT_STATUS_TIMED_OUT);
        assert!(std::fs::read_to_string(work.log_file(1))
            .unwrap()
            .ends_with("exit status 0\ntimed out\n"));
    }
}
