//! The phase x test-case loop.
//!
//! Every `(case, phase)` pair moves `NotRun -> Dispatched -> Completed`.
//! A failing dispatch is recorded and the loop continues; only errors from
//! the result sink itself (log files, report) stop the run.

use std::fmt;
use std::io::Write;

use anyhow::Result;
use crossmatrix_vm::RunOutput;

use crate::config::{MatrixConfig, TestCase};
use crate::report::{MatrixReport, ResultSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Run the built tool, then use it to cross-build for the other targets.
    One = 1,
    /// Run the programs the tool built in phase one.
    Two = 2,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::One, Phase::Two];

    pub fn number(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    NotRun,
    Dispatched,
    Completed(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// 1-based, counting across both phases; names the log file.
    pub seq: usize,
    /// 1-based position of the case in the config.
    pub case_index: usize,
    pub phase: Phase,
    pub case: &'a TestCase,
}

impl Invocation<'_> {
    pub fn label(&self) -> String {
        format!(
            "phase {} case {} {}",
            self.phase,
            self.case_index,
            self.case.label()
        )
    }

    /// Stable across phases so both phases of a case share caches.
    pub fn case_slug(&self) -> String {
        format!("case-{}", self.case_index)
    }
}

/// Captured result of one invocation. Failures are values here, not errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseResult {
    pub exit_status: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CaseResult {
    pub fn success(&self) -> bool {
        self.exit_status == 0 && !self.timed_out
    }

    pub fn from_run(out: RunOutput) -> Self {
        CaseResult {
            exit_status: out.exit_status,
            timed_out: out.timed_out,
            stdout: out.stdout,
            stderr: out.stderr,
        }
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        CaseResult {
            exit_status: 1,
            timed_out: false,
            stdout: Vec::new(),
            stderr: format!("error: {err:#}\n").into_bytes(),
        }
    }
}

pub trait CaseDispatcher {
    /// Runs one invocation to completion.
    fn dispatch(&mut self, inv: &Invocation<'_>) -> Result<CaseResult>;
}

#[derive(Debug)]
pub struct MatrixOutcome {
    pub report: MatrixReport,
    /// Indexed `phase_index * cases.len() + case_index`.
    pub states: Vec<CaseState>,
}

impl MatrixOutcome {
    pub fn exit_status(&self) -> i32 {
        self.report.exit_status
    }
}

/// Runs every case in phase one, then every case in phase two, in declaration order.
pub fn run_matrix<W: Write>(
    config: &MatrixConfig,
    dispatcher: &mut dyn CaseDispatcher,
    mut sink: ResultSink<W>,
) -> Result<MatrixOutcome> {
    let n_cases = config.cases.len();
    let mut states = vec![CaseState::NotRun; n_cases * Phase::ALL.len()];
    let mut seq = 0;

    for (phase_index, phase) in Phase::ALL.into_iter().enumerate() {
        sink.phase_started(phase)?;
        for (i, case) in config.cases.iter().enumerate() {
            seq += 1;
            let inv = Invocation {
                seq,
                case_index: i + 1,
                phase,
                case,
            };
            let slot = phase_index * n_cases + i;

            states[slot] = CaseState::Dispatched;
            tracing::info!(seq, phase = phase.number(), case = inv.case_index, "dispatch");
            let result = match dispatcher.dispatch(&inv) {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(seq, "dispatch failed: {err:#}");
                    CaseResult::from_error(&err)
                }
            };
            states[slot] = CaseState::Completed(result.exit_status);
            sink.record(&inv, &result)?;
        }
    }

    let report = sink.finish()?;
    Ok(MatrixOutcome { report, states })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered_and_numbered() {
        assert_eq!(Phase::ALL, [Phase::One, Phase::Two]);
        assert_eq!(Phase::One.number(), 1);
        assert_eq!(Phase::Two.to_string(), "2");
        assert!(Phase::One < Phase::Two);
    }

    #[test]
    fn error_becomes_failed_result() {
        let err = anyhow::anyhow!("spawn podman").context("phase 1");
        let r = CaseResult::from_error(&err);
        assert_eq!(r.exit_status, 1);
        assert!(!r.success());
        assert_eq!(String::from_utf8(r.stderr).unwrap(), "error: phase 1: spawn podman\n");
    }
}
