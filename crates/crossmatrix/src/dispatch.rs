use std::process::Command;

use anyhow::{Context, Result};
use crossmatrix_vm::{run_command_capped, VmDriver, DEFAULT_MAX_OUTPUT_BYTES};

use crate::config::{EnvSelector, MatrixConfig};
use crate::matrix::{CaseDispatcher, CaseResult, Invocation};
use crate::template::{self, CaseVars};
use crate::verify::{self, ContainerRunner, Deadline, HostRunner, VerifyContext};
use crate::workdir::WorkDir;

/// Dispatches invocations to the built-in protocol, or to a case's custom command.
pub struct ProtocolDispatcher<'a> {
    config: &'a MatrixConfig,
    work: &'a WorkDir,
    driver: &'a dyn VmDriver,
    case_ms: Option<u64>,
}

impl<'a> ProtocolDispatcher<'a> {
    /// Writes the payload sources the protocol runs against.
    pub fn new(
        config: &'a MatrixConfig,
        work: &'a WorkDir,
        driver: &'a dyn VmDriver,
    ) -> Result<Self> {
        verify::write_payloads(config, work)?;
        Ok(ProtocolDispatcher {
            config,
            work,
            driver,
            case_ms: config.timeouts.case_ms,
        })
    }

    pub fn with_case_timeout_ms(mut self, case_ms: Option<u64>) -> Self {
        self.case_ms = case_ms;
        self
    }

    fn run_custom(&self, inv: &Invocation<'_>, command: &str) -> Result<CaseResult> {
        let line = template::render(
            command,
            &CaseVars {
                work_dir: self.work.root().display().to_string(),
                env: inv.case.env.to_string(),
                runs_on: inv.case.runs_on.clone(),
                built_by: inv.case.built_by.clone(),
            },
        )?;
        let mut argv = template::split_command_line(&line);
        argv.push(inv.phase.to_string());
        let (program, args) = argv
            .split_first()
            .with_context(|| format!("case {}: command renders to nothing", inv.case_index))?;

        tracing::debug!(command = %line, phase = inv.phase.number(), "custom case command");
        let mut cmd = Command::new(program);
        cmd.args(args);
        let out = run_command_capped(
            cmd,
            self.case_ms,
            DEFAULT_MAX_OUTPUT_BYTES,
            DEFAULT_MAX_OUTPUT_BYTES,
        )?;
        Ok(CaseResult::from_run(out))
    }
}

impl CaseDispatcher for ProtocolDispatcher<'_> {
    fn dispatch(&mut self, inv: &Invocation<'_>) -> Result<CaseResult> {
        if let Some(command) = &inv.case.command {
            return self.run_custom(inv, command);
        }

        let scratch = self.work.fresh_scratch(inv.seq)?;
        let ctx = VerifyContext {
            config: self.config,
            work: self.work,
            deadline: Deadline::after_ms(self.case_ms),
        };
        let slug = inv.case_slug();
        match &inv.case.env {
            EnvSelector::Host => {
                let runner = HostRunner::new(&self.config.host_isolation, self.work, &slug)?;
                verify::run_phase(&runner, &ctx, inv.case, inv.phase, &scratch)
            }
            EnvSelector::Image(image) => {
                let runner = ContainerRunner::new(
                    self.driver,
                    image,
                    &self.config.container_isolation,
                    self.work,
                    &slug,
                )?;
                verify::run_phase(&runner, &ctx, inv.case, inv.phase, &scratch)
            }
        }
    }
}
