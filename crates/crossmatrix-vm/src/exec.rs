use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossmatrix_contracts::EXIT_STATUS_TIMED_OUT;

use crate::RunOutput;

pub fn read_to_end_capped<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }

        if truncated {
            continue;
        }

        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

pub fn hard_kill_pid_and_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Puts the child in its own process group so a timeout can kill everything it spawned.
fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

fn wait_child_with_wall_timeout_ms(
    child: &mut Child,
    wall_ms: Option<u64>,
) -> Result<(ExitStatus, bool)> {
    let Some(wall_ms) = wall_ms else {
        let status = child.wait().context("wait child")?;
        return Ok((status, false));
    };

    let wall_limit = Duration::from_millis(wall_ms.max(1));
    let start = Instant::now();
    let deadline = start.checked_add(wall_limit);

    loop {
        if let Some(status) = child.try_wait().context("try_wait child")? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::warn!(
                pid = child.id(),
                wall_ms,
                "wall time limit reached; killing process group"
            );
            hard_kill_pid_and_group(child.id());
            let _ = child.kill();
            let status = child.wait().context("wait child after kill")?;
            return Ok((status, true));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn exit_code_of(status: ExitStatus, timed_out: bool) -> i32 {
    if timed_out {
        return EXIT_STATUS_TIMED_OUT;
    }

    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| 128 + s).unwrap_or(1),
    }
}

pub fn wait_child_output_capped(
    mut child: Child,
    wall_ms: Option<u64>,
    stdout_cap: usize,
    stderr_cap: usize,
) -> Result<RunOutput> {
    let stdout = child.stdout.take().context("take stdout")?;
    let stderr = child.stderr.take().context("take stderr")?;

    let stdout_thread = std::thread::spawn(move || -> std::io::Result<(Vec<u8>, bool)> {
        read_to_end_capped(stdout, stdout_cap)
    });
    let stderr_thread = std::thread::spawn(move || -> std::io::Result<(Vec<u8>, bool)> {
        read_to_end_capped(stderr, stderr_cap)
    });

    let (status, timed_out) = wait_child_with_wall_timeout_ms(&mut child, wall_ms)?;
    let (stdout_bytes, stdout_truncated) = stdout_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)))?;
    let (stderr_bytes, stderr_truncated) = stderr_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)))?;

    Ok(RunOutput {
        exit_status: exit_code_of(status, timed_out),
        timed_out,
        stdout: stdout_bytes,
        stderr: stderr_bytes,
        stdout_truncated,
        stderr_truncated,
    })
}

pub fn run_command_capped(
    mut cmd: Command,
    wall_ms: Option<u64>,
    stdout_cap: usize,
    stderr_cap: usize,
) -> Result<RunOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    own_process_group(&mut cmd);

    tracing::debug!(
        program = ?cmd.get_program(),
        args = ?cmd.get_args().collect::<Vec<_>>(),
        "spawn"
    );
    let child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    wait_child_output_capped(child, wall_ms, stdout_cap, stderr_cap)
}

/// Runs `cmd` with the parent's stdio; returns `(exit_status, timed_out)`.
pub fn run_command_inherit(mut cmd: Command, wall_ms: Option<u64>) -> Result<(i32, bool)> {
    cmd.stdin(Stdio::null());
    own_process_group(&mut cmd);

    tracing::debug!(
        program = ?cmd.get_program(),
        args = ?cmd.get_args().collect::<Vec<_>>(),
        "spawn"
    );
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    let (status, timed_out) = wait_child_with_wall_timeout_ms(&mut child, wall_ms)?;
    Ok((exit_code_of(status, timed_out), timed_out))
}
