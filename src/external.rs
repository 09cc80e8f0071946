//! Synchronous subprocesses with a wall-clock bound.

use std::io::Read;
use std::path::Path;
use std::process::{Command as ProcessCommand, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Replaces `{name}` placeholders in every argument.
pub fn substitute(command: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    command
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// Runs `command` to completion. Fails on spawn errors, on timeout (the
/// child is killed) and on a non-zero exit.
pub fn run_tool(command: &[String], cwd: Option<&Path>, timeout: Duration) -> Result<ToolOutput> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| PipelineError::config("external command is empty"))?;

    let mut proc = ProcessCommand::new(program);
    proc.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        proc.current_dir(cwd);
    }

    log::debug!("running {}", command.join(" "));
    let mut child = proc
        .spawn()
        .map_err(|err| PipelineError::external_tool(program, format!("cannot start: {err}")))?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    // A deadline past what Instant can represent means no deadline.
    let deadline = Instant::now().checked_add(timeout);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::external_tool(
                program,
                format!("timed out after {}s", timeout.as_secs_f64()),
            ));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let output = ToolOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };
    if !output.status.success() {
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        return Err(PipelineError::external_tool(
            program,
            format!("exit status {code}: {}", stderr_tail(&output.stderr)),
        ));
    }
    Ok(output)
}

fn drain<R>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines = text.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::{run_tool, substitute};
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn placeholders_are_replaced_in_every_argument() {
        let command = vec!["tool".to_string(), "--in={input}".to_string(), "{output}".to_string()];
        assert_eq!(
            substitute(&command, &[("input", "/a"), ("output", "/b")]),
            vec!["tool", "--in=/a", "/b"]
        );
    }

    #[test]
    fn captures_stdout_of_successful_runs() {
        let output = run_tool(&sh("printf hello; printf oops >&2"), None, Duration::from_secs(10))
            .expect("run");
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.stderr, b"oops");
    }

    #[test]
    fn non_zero_exit_reports_stderr() {
        let err = run_tool(&sh("echo broken >&2; exit 3"), None, Duration::from_secs(10))
            .expect_err("failure");
        assert_eq!(err.code(), "external_tool_error");
        let message = err.to_string();
        assert!(message.contains("exit status 3"));
        assert!(message.contains("broken"));
    }

    #[test]
    fn slow_tools_are_killed_at_the_deadline() {
        let err = run_tool(&sh("sleep 5"), None, Duration::from_millis(200)).expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn huge_timeouts_do_not_overflow_the_deadline() {
        let output = run_tool(&sh("printf done"), None, Duration::from_secs(u64::MAX)).expect("run");
        assert_eq!(output.stdout, b"done");
    }

    #[test]
    fn missing_program_is_an_external_tool_error() {
        let err = run_tool(
            &["/definitely/not/a/tool".to_string()],
            None,
            Duration::from_secs(1),
        )
        .expect_err("spawn");
        assert_eq!(err.code(), "external_tool_error");
    }
}
