//! Command execution for adapters: local processes now, with the seam
//! for remote shells, and a dry-run variant that only logs.

use std::io::{Read, Write};
use std::process::{Command, Stdio};

use dbkp_tools::error::{Error, Result};

/// Executes engine tooling with streamed stdio.
pub trait Runner: Send + Sync {
    /// Run `program`, streaming its stdout into `stdout`.
    fn run(&self, program: &str, args: &[String], stdout: &mut dyn Write) -> Result<()>;

    /// Run `program`, feeding `stdin` and streaming stdout.
    fn run_with_io(
        &self,
        program: &str,
        args: &[String],
        stdin: &mut (dyn Read + Send),
        stdout: &mut dyn Write,
    ) -> Result<()>;
}

/// Runs programs as local child processes.
#[derive(Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }

    fn spawn(
        &self,
        program: &str,
        args: &[String],
        with_stdin: bool,
    ) -> Result<std::process::Child> {
        log::debug!("running {} {}", program, scrub_args(args).join(" "));
        Command::new(program)
            .args(args)
            .stdin(if with_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::Dependency(format!("required tool '{program}' not found in PATH"))
                }
                _ => Error::from_io(err),
            })
    }

    fn finish(program: &str, mut child: std::process::Child, stderr_text: String) -> Result<()> {
        let status = child.wait()?;
        if !status.success() {
            let stderr_text = if stderr_text.trim().is_empty() {
                format!("exited with {status}")
            } else {
                stderr_text
            };
            return Err(super::classify_tool_failure(program, &stderr_text));
        }
        Ok(())
    }
}

impl Runner for LocalRunner {
    fn run(&self, program: &str, args: &[String], stdout: &mut dyn Write) -> Result<()> {
        let mut child = self.spawn(program, args, false)?;
        let mut child_stdout = child.stdout.take().expect("stdout is piped");
        let mut child_stderr = child.stderr.take().expect("stderr is piped");

        let stderr_text = std::thread::scope(|scope| -> Result<String> {
            let stderr_task = scope.spawn(move || -> String {
                let mut text = String::new();
                let _ = child_stderr.read_to_string(&mut text);
                text
            });

            std::io::copy(&mut child_stdout, stdout).map_err(Error::from_io)?;
            Ok(stderr_task.join().expect("stderr reader panicked"))
        })?;

        Self::finish(program, child, stderr_text)
    }

    fn run_with_io(
        &self,
        program: &str,
        args: &[String],
        stdin: &mut (dyn Read + Send),
        stdout: &mut dyn Write,
    ) -> Result<()> {
        let mut child = self.spawn(program, args, true)?;
        let mut child_stdin = child.stdin.take().expect("stdin is piped");
        let mut child_stdout = child.stdout.take().expect("stdout is piped");
        let mut child_stderr = child.stderr.take().expect("stderr is piped");

        let (stdin_result, stderr_text) =
            std::thread::scope(|scope| -> Result<(Result<()>, String)> {
                let stderr_task = scope.spawn(move || -> String {
                    let mut text = String::new();
                    let _ = child_stderr.read_to_string(&mut text);
                    text
                });
                let stdin_task = scope.spawn(move || -> Result<()> {
                    std::io::copy(stdin, &mut child_stdin).map_err(Error::from_io)?;
                    // dropping child_stdin closes the pipe
                    Ok(())
                });

                std::io::copy(&mut child_stdout, stdout).map_err(Error::from_io)?;
                Ok((
                    stdin_task.join().expect("stdin feeder panicked"),
                    stderr_task.join().expect("stderr reader panicked"),
                ))
            })?;

        let status_result = Self::finish(program, child, stderr_text);

        // a failed tool closes its stdin early and breaks the feeder;
        // the tool's own error is the meaningful one
        match status_result {
            Ok(()) => stdin_result,
            Err(err) => Err(err),
        }
    }
}

/// Logs the commands it would run and executes nothing.
#[derive(Default)]
pub struct DryRunRunner;

impl DryRunRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for DryRunRunner {
    fn run(&self, program: &str, args: &[String], _stdout: &mut dyn Write) -> Result<()> {
        log::info!("dry-run: {} {}", program, scrub_args(args).join(" "));
        Ok(())
    }

    fn run_with_io(
        &self,
        program: &str,
        args: &[String],
        _stdin: &mut (dyn Read + Send),
        _stdout: &mut dyn Write,
    ) -> Result<()> {
        log::info!("dry-run: {} {}", program, scrub_args(args).join(" "));
        Ok(())
    }
}

/// Hide passwords when a command line is logged.
fn scrub_args(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            if arg.starts_with("--password=") {
                "--password=********".to_string()
            } else if arg.contains("://") {
                dbkp_tools::uri::scrub_uri(arg)
            } else {
                arg.clone()
            }
        })
        .collect()
}
