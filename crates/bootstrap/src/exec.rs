//! The seam between bootstrap logic and the host's command-line tools.
//!
//! Components never spawn processes themselves. They build an [`Invocation`] and hand it to
//! a [`SystemExecutor`], so tests can substitute a recorder and assert the exact commands.

use std::fmt;
use std::io::{self, BufRead, BufReader};

/// A single command line, plus the environment and stdin it needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    /// Arguments carry secrets and must not be logged.
    pub sensitive: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// The full command line, program first. Ignores `sensitive`; don't log it.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sensitive {
            write!(f, "{} <redacted>", self.program)
        } else {
            f.write_str(&self.command_line())
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("failed to run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` {}", describe_exit(.code))]
    Status {
        command: String,
        code: Option<i32>,
        /// Captured output, when the invocation was captured rather than streamed.
        output: String,
    },
}

impl ExecError {
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Status { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_owned(),
    }
}

pub trait SystemExecutor {
    /// Run to completion with output streamed to the terminal.
    fn run(&self, invocation: &Invocation) -> Result<(), ExecError>;

    /// Run to completion and return stdout and stderr interleaved, as a user would see them.
    fn capture(&self, invocation: &Invocation) -> Result<String, ExecError>;

    /// Run to completion and return stdout only. Stderr still goes to the terminal.
    fn read(&self, invocation: &Invocation) -> Result<String, ExecError>;
}

impl<E: SystemExecutor + ?Sized> SystemExecutor for &E {
    fn run(&self, invocation: &Invocation) -> Result<(), ExecError> {
        (**self).run(invocation)
    }
    fn capture(&self, invocation: &Invocation) -> Result<String, ExecError> {
        (**self).capture(invocation)
    }
    fn read(&self, invocation: &Invocation) -> Result<String, ExecError> {
        (**self).read(invocation)
    }
}

/// Call into an executor from async code.
///
/// On a multi-threaded runtime the worker hands its other tasks off while `f` blocks.
/// A current-thread runtime has nowhere to hand them, so `f` just runs inline.
pub fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Spawns real processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostExecutor;

impl HostExecutor {
    fn expression(invocation: &Invocation) -> duct::Expression {
        let mut expr = duct::cmd(&invocation.program, &invocation.args).unchecked();
        for (key, value) in &invocation.env {
            expr = expr.env(key, value);
        }
        if let Some(stdin) = &invocation.stdin {
            expr = expr.stdin_bytes(stdin.clone());
        }
        expr
    }

    fn spawn_error(invocation: &Invocation, source: io::Error) -> ExecError {
        ExecError::Spawn {
            command: invocation.to_string(),
            source,
        }
    }

    fn check(invocation: &Invocation, status: std::process::ExitStatus, output: String) -> Result<String, ExecError> {
        if status.success() {
            Ok(output)
        } else {
            Err(ExecError::Status {
                command: invocation.to_string(),
                code: status.code(),
                output,
            })
        }
    }
}

impl SystemExecutor for HostExecutor {
    fn run(&self, invocation: &Invocation) -> Result<(), ExecError> {
        tracing::debug!("running {invocation}");
        let output = Self::expression(invocation)
            .run()
            .map_err(|e| Self::spawn_error(invocation, e))?;
        Self::check(invocation, output.status, String::new()).map(drop)
    }

    fn capture(&self, invocation: &Invocation) -> Result<String, ExecError> {
        tracing::debug!("running {invocation} (capturing output)");
        let reader = Self::expression(invocation)
            .stderr_to_stdout()
            .reader()
            .map_err(|e| Self::spawn_error(invocation, e))?;
        let mut captured = String::new();
        for line in BufReader::new(&reader).lines() {
            let line = line.map_err(|e| Self::spawn_error(invocation, e))?;
            println!("{line}");
            captured.push_str(&line);
            captured.push('\n');
        }
        // The reader has hit EOF, so duct has already reaped the child.
        match reader.try_wait().map_err(|e| Self::spawn_error(invocation, e))? {
            Some(output) => Self::check(invocation, output.status, captured),
            None => Err(ExecError::Status {
                command: invocation.to_string(),
                code: None,
                output: captured,
            }),
        }
    }

    fn read(&self, invocation: &Invocation) -> Result<String, ExecError> {
        tracing::debug!("running {invocation} (reading stdout)");
        let output = Self::expression(invocation)
            .stdout_capture()
            .run()
            .map_err(|e| Self::spawn_error(invocation, e))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Self::check(invocation, output.status, stdout)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_invocations_are_redacted() {
        let inv = Invocation::new("kubectl")
            .args(["create", "secret", "generic", "hcloud"])
            .arg("--from-literal=token=hunter2")
            .sensitive();
        assert_eq!(inv.to_string(), "kubectl <redacted>");
        assert!(inv.command_line().ends_with("token=hunter2"));
    }

    #[test]
    fn status_error_names_command_and_code() {
        let err = HostExecutor::check(&Invocation::new("swapoff").arg("-a"), exit_status(3), String::new()).unwrap_err();
        assert_eq!(err.to_string(), "`swapoff -a` exited with status 3");
    }

    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn host_executor_reads_stdout() {
        let out = HostExecutor.read(&Invocation::new("echo").arg("noble")).unwrap();
        assert_eq!(out.trim(), "noble");
    }

    #[test]
    fn host_executor_passes_stdin() {
        let out = HostExecutor.read(&Invocation::new("cat").stdin("from stdin")).unwrap();
        assert_eq!(out, "from stdin");
    }

    #[test]
    fn capture_interleaves_stderr() {
        let out = HostExecutor
            .capture(&Invocation::new("sh").args(["-c", "echo out; echo err >&2"]))
            .unwrap();
        assert_eq!(out, "out\nerr\n");
    }

    #[test]
    fn capture_keeps_output_of_failed_command() {
        let err = HostExecutor
            .capture(&Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap_err();
        let ExecError::Status { code, output, .. } = &err else {
            panic!("expected an exit status, got {err:?}");
        };
        assert_eq!(*code, Some(3));
        assert_eq!(output, "out\nerr\n");
        assert_eq!(err.output(), Some("out\nerr\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_call_on_worker_thread() {
        let invocation = Invocation::new("sh").args(["-c", "sleep 0.1; echo done"]);
        let ticker = tokio::spawn(async {
            let mut ticks = 0;
            while ticks < 5 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                ticks += 1;
            }
            ticks
        });
        let out = blocking(|| HostExecutor.read(&invocation)).unwrap();
        assert_eq!(out, "done\n");
        assert_eq!(ticker.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn blocking_call_inline_on_current_thread() {
        let out = blocking(|| HostExecutor.read(&Invocation::new("echo").arg("inline"))).unwrap();
        assert_eq!(out, "inline\n");
    }

    #[test]
    fn host_executor_reports_missing_program() {
        let err = HostExecutor.run(&Invocation::new("ki-definitely-not-installed")).unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }), "{err:?}");
    }
}
