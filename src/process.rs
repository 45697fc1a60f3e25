//! External command execution, optionally rooted at an alternate filesystem root.
//!
//! Every external tool the builder drives goes through a [`CommandRunner`].
//! [`SystemRunner`] is the real implementation; tests substitute their own.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// PATH used for commands executed inside a chroot.
pub const CHROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A single external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    root: Option<PathBuf>,
    env: Vec<(String, String)>,
    capture: bool,
}

impl Invocation {
    /// Create a new invocation of `program`.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            root: None,
            env: Vec::new(),
            capture: false,
        }
    }

    /// Build an invocation from an argument vector (`argv[0]` is the program).
    ///
    /// Returns `None` for an empty vector.
    pub fn from_argv<S: AsRef<str>>(argv: &[S]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program).args(rest))
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Run with the root directory switched to `root` and working directory `/`.
    pub fn rooted(mut self, root: &Path) -> Self {
        self.root = Some(root.to_path_buf());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Capture standard output instead of inheriting it.
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn captures(&self) -> bool {
        self.capture
    }

    /// Full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Space-joined command line, for progress output and error context.
    pub fn command_line(&self) -> String {
        self.argv().join(" ")
    }
}

/// How an external command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    /// Exited non-zero; `-1` when killed by a signal.
    NonZero(i32),
    /// The process could not be started at all.
    LaunchFailed(String),
}

/// Result of running an [`Invocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub outcome: CommandOutcome,
    /// Captured stdout (empty unless the invocation captured it).
    pub stdout: String,
}

impl CommandResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            outcome: CommandOutcome::Success,
            stdout: stdout.into(),
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            outcome: CommandOutcome::NonZero(code),
            stdout: String::new(),
        }
    }

    pub fn launch_failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: CommandOutcome::LaunchFailed(reason.into()),
            stdout: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CommandOutcome::Success
    }

    /// Exit code, or `None` if the process never started.
    pub fn code(&self) -> Option<i32> {
        match self.outcome {
            CommandOutcome::Success => Some(0),
            CommandOutcome::NonZero(code) => Some(code),
            CommandOutcome::LaunchFailed(_) => None,
        }
    }

    /// Human-readable reason for a failure.
    pub fn reason(&self) -> String {
        match &self.outcome {
            CommandOutcome::Success => "success".to_string(),
            CommandOutcome::NonZero(code) => format!("exit code {code}"),
            CommandOutcome::LaunchFailed(reason) => format!("launch failed: {reason}"),
        }
    }
}

/// Executes external programs and waits for them.
///
/// Calls block until the child exits. There is no timeout.
pub trait CommandRunner {
    fn run(&self, invocation: &Invocation) -> CommandResult;
}

/// Runs commands on the host with [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> CommandResult {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.stdout(if invocation.capture {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let root = match &invocation.root {
            Some(root) => match CString::new(root.as_os_str().as_bytes()) {
                Ok(root) => Some(root),
                Err(e) => return CommandResult::launch_failed(format!("invalid root path: {e}")),
            },
            None => None,
        };
        if root.is_some() {
            cmd.env("PATH", CHROOT_PATH);
            cmd.current_dir("/");
        }

        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                if let Some(ref root) = root {
                    if libc::chroot(root.as_ptr()) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::chdir(c"/".as_ptr()) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let output = match cmd.spawn().and_then(|child| child.wait_with_output()) {
            Ok(output) => output,
            Err(e) => return CommandResult::launch_failed(e.to_string()),
        };

        CommandResult {
            outcome: match output.status.code() {
                Some(0) => CommandOutcome::Success,
                Some(code) => CommandOutcome::NonZero(code),
                None => CommandOutcome::NonZero(-1),
            },
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        }
    }
}
