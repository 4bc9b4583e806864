// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote command execution over `ssh`.
//!
//! Every call spawns a fresh `ssh` process and waits for it to exit; no
//! connection is kept open between calls.

use std::{
    io::{self, Write},
    process::{Command, Stdio},
};

use thiserror::Error;
use tracing::{debug, error};

use crate::{config::Credentials, wait::Poller};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to run `{program}` for {host}")]
    Spawn {
        program: &'static str,
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` on {host} was terminated without an exit code")]
    Killed { host: String, command: String },

    #[error(
        "`{command}` on {host} returned {code}\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    CommandFailed {
        host: String,
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

/// The captured result of a remote command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Per-call options for [`RemoteShell::call`].
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Text to write to the remote command's standard input. Supplying input
    /// always disables pseudo-terminal allocation.
    pub input: Option<String>,

    /// Overrides the channel's default pseudo-terminal policy.
    pub tty: Option<bool>,
}

impl CallOptions {
    pub fn with_input(input: impl Into<String>) -> Self {
        Self { input: Some(input.into()), tty: None }
    }

    pub fn with_tty(tty: bool) -> Self {
        Self { input: None, tty: Some(tty) }
    }

    /// Decides whether a pseudo-terminal should be allocated for a call made
    /// on a channel whose default policy is `default_tty`.
    pub fn use_tty(&self, default_tty: bool) -> bool {
        if self.input.is_some() {
            false
        } else {
            self.tty.unwrap_or(default_tty)
        }
    }
}

/// A channel that can run commands on one remote machine.
pub trait RemoteShell {
    /// The name or address of the machine this shell talks to.
    fn host(&self) -> &str;

    /// Runs `args` on the remote machine and returns its exit code and
    /// captured output. A nonzero exit code is not an error here.
    fn call(
        &self,
        args: &[&str],
        opts: CallOptions,
    ) -> Result<CommandOutput, ShellError>;

    /// Like [`RemoteShell::call`], but fails if the remote command returned a
    /// nonzero exit code.
    fn check_output(
        &self,
        args: &[&str],
        opts: CallOptions,
    ) -> Result<CommandOutput, ShellError> {
        let output = self.call(args, opts)?;
        if !output.success() {
            let command = args.join(" ");
            error!(
                host = self.host(),
                %command,
                error_code = output.status,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "remote command failed"
            );
            return Err(ShellError::CommandFailed {
                host: self.host().to_owned(),
                command,
                code: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }
}

impl<T: RemoteShell + ?Sized> RemoteShell for &T {
    fn host(&self) -> &str {
        (**self).host()
    }

    fn call(
        &self,
        args: &[&str],
        opts: CallOptions,
    ) -> Result<CommandOutput, ShellError> {
        (**self).call(args, opts)
    }
}

/// Options shared by every `ssh` and `scp` invocation. Test machines are
/// recycled constantly, so host keys are never recorded or checked.
pub(crate) fn transport_opts(creds: &Credentials, use_tty: bool) -> Vec<String> {
    let mut opts = vec![
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
    ];
    if use_tty {
        opts.push("-tt".to_string());
    }
    opts.push("-i".to_string());
    opts.push(creds.key_path.to_string());
    opts
}

/// A shell on a remote machine reached with `ssh`.
#[derive(Clone, Debug)]
pub struct SecureShell {
    host: String,
    creds: Credentials,
    alloc_tty: bool,
    program: String,
}

impl SecureShell {
    /// Creates a shell into a guest. Guests get a pseudo-terminal unless a
    /// call asks otherwise, since some guest distributions refuse to run
    /// `sudo` without one.
    pub fn guest(host: impl Into<String>, creds: Credentials) -> Self {
        Self {
            host: host.into(),
            creds,
            alloc_tty: true,
            program: "ssh".into(),
        }
    }

    /// Creates a shell into a hypervisor host. Host shells never allocate a
    /// pseudo-terminal by default.
    pub fn host(host: impl Into<String>, creds: Credentials) -> Self {
        Self {
            host: host.into(),
            creds,
            alloc_tty: false,
            program: "ssh".into(),
        }
    }

    /// Runs `program` in place of `ssh`.
    #[cfg(test)]
    fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Builds the full argument vector passed to `ssh` for `args`.
    fn ssh_args(&self, args: &[&str], use_tty: bool) -> Vec<String> {
        let mut argv = transport_opts(&self.creds, use_tty);
        argv.push(format!("{}@{}", self.creds.user, self.host));
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }
}

impl RemoteShell for SecureShell {
    fn host(&self) -> &str {
        &self.host
    }

    fn call(
        &self,
        args: &[&str],
        opts: CallOptions,
    ) -> Result<CommandOutput, ShellError> {
        let use_tty = opts.use_tty(self.alloc_tty);
        let argv = self.ssh_args(args, use_tty);
        debug!(host = %self.host, ?argv, "executing ssh command");

        let spawn_err = |source| ShellError::Spawn {
            program: "ssh",
            host: self.host.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        // Input is written from its own thread while this one drains stdout
        // and stderr, so a command that echoes a large input back can't
        // leave both sides blocked on full pipes. Dropping the handle once
        // the input is written closes the remote side's stdin so commands
        // like `cat >> file` terminate.
        let stdin = child.stdin.take();
        let input = opts.input;
        let output = std::thread::scope(|s| {
            let writer = s.spawn(move || match (stdin, input) {
                (Some(mut stdin), Some(input)) => {
                    match stdin.write_all(input.as_bytes()) {
                        // The command exited without reading all of it.
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                            Ok(())
                        }
                        result => result,
                    }
                }
                _ => Ok(()),
            });

            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            written.and(output)
        })
        .map_err(spawn_err)?;

        let Some(status) = output.status.code() else {
            return Err(ShellError::Killed {
                host: self.host.clone(),
                command: args.join(" "),
            });
        };

        let output = CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(host = %self.host, status, "ssh command finished");
        Ok(output)
    }
}

/// A shell that runs every command with `sudo`.
#[derive(Clone, Debug)]
pub struct RootShell<S>(pub S);

impl<S: RemoteShell> RemoteShell for RootShell<S> {
    fn host(&self) -> &str {
        self.0.host()
    }

    fn call(
        &self,
        args: &[&str],
        opts: CallOptions,
    ) -> Result<CommandOutput, ShellError> {
        let mut elevated = Vec::with_capacity(args.len() + 1);
        elevated.push("sudo");
        elevated.extend_from_slice(args);
        self.0.call(&elevated, opts)
    }
}

/// Waits until `shell` can run a trivial command on its host.
pub fn wait_for_ssh<S: RemoteShell>(
    poller: &Poller,
    shell: &S,
) -> Result<(), crate::wait::WaitError<ShellError>> {
    poller.wait_for(&format!("ssh {} to respond", shell.host()), || {
        shell.call(&["true"], CallOptions::default()).map(|out| out.success())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedShell;

    fn creds() -> Credentials {
        Credentials { user: "ci".to_string(), key_path: "/keys/id_rsa".into() }
    }

    #[test]
    fn input_disables_tty() {
        assert!(!CallOptions::with_input("x").use_tty(true));
        assert!(CallOptions::default().use_tty(true));
        assert!(!CallOptions::default().use_tty(false));
        assert!(CallOptions::with_tty(true).use_tty(false));
        assert!(!CallOptions::with_tty(false).use_tty(true));

        let both = CallOptions { input: Some("x".into()), tty: Some(true) };
        assert!(!both.use_tty(true));
    }

    #[test]
    fn ssh_args_include_fixed_options() {
        let shell = SecureShell::guest("10.0.0.5", creds());
        let argv = shell.ssh_args(&["uname", "-a"], true);
        assert_eq!(
            argv,
            vec![
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "StrictHostKeyChecking=no",
                "-tt",
                "-i",
                "/keys/id_rsa",
                "ci@10.0.0.5",
                "uname",
                "-a",
            ]
        );

        let argv = shell.ssh_args(&["true"], false);
        assert!(!argv.iter().any(|a| a == "-tt"));
    }

    #[test]
    fn host_and_guest_shells_have_different_tty_defaults() {
        assert!(SecureShell::guest("g", creds()).alloc_tty);
        assert!(!SecureShell::host("h", creds()).alloc_tty);
    }

    #[test]
    fn root_shell_prefixes_sudo() {
        let inner = ScriptedShell::new("node-a");
        inner.push_ok("");
        let root = RootShell(&inner);
        root.call(&["cat", "/proc/meminfo"], CallOptions::default()).unwrap();
        assert_eq!(inner.commands(), vec!["sudo cat /proc/meminfo"]);
    }

    #[test]
    fn check_output_reports_failures() {
        let shell = ScriptedShell::new("node-a");
        shell.push(3, "partial", "boom");
        let err = shell
            .check_output(&["false"], CallOptions::default())
            .unwrap_err();
        match err {
            ShellError::CommandFailed { code, stdout, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    /// Installs an executable script named `ssh` in `dir` that ignores its
    /// arguments.
    #[cfg(unix)]
    fn fake_ssh(dir: &std::path::Path, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let program = dir.join("ssh");
        std::fs::write(&program, script).unwrap();
        std::fs::set_permissions(
            &program,
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        program.to_str().unwrap().to_owned()
    }

    #[cfg(unix)]
    #[test]
    fn large_input_is_written_while_output_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let program =
            fake_ssh(dir.path(), "#!/bin/sh\ncat\necho err >&2\nexit 3\n");
        let shell = SecureShell::host("node-a", creds()).with_program(program);

        // Several times the size of a pipe buffer.
        let input = "x".repeat(256 * 1024);
        let output = shell
            .call(&["cat"], CallOptions::with_input(input.clone()))
            .unwrap();

        assert_eq!(output.status, 3);
        assert_eq!(output.stdout.len(), input.len());
        assert!(output.stdout == input);
        assert_eq!(output.stderr, "err\n");
    }

    #[cfg(unix)]
    #[test]
    fn command_exiting_before_reading_input_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ssh(dir.path(), "#!/bin/sh\necho done\nexit 0\n");
        let shell = SecureShell::host("node-a", creds()).with_program(program);

        let output = shell
            .check_output(
                &["true"],
                CallOptions::with_input("y".repeat(256 * 1024)),
            )
            .unwrap();
        assert_eq!(output.stdout, "done\n");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let shell = SecureShell::host("node-a", creds())
            .with_program("/nonexistent/vms-tests/ssh");
        assert!(matches!(
            shell.call(&["true"], CallOptions::default()),
            Err(ShellError::Spawn { program: "ssh", .. })
        ));
    }
}
