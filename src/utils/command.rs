use async_trait::async_trait;
use itertools::Itertools;
use log::debug;
use std::process::Stdio;
use tokio::process::Command;

/// Which identity a child command runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Keep whatever identity the plugin runs with.
    Inherit,
    /// Drop to the caller's real uid, so scheduler CLIs see the invoking user.
    RealUser,
    /// Run as root (needed by `printjob` and `xpumcli`).
    Root,
}

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `None` when the command could not be spawned or was killed by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// True when the command succeeded and printed something.
    pub fn has_output(&self) -> bool {
        self.success() && !self.stdout.trim().is_empty()
    }

    /// Output for a command that never started.
    pub fn spawn_failure(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason.into(),
            status: None,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion. Never fails: a missing tool shows up as a
    /// `CommandOutput` without an exit status.
    async fn run(&self, argv: &[String], privilege: Privilege) -> CommandOutput;
}

/// Runs commands on the local host through tokio.
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, argv: &[String], privilege: Privilege) -> CommandOutput {
        let Some((program, args)) = argv.split_first() else {
            return CommandOutput::spawn_failure("empty command line");
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        match privilege {
            Privilege::Inherit => {}
            Privilege::RealUser => {
                command.uid(users::get_current_uid());
            }
            Privilege::Root => {
                command.uid(0);
            }
        }

        debug!("Running {}", argv.iter().join(" "));
        match command.output().await {
            Ok(output) => CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                status: output.status.code(),
            },
            Err(err) => CommandOutput::spawn_failure(err.to_string()),
        }
    }
}

/// Build an argv from string literals.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Wrap a shell command line so it runs inside a login shell, where PBS and
/// LSF set up their environment.
pub fn login_shell(line: impl Into<String>) -> Vec<String> {
    vec!["bash".into(), "--login".into(), "-c".into(), line.into()]
}

/// Returns true when `tool` resolves on `PATH`.
pub async fn tool_exists(runner: &dyn CommandRunner, tool: &str) -> bool {
    runner
        .run(&argv(["which", tool]), Privilege::Inherit)
        .await
        .success()
}
