use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of a git operation, with diagnostics when it failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOutcome {
    Success,
    Failed {
        /// Exit code, `None` when git did not run or was killed
        code: Option<i32>,
        /// Captured stderr or a description of what went wrong
        diagnostics: String,
    },
}

impl GitOutcome {
    fn failed(code: Option<i32>, diagnostics: impl Into<String>) -> Self {
        GitOutcome::Failed {
            code,
            diagnostics: diagnostics.into(),
        }
    }
}

/// The git capability the orchestrator relies on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Clone `remote_url` into `directory` itself (not a subdirectory)
    async fn clone_into(&self, remote_url: &str, directory: &Path) -> GitOutcome;

    /// Fetch every remote branch and create or fast-forward a local branch for each
    async fn fetch_all_branches(&self, directory: &Path) -> GitOutcome;
}

/// Whether `directory` already holds a repository
pub fn has_git_metadata(directory: &Path) -> bool {
    directory.join(".git").exists()
}

/// Git operations backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    timeout: Duration,
}

/// Captured output of one git command
struct CommandOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl GitCli {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether `git --version` runs
    pub fn is_available(&self) -> bool {
        self.version().is_some()
    }

    /// Output of `git --version`
    pub fn version(&self) -> Option<String> {
        std::process::Command::new(&self.program)
            .arg("--version")
            .output()
            .ok()
            .filter(|output| output.status.success())
            .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, directory: &Path, args: &[&str]) -> Result<CommandOutput, String> {
        debug!("git {} (in {})", args.join(" "), directory.display());

        let mut command = AsyncCommand::new(&self.program);
        command
            .args(args)
            .current_dir(directory)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Never let git discover a repository above the working copy
        if let Some(parent) = directory.parent() {
            let parent = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
            command.env("GIT_CEILING_DIRECTORIES", parent);
        }

        match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Ok(Err(e)) => Err(format!("Failed to execute {}: {}", self.program, e)),
            Err(_) => Err(format!(
                "git {} timed out after {}s",
                args.first().unwrap_or(&""),
                self.timeout.as_secs()
            )),
        }
    }

    /// Run a command and turn a non-zero exit into a failure description
    async fn step(&self, directory: &Path, args: &[&str]) -> Result<CommandOutput, GitOutcome> {
        match self.run(directory, args).await {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => Err(GitOutcome::failed(
                output.code,
                format!("git {}: {}", args.join(" "), output.stderr),
            )),
            Err(message) => Err(GitOutcome::failed(None, message)),
        }
    }

    async fn refs(&self, directory: &Path, prefix: &str) -> Result<Vec<String>, GitOutcome> {
        let output = self
            .step(directory, &["for-each-ref", "--format=%(refname)", prefix])
            .await?;

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix(prefix))
            .filter(|name| !name.is_empty() && *name != "HEAD")
            .map(str::to_string)
            .collect())
    }

    async fn current_branch(&self, directory: &Path) -> Option<String> {
        match self
            .run(directory, &["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await
        {
            Ok(output) if output.success() => Some(output.stdout.trim().to_string()),
            _ => None,
        }
    }

    async fn sync_branches(&self, directory: &Path) -> Result<(), GitOutcome> {
        self.step(directory, &["fetch", "--all", "--prune"]).await?;

        let remote_branches = self.refs(directory, "refs/remotes/origin/").await?;
        let local_branches = self.refs(directory, "refs/heads/").await?;
        let current = self.current_branch(directory).await;

        let mut failures = Vec::new();
        let mut last_code = None;

        for branch in &remote_branches {
            let upstream = format!("origin/{}", branch);

            let result = if !local_branches.contains(branch) {
                self.step(directory, &["branch", "--track", branch, &upstream])
                    .await
            } else if current.as_deref() == Some(branch.as_str()) {
                self.step(directory, &["merge", "--ff-only", &upstream]).await
            } else {
                let refspec = format!("{}:{}", upstream, branch);
                self.step(directory, &["fetch", ".", &refspec]).await
            };

            if let Err(GitOutcome::Failed { code, diagnostics }) = result {
                warn!("{}: {}", directory.display(), diagnostics);
                last_code = code;
                failures.push(diagnostics);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GitOutcome::failed(last_code, failures.join("\n")))
        }
    }
}

#[async_trait]
impl GitBackend for GitCli {
    async fn clone_into(&self, remote_url: &str, directory: &Path) -> GitOutcome {
        match self.step(directory, &["clone", "--", remote_url, "."]).await {
            Ok(_) => GitOutcome::Success,
            Err(outcome) => outcome,
        }
    }

    async fn fetch_all_branches(&self, directory: &Path) -> GitOutcome {
        match self.sync_branches(directory).await {
            Ok(()) => GitOutcome::Success,
            Err(outcome) => outcome,
        }
    }
}
