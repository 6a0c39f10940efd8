//! System health checks for bitbuckup
//!
//! Preflight checks behind the `doctor` command. Nothing here talks to the
//! network; credentials are only checked for completeness.

use crate::git::GitCli;
use crate::Config;
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Client id, secret and account list present
    pub credentials: CheckResult,
    /// Work directory status
    pub work_dir: CheckResult,
    /// SSH configuration status (warning only, not required)
    pub ssh: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git(&GitCli::new(&config.git.program, config.git_timeout())),
            credentials: Self::check_credentials(config),
            work_dir: Self::check_work_dir(Path::new(&config.work_directory)),
            ssh: Self::check_ssh(),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.git.passed && self.credentials.passed && self.work_dir.passed
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        [&self.git, &self.credentials, &self.work_dir, &self.ssh]
            .into_iter()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        [&self.git, &self.credentials, &self.work_dir, &self.ssh]
            .into_iter()
            .filter(|r| r.is_warning)
            .collect()
    }

    fn check_git(git: &GitCli) -> CheckResult {
        match git.version() {
            Some(version) => CheckResult::ok_with_details("Git installed", version),
            None => CheckResult::error_with_details(
                format!("Git not found ({})", git.program()),
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    fn check_credentials(config: &Config) -> CheckResult {
        match config.credentials() {
            Ok(credentials) => CheckResult::ok_with_details(
                "Credentials configured",
                format!("Accounts: {}", credentials.accounts.join(", ")),
            ),
            Err(e) => CheckResult::error_with_details(
                "Credentials incomplete",
                format!("{}\nSet them in config.yml, the environment or a .env file", e),
            ),
        }
    }

    /// The work directory must exist and be writable, or be creatable
    fn check_work_dir(path: &Path) -> CheckResult {
        let shown = path.display().to_string();

        if path.is_dir() {
            let metadata = std::fs::metadata(path);
            return match metadata {
                Ok(m) if m.permissions().readonly() => {
                    CheckResult::error_with_details("Work directory is read-only", shown)
                }
                Ok(_) => CheckResult::ok_with_details("Work directory exists", shown),
                Err(e) => CheckResult::error_with_details(
                    "Work directory is not accessible",
                    format!("{}: {}", shown, e),
                ),
            };
        }

        if path.exists() {
            return CheckResult::error_with_details("Work directory is not a directory", shown);
        }

        let creatable = path
            .ancestors()
            .skip(1)
            .find(|ancestor| ancestor.as_os_str().is_empty() || ancestor.exists())
            .map(|ancestor| ancestor.as_os_str().is_empty() || ancestor.is_dir())
            .unwrap_or(false);

        if creatable {
            CheckResult::warning_with_details(
                "Work directory will be created",
                shown,
            )
        } else {
            CheckResult::error_with_details(
                "Work directory cannot be created",
                format!("No parent directory of {} exists", shown),
            )
        }
    }

    /// Check SSH configuration (warning only)
    fn check_ssh() -> CheckResult {
        let ssh_dir = dirs::home_dir().unwrap_or_default().join(".ssh");
        if !ssh_dir.exists() {
            return CheckResult::warning_with_details(
                "~/.ssh directory not found",
                "Cloning over SSH may not work. Run: ssh-keygen -t ed25519",
            );
        }

        let ssh_keys = ["id_rsa", "id_ed25519", "id_ecdsa"];
        let found_keys: Vec<_> = ssh_keys
            .iter()
            .filter(|key| ssh_dir.join(key).exists())
            .copied()
            .collect();

        if found_keys.is_empty() {
            CheckResult::warning_with_details(
                "No SSH keys found",
                "Add a key to your Bitbucket account: ssh-keygen -t ed25519",
            )
        } else {
            CheckResult::ok_with_details("SSH keys found", found_keys.join(", "))
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Git Installation", &self.git),
            ("Bitbucket Credentials", &self.credentials),
            ("Work Directory", &self.work_dir),
            ("SSH Configuration", &self.ssh),
        ]
    }
}
