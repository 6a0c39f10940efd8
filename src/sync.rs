//! Sync Engine - Orchestrates the mirror run
//!
//! Authenticates once, then for every configured account enumerates its
//! repositories and brings each one up to date: clone when the working copy is
//! missing, then fetch all branches. Accounts and repositories are processed
//! strictly one after another. Cancellation is checked before each account and
//! before each repository; work already started is allowed to finish.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bitbucket::{AccessToken, BitbucketClient};
use crate::config::{Config, Credentials};
use crate::discovery::{Enumerator, Manifest, RepositoryRecord};
use crate::error::{BackupError, EXIT_PARTIAL};
use crate::git::{has_git_metadata, GitBackend, GitOutcome};
use crate::manifest::ManifestStore;
use crate::progress::{Progress, ProgressEvent};

/// Which part of a repository's sync failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Creating the working copy directory
    Prepare,
    Clone,
    FetchBranches,
}

/// Result of syncing one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    /// Freshly cloned, then all branches fetched
    Cloned { slug: String, path: PathBuf },
    /// Existing working copy, all branches fetched
    Updated { slug: String, path: PathBuf },
    /// A step failed; the run moved on to the next repository
    Failed {
        slug: String,
        path: PathBuf,
        stage: SyncStage,
        error: String,
    },
}

impl SyncResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncResult::Failed { .. })
    }
}

/// Results for one account
#[derive(Debug, Clone, Default)]
pub struct AccountSummary {
    pub account: String,
    pub results: Vec<SyncResult>,
    /// Cancellation stopped the account before every repository was started
    pub aborted: bool,
}

impl AccountSummary {
    fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            ..Default::default()
        }
    }

    pub fn cloned(&self) -> usize {
        self.count(|r| matches!(r, SyncResult::Cloned { .. }))
    }

    pub fn updated(&self) -> usize {
        self.count(|r| matches!(r, SyncResult::Updated { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(SyncResult::is_failure)
    }

    fn count(&self, predicate: impl Fn(&SyncResult) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(r)).count()
    }
}

/// Results of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub accounts: Vec<AccountSummary>,
    /// Accounts whose enumeration failed, with the error
    pub failed_accounts: Vec<(String, String)>,
    pub aborted: bool,
    pub duration: Duration,
}

impl RunSummary {
    pub fn total_repositories(&self) -> usize {
        self.accounts.iter().map(|a| a.results.len()).sum()
    }

    pub fn failed_repositories(&self) -> usize {
        self.accounts.iter().map(AccountSummary::failed).sum()
    }

    pub fn exit_code(&self) -> u8 {
        outcome_exit_code(&self.failed_accounts, self.aborted)
    }
}

/// Manifests written by a listing-only run
#[derive(Debug, Clone, Default)]
pub struct ListSummary {
    pub manifests: Vec<(String, Manifest)>,
    pub failed_accounts: Vec<(String, String)>,
    pub aborted: bool,
}

impl ListSummary {
    pub fn exit_code(&self) -> u8 {
        outcome_exit_code(&self.failed_accounts, self.aborted)
    }
}

/// 0 when interrupted or when every account was listed, 2 otherwise
fn outcome_exit_code(failed_accounts: &[(String, String)], aborted: bool) -> u8 {
    if aborted || failed_accounts.is_empty() {
        0
    } else {
        EXIT_PARTIAL
    }
}

/// The main sync engine that orchestrates repository synchronization
pub struct SyncEngine<G> {
    client: BitbucketClient,
    store: ManifestStore,
    git: G,
    repos_root: PathBuf,
    ssh_host: String,
    cancel: CancellationToken,
}

impl<G: GitBackend> SyncEngine<G> {
    /// Create a new sync engine with the given configuration
    pub fn new(config: &Config, git: G, cancel: CancellationToken) -> Result<Self> {
        let client = BitbucketClient::new(&config.bitbucket, config.request_timeout())?;
        let repos_root = absolute(&config.repos_root())?;

        Ok(Self {
            client,
            store: ManifestStore::new(&repos_root),
            git,
            repos_root,
            ssh_host: config.bitbucket.ssh_host.clone(),
            cancel,
        })
    }

    pub fn repos_root(&self) -> &Path {
        &self.repos_root
    }

    pub fn enumerator(&self) -> Enumerator<'_> {
        Enumerator::new(&self.client, &self.store, &self.ssh_host)
    }

    /// Exchange the client credentials for an access token
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
        progress: &dyn Progress,
    ) -> Result<AccessToken> {
        progress.report(ProgressEvent::Authenticating);

        match self.client.authenticate(credentials).await {
            Ok(token) => {
                progress.report(ProgressEvent::Authenticated);
                Ok(token)
            }
            Err(e) => {
                if let BackupError::AccessDenied { reason } = &e {
                    progress.report(ProgressEvent::AccessDenied {
                        reason: reason.clone(),
                    });
                }
                Err(e.into())
            }
        }
    }

    /// Run a complete mirror: authenticate, then enumerate and sync every account
    pub async fn run(&self, credentials: &Credentials, progress: &dyn Progress) -> Result<RunSummary> {
        let start_time = Instant::now();

        let token = self.authenticate(credentials, progress).await?;

        let mut summary = RunSummary::default();

        for account in &credentials.accounts {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, not starting account {}", account);
                summary.aborted = true;
                progress.report(ProgressEvent::Aborted);
                break;
            }

            let manifest = match self.enumerator().enumerate(account, &token, progress).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    error!("Enumeration failed for {}: {:?}", account, e);
                    progress.report(ProgressEvent::EnumerationFailed {
                        account: account.clone(),
                        error: format!("{:#}", e),
                    });
                    summary.failed_accounts.push((account.clone(), format!("{:#}", e)));
                    continue;
                }
            };

            let account_summary = self.sync_account(account, &manifest, progress).await?;
            summary.aborted |= account_summary.aborted;
            summary.accounts.push(account_summary);

            if summary.aborted {
                break;
            }
        }

        summary.duration = start_time.elapsed();

        info!(
            "Run completed in {:.2}s: {} accounts, {} repositories, {} failed, {} accounts not listed",
            summary.duration.as_secs_f64(),
            summary.accounts.len(),
            summary.total_repositories(),
            summary.failed_repositories(),
            summary.failed_accounts.len()
        );

        Ok(summary)
    }

    /// Authenticate and write every account's manifest without touching git
    pub async fn list(&self, credentials: &Credentials, progress: &dyn Progress) -> Result<ListSummary> {
        let token = self.authenticate(credentials, progress).await?;

        let mut summary = ListSummary::default();

        for account in &credentials.accounts {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, not listing {}", account);
                summary.aborted = true;
                progress.report(ProgressEvent::Aborted);
                break;
            }

            match self.enumerator().enumerate(account, &token, progress).await {
                Ok(manifest) => summary.manifests.push((account.clone(), manifest)),
                Err(e) => {
                    error!("Enumeration failed for {}: {:?}", account, e);
                    progress.report(ProgressEvent::EnumerationFailed {
                        account: account.clone(),
                        error: format!("{:#}", e),
                    });
                    summary.failed_accounts.push((account.clone(), format!("{:#}", e)));
                }
            }
        }

        Ok(summary)
    }

    /// Clone or update every repository of `manifest`, in order
    pub async fn sync_account(
        &self,
        account: &str,
        manifest: &[RepositoryRecord],
        progress: &dyn Progress,
    ) -> Result<AccountSummary> {
        let mut summary = AccountSummary::new(account);

        if manifest.is_empty() {
            progress.report(ProgressEvent::SyncFinished {
                account: account.to_string(),
                repositories: 0,
            });
            return Ok(summary);
        }

        progress.report(ProgressEvent::SyncStarted {
            account: account.to_string(),
        });

        let account_dir = self.repos_root.join(account);
        tokio::fs::create_dir_all(&account_dir)
            .await
            .map_err(|source| BackupError::Filesystem {
                path: account_dir.clone(),
                source,
            })?;

        for record in manifest {
            if self.cancel.is_cancelled() {
                info!(
                    "Cancellation requested, stopping {} before {}",
                    account, record.slug
                );
                summary.aborted = true;
                progress.report(ProgressEvent::Aborted);
                break;
            }

            let result = self.sync_repository(&account_dir, record, progress).await;
            if let SyncResult::Failed { slug, stage, error, .. } = &result {
                warn!("{}/{} failed during {:?}: {}", account, slug, stage, error);
                progress.report(ProgressEvent::RepositoryFailed {
                    slug: slug.clone(),
                    error: error.clone(),
                });
            }
            summary.results.push(result);
        }

        info!(
            "{}: {} cloned, {} updated, {} failed",
            account,
            summary.cloned(),
            summary.updated(),
            summary.failed()
        );

        progress.report(ProgressEvent::SyncFinished {
            account: account.to_string(),
            repositories: summary.results.len(),
        });

        Ok(summary)
    }

    async fn sync_repository(
        &self,
        account_dir: &Path,
        record: &RepositoryRecord,
        progress: &dyn Progress,
    ) -> SyncResult {
        let path = account_dir.join(&record.slug);
        let slug = record.slug.clone();
        let failed = |stage: SyncStage, error: String| SyncResult::Failed {
            slug: record.slug.clone(),
            path: path.clone(),
            stage,
            error,
        };

        progress.report(ProgressEvent::RepositoryStarted {
            name: record.name.clone(),
            slug: slug.clone(),
        });

        if let Err(e) = tokio::fs::create_dir_all(&path).await {
            return failed(
                SyncStage::Prepare,
                format!("Failed to create {}: {}", path.display(), e),
            );
        }

        let mut cloned = false;
        if !has_git_metadata(&path) {
            info!("Cloning {} into {}", record.remote_url, path.display());
            progress.report(ProgressEvent::Cloning { slug: slug.clone() });

            match self.git.clone_into(&record.remote_url, &path).await {
                GitOutcome::Success => {
                    cloned = true;
                    progress.report(ProgressEvent::Cloned { slug: slug.clone() });
                }
                // Nothing to fetch into without a working copy
                GitOutcome::Failed { diagnostics, .. } => {
                    return failed(SyncStage::Clone, diagnostics);
                }
            }
        }

        progress.report(ProgressEvent::FetchingBranches { slug: slug.clone() });
        match self.git.fetch_all_branches(&path).await {
            GitOutcome::Success => {
                progress.report(ProgressEvent::BranchesFetched { slug: slug.clone() });
                let path = path.clone();
                if cloned {
                    SyncResult::Cloned { slug, path }
                } else {
                    SyncResult::Updated { slug, path }
                }
            }
            GitOutcome::Failed { diagnostics, .. } => failed(SyncStage::FetchBranches, diagnostics),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Ok(cwd.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MockGitBackend;
    use crate::progress::RecordingProgress;
    use assert_matches::assert_matches;
    use mockall::Sequence;
    use tempfile::TempDir;

    fn record(slug: &str) -> RepositoryRecord {
        RepositoryRecord {
            name: slug.to_uppercase(),
            uuid: format!("{{{}}}", slug),
            slug: slug.to_string(),
            project: None,
            remote_url: format!("git@bitbucket.org:acme/{}.git", slug),
        }
    }

    fn engine(temp: &TempDir, git: MockGitBackend, cancel: CancellationToken) -> SyncEngine<MockGitBackend> {
        let mut config = Config::default();
        config.work_directory = temp.path().to_string_lossy().into_owned();
        SyncEngine::new(&config, git, cancel).expect("engine")
    }

    fn make_git_dir(dir: &Path) -> GitOutcome {
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        GitOutcome::Success
    }

    #[test]
    fn test_run_summary_counts_and_exit_code() {
        let summary = RunSummary {
            accounts: vec![AccountSummary {
                account: "acme".to_string(),
                results: vec![
                    SyncResult::Cloned {
                        slug: "a".to_string(),
                        path: "/tmp/a".into(),
                    },
                    SyncResult::Updated {
                        slug: "b".to_string(),
                        path: "/tmp/b".into(),
                    },
                    SyncResult::Failed {
                        slug: "c".to_string(),
                        path: "/tmp/c".into(),
                        stage: SyncStage::Clone,
                        error: "Permission denied (publickey)".to_string(),
                    },
                ],
                aborted: false,
            }],
            ..Default::default()
        };

        assert_eq!(summary.total_repositories(), 3);
        assert_eq!(summary.failed_repositories(), 1);
        assert_eq!(summary.accounts[0].cloned(), 1);
        assert_eq!(summary.accounts[0].updated(), 1);
        assert_eq!(summary.exit_code(), 0);

        let partial = RunSummary {
            failed_accounts: vec![("widgets".to_string(), "HTTP 500".to_string())],
            ..Default::default()
        };
        assert_eq!(partial.exit_code(), EXIT_PARTIAL);
    }

    #[test]
    fn test_interrupted_run_exits_zero_even_after_failed_account() {
        let interrupted = RunSummary {
            failed_accounts: vec![("widgets".to_string(), "HTTP 500".to_string())],
            aborted: true,
            ..Default::default()
        };
        assert_eq!(interrupted.exit_code(), 0);

        let listing = ListSummary {
            failed_accounts: vec![("widgets".to_string(), "HTTP 500".to_string())],
            aborted: true,
            ..Default::default()
        };
        assert_eq!(listing.exit_code(), 0);
        assert_eq!(
            ListSummary {
                aborted: false,
                ..listing
            }
            .exit_code(),
            EXIT_PARTIAL
        );
    }

    #[tokio::test]
    async fn test_empty_manifest_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let git = MockGitBackend::new();
        let engine = engine(&temp, git, CancellationToken::new());
        let progress = RecordingProgress::new();

        let summary = engine.sync_account("acme", &[], &progress).await.unwrap();

        assert!(summary.results.is_empty());
        assert!(!engine.repos_root().join("acme").exists());
        assert_eq!(
            progress.events(),
            vec![ProgressEvent::SyncFinished {
                account: "acme".to_string(),
                repositories: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_clones_into_slug_directory_then_fetches() {
        let temp = TempDir::new().unwrap();
        let expected_dir = temp.path().join("repos").join("acme").join("a");

        let mut git = MockGitBackend::new();
        let mut seq = Sequence::new();
        let clone_dir = expected_dir.clone();
        git.expect_clone_into()
            .withf(move |url, dir| url == "git@bitbucket.org:acme/a.git" && dir == clone_dir.as_path())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, dir| make_git_dir(dir));
        let fetch_dir = expected_dir.clone();
        git.expect_fetch_all_branches()
            .withf(move |dir| dir == fetch_dir.as_path())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| GitOutcome::Success);

        let engine = engine(&temp, git, CancellationToken::new());
        let progress = RecordingProgress::new();
        let summary = engine
            .sync_account("acme", &[record("a")], &progress)
            .await
            .unwrap();

        assert_eq!(
            summary.results,
            vec![SyncResult::Cloned {
                slug: "a".to_string(),
                path: expected_dir
            }]
        );
    }

    #[tokio::test]
    async fn test_existing_working_copy_is_only_fetched() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("repos/acme/a/.git")).unwrap();

        let mut git = MockGitBackend::new();
        git.expect_clone_into().never();
        git.expect_fetch_all_branches()
            .times(1)
            .returning(|_| GitOutcome::Success);

        let engine = engine(&temp, git, CancellationToken::new());
        let summary = engine
            .sync_account("acme", &[record("a")], &RecordingProgress::new())
            .await
            .unwrap();

        assert_matches!(summary.results.as_slice(), [SyncResult::Updated { .. }]);
    }

    #[tokio::test]
    async fn test_fetch_failure_does_not_stop_the_loop() {
        let temp = TempDir::new().unwrap();

        let mut git = MockGitBackend::new();
        git.expect_clone_into()
            .times(2)
            .returning(|_, dir| make_git_dir(dir));
        git.expect_fetch_all_branches()
            .times(2)
            .returning(|dir: &Path| {
                if dir.ends_with("a") {
                    GitOutcome::Failed {
                        code: Some(128),
                        diagnostics: "fatal: could not read from remote repository".to_string(),
                    }
                } else {
                    GitOutcome::Success
                }
            });

        let engine = engine(&temp, git, CancellationToken::new());
        let progress = RecordingProgress::new();
        let summary = engine
            .sync_account("acme", &[record("a"), record("b")], &progress)
            .await
            .unwrap();

        assert_matches!(
            &summary.results[0],
            SyncResult::Failed { stage: SyncStage::FetchBranches, .. }
        );
        assert_matches!(&summary.results[1], SyncResult::Cloned { slug, .. } if slug == "b");
        assert!(progress.events().contains(&ProgressEvent::RepositoryFailed {
            slug: "a".to_string(),
            error: "fatal: could not read from remote repository".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_clone_failure_skips_fetch_for_that_repository() {
        let temp = TempDir::new().unwrap();

        let mut git = MockGitBackend::new();
        git.expect_clone_into()
            .times(2)
            .returning(|url: &str, dir: &Path| {
                if url.ends_with("/a.git") {
                    GitOutcome::Failed {
                        code: Some(128),
                        diagnostics: "Permission denied (publickey)".to_string(),
                    }
                } else {
                    make_git_dir(dir)
                }
            });
        git.expect_fetch_all_branches()
            .withf(|dir| dir.ends_with("b"))
            .times(1)
            .returning(|_| GitOutcome::Success);

        let engine = engine(&temp, git, CancellationToken::new());
        let summary = engine
            .sync_account("acme", &[record("a"), record("b")], &RecordingProgress::new())
            .await
            .unwrap();

        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.cloned(), 1);
        assert_matches!(
            &summary.results[0],
            SyncResult::Failed { stage: SyncStage::Clone, .. }
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut git = MockGitBackend::new();
        git.expect_clone_into().never();
        git.expect_fetch_all_branches().never();

        let engine = engine(&temp, git, cancel);
        let progress = RecordingProgress::new();
        let summary = engine
            .sync_account("acme", &[record("a"), record("b")], &progress)
            .await
            .unwrap();

        assert!(summary.aborted);
        assert!(summary.results.is_empty());
        assert!(progress.events().contains(&ProgressEvent::Aborted));
    }

    #[tokio::test]
    async fn test_cancel_during_repository_lets_it_finish_then_stops() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let mut git = MockGitBackend::new();
        git.expect_clone_into()
            .times(1)
            .returning(|_, dir| make_git_dir(dir));
        let trigger = cancel.clone();
        git.expect_fetch_all_branches()
            .times(1)
            .returning(move |_| {
                trigger.cancel();
                GitOutcome::Success
            });

        let engine = engine(&temp, git, cancel);
        let summary = engine
            .sync_account(
                "acme",
                &[record("a"), record("b"), record("c")],
                &RecordingProgress::new(),
            )
            .await
            .unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.results.len(), 1);
        assert_matches!(&summary.results[0], SyncResult::Cloned { slug, .. } if slug == "a");
        assert!(!temp.path().join("repos/acme/b").exists());
    }

    #[test]
    fn test_relative_work_directory_becomes_absolute() {
        let mut config = Config::default();
        config.work_directory = "backup".to_string();
        let engine = SyncEngine::new(&config, MockGitBackend::new(), CancellationToken::new())
            .unwrap();
        assert!(engine.repos_root().is_absolute());
        assert!(engine.repos_root().ends_with("backup/repos"));
    }
}
