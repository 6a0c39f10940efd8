//! Repository discovery
//!
//! Walks the paginated `repositories/<account>` listing, keeps the git-backed
//! repositories in API order, reports page progress and persists the result as
//! the account's manifest.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use tracing::{debug, info, warn};

use crate::bitbucket::{AccessToken, BitbucketClient, ListedRepository, ListingPage};
use crate::error::BackupError;
use crate::manifest::ManifestStore;
use crate::progress::{Progress, ProgressEvent};

/// One git repository of an account, as written to the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Display name
    pub name: String,

    /// Platform-assigned identifier
    pub uuid: String,

    /// Filesystem-safe identifier, used as the local directory name
    pub slug: String,

    /// Project name, if the repository belongs to one
    pub project: Option<String>,

    /// SSH clone URL
    #[serde(rename = "url")]
    pub remote_url: String,
}

impl RepositoryRecord {
    /// Build a record from a listing entry
    ///
    /// Non-git repositories yield `None`, as do entries whose slug is not a
    /// single path component: the slug names the working copy directory.
    pub fn from_listing(repo: &ListedRepository, ssh_host: &str) -> Option<Self> {
        if !repo.is_git() {
            return None;
        }

        if !is_directory_name(&repo.slug) {
            warn!(
                "Skipping {:?} ({}): slug {:?} is not a usable directory name",
                repo.name, repo.full_name, repo.slug
            );
            return None;
        }

        Some(Self {
            name: repo.name.clone(),
            uuid: repo.uuid.clone(),
            slug: repo.slug.clone(),
            project: repo.project.as_ref().and_then(|p| p.name.clone()),
            remote_url: ssh_clone_url(ssh_host, &repo.full_name),
        })
    }
}

/// Exactly one normal path component, so joining it stays inside the parent
fn is_directory_name(slug: &str) -> bool {
    let mut components = Path::new(slug).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !slug.contains(['/', '\\'])
}

/// Ordered repositories of one account
pub type Manifest = Vec<RepositoryRecord>;

/// `git@<host>:<full_name>.git`
pub fn ssh_clone_url(host: &str, full_name: &str) -> String {
    format!("git@{}:{}.git", host, full_name)
}

/// Opaque link to the next listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(String);

impl PageCursor {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cursor of the page following `page`, `None` on the last page
    pub fn after(page: &ListingPage) -> Option<Self> {
        page.next
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(Self::new)
    }
}

/// Enumerates the repositories of one account at a time
pub struct Enumerator<'a> {
    client: &'a BitbucketClient,
    store: &'a ManifestStore,
    ssh_host: &'a str,
}

impl<'a> Enumerator<'a> {
    pub fn new(client: &'a BitbucketClient, store: &'a ManifestStore, ssh_host: &'a str) -> Self {
        Self {
            client,
            store,
            ssh_host,
        }
    }

    /// List every git repository of `account` and save the manifest
    ///
    /// An account whose first page reports no repositories (or no pagination
    /// fields) yields an empty manifest and leaves any existing manifest file
    /// untouched. A failure on any page aborts the enumeration before anything
    /// is written.
    pub async fn enumerate(
        &self,
        account: &str,
        token: &AccessToken,
        progress: &dyn Progress,
    ) -> Result<Manifest> {
        progress.report(ProgressEvent::EnumerationStarted {
            account: account.to_string(),
        });

        let first = self.client.first_page(account, token).await?;

        let total_pages = first.total_pages();
        if total_pages == 0 {
            info!("No repositories found for {}", account);
            progress.report(ProgressEvent::NoRepositories {
                account: account.to_string(),
            });
            return Ok(Manifest::new());
        }

        let mut manifest = Manifest::new();
        let mut page_number = 1u64;
        let mut page = first;

        loop {
            let before = manifest.len();
            manifest.extend(
                page.values
                    .iter()
                    .filter_map(|repo| RepositoryRecord::from_listing(repo, self.ssh_host)),
            );
            debug!(
                "Page {}/{} for {}: {} entries, {} git",
                page_number,
                total_pages,
                account,
                page.values.len(),
                manifest.len() - before
            );

            progress.report(ProgressEvent::PageProcessed {
                account: account.to_string(),
                page: page_number.min(total_pages),
                total_pages,
            });

            let Some(cursor) = PageCursor::after(&page) else {
                break;
            };

            page_number += 1;
            page = self
                .client
                .get_page(cursor.as_str(), token)
                .await
                .map_err(|source| BackupError::Enumeration {
                    account: account.to_string(),
                    page: page_number,
                    source,
                })?;
        }

        let path = self.store.save(account, &manifest)?;
        info!(
            "Found {} git repositories for {} across {} pages, manifest written to {}",
            manifest.len(),
            account,
            page_number,
            path.display()
        );

        progress.report(ProgressEvent::EnumerationFinished {
            account: account.to_string(),
            pages: page_number,
            repositories: manifest.len(),
        });

        Ok(manifest)
    }
}
