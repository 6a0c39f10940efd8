//! bitbuckup - Mirror Bitbucket accounts onto local disk
//!
//! bitbuckup authenticates once with OAuth2 client credentials, lists every git
//! repository owned by each configured account, writes the listing to
//! `repos/<account>.json`, then clones missing repositories and fetches all
//! branches of existing ones. Running it again brings the mirror up to date.
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration with environment and `.env` overrides
//! - [`bitbucket`]: token grant and repository listing over HTTP
//! - [`discovery`]: paginated enumeration into a manifest
//! - [`manifest`]: per-account manifest files
//! - [`git`]: clone and fetch-all-branches through the git executable
//! - [`sync`]: the multi-account run
//! - [`shutdown`]: signal handling feeding a cancellation token
//! - [`progress`]: terminal progress output
//! - [`health`]: preflight checks

pub mod bitbucket;
pub mod config;
pub mod discovery;
pub mod error;
pub mod git;
pub mod health;
pub mod manifest;
pub mod progress;
pub mod shutdown;
pub mod sync;

pub use bitbucket::{AccessToken, BitbucketClient};
pub use config::{Config, Credentials};
pub use discovery::{Enumerator, Manifest, RepositoryRecord};
pub use error::BackupError;
pub use git::{GitBackend, GitCli, GitOutcome};
pub use health::HealthCheck;
pub use manifest::ManifestStore;
pub use progress::{Progress, ProgressEvent, RecordingProgress, TerminalProgress};
pub use sync::{ListSummary, RunSummary, SyncEngine, SyncResult};
