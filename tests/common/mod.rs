/// Common test utilities and helpers for bitbuckup tests
use async_trait::async_trait;
use bitbuckup::config::Credentials;
use bitbuckup::{Config, GitBackend, GitOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN: &str = "tok-1";

/// Calls seen by [`FakeGit`]
#[derive(Debug, Default)]
pub struct GitCalls {
    pub clones: Vec<(String, PathBuf)>,
    pub fetches: Vec<PathBuf>,
}

/// Git backend that records calls; cloning creates `.git` so the next run sees a working copy
#[derive(Clone, Default)]
pub struct FakeGit {
    calls: Arc<Mutex<GitCalls>>,
    cancel_on_fetch: Option<CancellationToken>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` from inside the first branch fetch, as an interrupt would
    pub fn cancelling(token: CancellationToken) -> Self {
        Self {
            calls: Arc::default(),
            cancel_on_fetch: Some(token),
        }
    }

    pub fn clones(&self) -> Vec<(String, PathBuf)> {
        self.calls.lock().unwrap().clones.clone()
    }

    pub fn fetches(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().fetches.clone()
    }
}

#[async_trait]
impl GitBackend for FakeGit {
    async fn clone_into(&self, remote_url: &str, directory: &Path) -> GitOutcome {
        std::fs::create_dir_all(directory.join(".git")).unwrap();
        self.calls
            .lock()
            .unwrap()
            .clones
            .push((remote_url.to_string(), directory.to_path_buf()));
        GitOutcome::Success
    }

    async fn fetch_all_branches(&self, directory: &Path) -> GitOutcome {
        self.calls
            .lock()
            .unwrap()
            .fetches
            .push(directory.to_path_buf());
        if let Some(token) = &self.cancel_on_fetch {
            token.cancel();
        }
        GitOutcome::Success
    }
}

/// Configuration pointing both endpoints at `server`
pub fn config_for(server: &MockServer, work_directory: &Path) -> Config {
    let mut config = Config::default();
    config.work_directory = work_directory.to_string_lossy().into_owned();
    config.bitbucket.auth_url = format!("{}/site/oauth2/access_token", server.uri());
    config.bitbucket.api_base_url = format!("{}/2.0/", server.uri());
    config.bitbucket.request_timeout = 5;
    config
}

pub fn credentials(accounts: &[&str]) -> Credentials {
    Credentials {
        client_id: "12345".to_string(),
        client_secret: "abcdef".to_string(),
        accounts: accounts.iter().map(|a| a.to_string()).collect(),
    }
}

/// A listing entry as the API returns it
pub fn repo(scm: &str, account: &str, slug: &str, uuid: &str) -> Value {
    json!({
        "scm": scm,
        "name": slug,
        "uuid": uuid,
        "slug": slug,
        "full_name": format!("{}/{}", account, slug),
    })
}

pub fn page(size: u64, pagelen: u64, values: Vec<Value>, next: Option<String>) -> Value {
    let mut page = json!({
        "size": size,
        "pagelen": pagelen,
        "page": 1,
        "values": values,
    });
    if let Some(next) = next {
        page["next"] = Value::String(next);
    }
    page
}

pub async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/site/oauth2/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": TOKEN,
            "token_type": "bearer",
        })))
        .mount(server)
        .await;
}

/// Serve a single-page listing for `account`
pub async fn mount_single_page(server: &MockServer, account: &str, slugs: &[&str]) {
    let values = slugs
        .iter()
        .enumerate()
        .map(|(i, slug)| repo("git", account, slug, &format!("{{{}-{}}}", account, i)))
        .collect();
    Mock::given(method("GET"))
        .and(path(format!("/2.0/repositories/{}", account)))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(
            slugs.len() as u64,
            10,
            values,
            None,
        )))
        .mount(server)
        .await;
}
