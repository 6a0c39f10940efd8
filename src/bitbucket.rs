use anyhow::{Context, Result};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{BitbucketConfig, Credentials};
use crate::error::BackupError;

/// Bearer credential handed out by the client-credentials grant
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// One page of the `repositories/<account>` listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingPage {
    /// Total number of repositories across all pages
    pub size: Option<u64>,
    /// Page size
    pub pagelen: Option<u64>,
    /// 1-based page number
    pub page: Option<u64>,
    #[serde(default)]
    pub values: Vec<ListedRepository>,
    /// Link to the following page, absent on the last one
    pub next: Option<String>,
}

impl ListingPage {
    /// `ceil(size / pagelen)`, zero when either field is missing or zero
    pub fn total_pages(&self) -> u64 {
        match (self.size, self.pagelen) {
            (Some(size), Some(pagelen)) => total_pages(size, pagelen),
            _ => 0,
        }
    }
}

pub fn total_pages(size: u64, pagelen: u64) -> u64 {
    if size == 0 || pagelen == 0 {
        0
    } else {
        size.div_ceil(pagelen)
    }
}

/// Repository object as returned by the listing API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListedRepository {
    pub scm: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub slug: String,
    pub project: Option<ListedProject>,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListedProject {
    pub name: Option<String>,
}

impl ListedRepository {
    pub fn is_git(&self) -> bool {
        self.scm.as_deref() == Some("git")
    }
}

/// Thin HTTP client for the token endpoint and the repository listing
#[derive(Clone)]
pub struct BitbucketClient {
    http: Client,
    auth_url: String,
    api_base_url: Url,
}

impl BitbucketClient {
    pub fn new(config: &BitbucketConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bitbuckup/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        // Url::join drops the last segment unless the base ends with a slash
        let mut base = config.api_base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_base_url = Url::parse(&base)
            .with_context(|| format!("Invalid API base URL: {}", config.api_base_url))?;

        Ok(Self {
            http,
            auth_url: config.auth_url.clone(),
            api_base_url,
        })
    }

    /// Exchange client credentials for an access token
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<AccessToken, BackupError> {
        debug!("Requesting access token from {}", self.auth_url);

        let response = self
            .http
            .post(&self.auth_url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| BackupError::AccessDenied {
                reason: format!("token request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackupError::AccessDenied {
                reason: format!("token endpoint answered {}", status),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| BackupError::AccessDenied {
            reason: format!("malformed token response: {}", e),
        })?;

        match body.access_token.filter(|token| !token.is_empty()) {
            Some(token) => {
                info!("Access token retrieved");
                Ok(AccessToken::new(token))
            }
            None => Err(BackupError::AccessDenied {
                reason: "response did not contain an access token".to_string(),
            }),
        }
    }

    /// URL of the first listing page for `account`
    pub fn repositories_url(&self, account: &str) -> Result<Url> {
        self.api_base_url
            .join(&format!("repositories/{}", account))
            .with_context(|| format!("Invalid account name: {}", account))
    }

    /// Fetch the first listing page, passing the token as a query credential
    pub async fn first_page(&self, account: &str, token: &AccessToken) -> Result<ListingPage> {
        let mut url = self.repositories_url(account)?;
        url.query_pairs_mut()
            .append_pair("access_token", token.secret());

        self.get_page(url.as_str(), token)
            .await
            .map_err(|source| BackupError::Enumeration {
                account: account.to_string(),
                page: 1,
                source,
            })
            .map_err(anyhow::Error::from)
    }

    /// Fetch a page by the opaque `next` link of the previous one
    pub async fn get_page(&self, url: &str, token: &AccessToken) -> reqwest::Result<ListingPage> {
        debug!("GET {}", redact(url));

        self.http
            .get(url)
            .bearer_auth(token.secret())
            .send()
            .await?
            .error_for_status()?
            .json::<ListingPage>()
            .await
    }
}

/// Strip the access token from a URL before logging it
fn redact(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| {
                    let v = if k == "access_token" { "***".into() } else { v.into_owned() };
                    (k.into_owned(), v)
                })
                .collect();
            if pairs.is_empty() {
                return parsed.to_string();
            }
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}
