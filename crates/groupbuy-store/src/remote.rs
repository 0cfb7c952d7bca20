//! Store backed by a Git hosting "contents" API.
//!
//! `GET /repos/{owner}/{repo}/contents/{path}?ref={branch}` returns the file as
//! base64 plus a content `sha`; `PUT` on the same path writes new base64
//! content, and must carry the current `sha` when the file already exists.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use groupbuy_core::{Item, Order};
use serde::{Deserialize, Serialize};

use crate::codec::{decode_items, decode_orders, encode_items, encode_orders};
use crate::LedgerStore;

pub const DEFAULT_TOKEN_ENV: &str = "GROUPBUY_REMOTE_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RemoteConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub items_path: String,
    pub orders_path: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: String,
    sha: String,
}

#[derive(Debug, Serialize)]
struct ContentsUpdate<'a> {
    message: String,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

struct RemoteFile {
    bytes: Vec<u8>,
    sha: String,
}

pub struct RemoteFileStore {
    config: RemoteConfig,
    agent: ureq::Agent,
}

impl RemoteFileStore {
    #[must_use]
    pub fn new(config: RemoteConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms.max(100));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(concat!("groupbuy/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { config, agent }
    }

    #[must_use]
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        let request = request.set("Accept", "application/vnd.github+json");
        match self.config.token.as_deref() {
            Some(token) if !token.is_empty() => {
                request.set("Authorization", &format!("Bearer {token}"))
            }
            _ => request,
        }
    }

    /// `Ok(None)` when the file does not exist yet.
    fn fetch(&self, path: &str) -> Result<Option<RemoteFile>, FetchError> {
        let request = self
            .authorize(self.agent.get(&self.contents_url(path)))
            .query("ref", &self.config.branch);

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(FetchError::Unreadable(anyhow!(
                    "GET {path} returned status {code}: {body}"
                )));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(FetchError::Unreachable(anyhow!("GET {path} failed: {transport}")));
            }
        };

        let payload: ContentsResponse = response
            .into_json()
            .with_context(|| format!("invalid contents payload for {path}"))
            .map_err(FetchError::Unreadable)?;
        let encoded = payload.content.split_whitespace().collect::<String>();
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .with_context(|| format!("invalid base64 content for {path}"))
            .map_err(FetchError::Unreadable)?;
        Ok(Some(RemoteFile { bytes, sha: payload.sha }))
    }

    fn load_table(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.fetch(path) {
            Ok(file) => Ok(file.map(|file| file.bytes)),
            Err(FetchError::Unreachable(err)) => Err(err),
            Err(FetchError::Unreadable(err)) => {
                tracing::warn!(path, error = %err, "unreadable remote table, using empty");
                Ok(None)
            }
        }
    }

    fn store(&self, path: &str, bytes: &[u8]) -> Result<()> {
        // Last write wins: the sha is taken right before the write.
        let sha = self.fetch(path).map_err(FetchError::into_inner)?.map(|file| file.sha);
        let update = ContentsUpdate {
            message: format!("groupbuy: update {path}"),
            content: STANDARD.encode(bytes),
            branch: &self.config.branch,
            sha,
        };

        match self.authorize(self.agent.put(&self.contents_url(path))).send_json(&update) {
            Ok(_) => {
                tracing::debug!(path, "remote table written");
                Ok(())
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(anyhow!("PUT {path} rejected with status {code}: {body}"))
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(anyhow!("PUT {path} failed: {transport}"))
            }
        }
    }
}

enum FetchError {
    /// The API could not be contacted at all.
    Unreachable(anyhow::Error),
    /// The API answered, but not with usable content.
    Unreadable(anyhow::Error),
}

impl FetchError {
    fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Unreachable(err) | Self::Unreadable(err) => err,
        }
    }
}

impl LedgerStore for RemoteFileStore {
    fn backend(&self) -> &'static str {
        "remote"
    }

    fn load_items(&mut self) -> Result<Vec<Item>> {
        match self.load_table(&self.config.items_path)? {
            Some(bytes) => Ok(decode_items(&bytes)),
            None => Ok(Vec::new()),
        }
    }

    fn load_orders(&mut self) -> Result<Vec<Order>> {
        match self.load_table(&self.config.orders_path)? {
            Some(bytes) => Ok(decode_orders(&bytes)),
            None => Ok(Vec::new()),
        }
    }

    fn save_items(&mut self, items: &[Item]) -> Result<()> {
        let path = self.config.items_path.clone();
        self.store(&path, &encode_items(items)?)
    }

    fn save_orders(&mut self, orders: &[Order]) -> Result<()> {
        let path = self.config.orders_path.clone();
        self.store(&path, &encode_orders(orders)?)
    }
}
