//! Cloud Resource Discovery
//!
//! The resource API trait, its REST and in-memory implementations, and the
//! paginated enumerator that turns the page-token protocol into a lazy
//! sequence of resource records.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{BackoffPolicy, RetryDecision};
use super::identity::CredentialCache;
use super::types::{AccountTarget, CloudError, DelegatedCredential, ResourceRecord, ScanError};

/// One page of a listing call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePage {
    pub records: Vec<ResourceRecord>,
    pub next_page_token: Option<String>,
}

/// Region-scoped, paginated, rate-limited resource listing
#[async_trait]
pub trait CloudResourceApi: Send + Sync {
    fn name(&self) -> &str;

    async fn list_page(
        &self,
        credential: &DelegatedCredential,
        service: &str,
        region: &str,
        resource_type: &str,
        page_token: Option<&str>,
    ) -> Result<ResourcePage, CloudError>;
}

#[derive(Debug, Deserialize)]
struct InventoryPage {
    #[serde(default)]
    items: Vec<InventoryItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InventoryItem {
    id: String,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

/// Client for a JSON inventory gateway
pub struct RestResourceApi {
    http_client: reqwest::Client,
    base_url: String,
}

impl RestResourceApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn page_url(&self, account_id: &str, region: &str, service: &str, resource_type: &str) -> String {
        format!(
            "{}/v1/accounts/{}/regions/{}/services/{}/resources/{}",
            self.base_url,
            urlencoding::encode(account_id),
            urlencoding::encode(region),
            urlencoding::encode(service),
            urlencoding::encode(resource_type)
        )
    }
}

#[async_trait]
impl CloudResourceApi for RestResourceApi {
    fn name(&self) -> &str {
        "rest"
    }

    async fn list_page(
        &self,
        credential: &DelegatedCredential,
        service: &str,
        region: &str,
        resource_type: &str,
        page_token: Option<&str>,
    ) -> Result<ResourcePage, CloudError> {
        let url = self.page_url(&credential.account_id, region, service, resource_type);
        let secret = &credential.secret;

        let mut request = match secret.session_token.as_deref() {
            Some(token) => self
                .http_client
                .get(&url)
                .bearer_auth(token)
                .header("X-Access-Key-Id", secret.access_key_id.as_str()),
            None => self
                .http_client
                .get(&url)
                .basic_auth(&secret.access_key_id, Some(&secret.secret_access_key)),
        };
        if let Some(token) = page_token {
            request = request.query(&[("page_token", token)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status(status.as_u16(), &body));
        }

        let page: InventoryPage = response
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(format!("inventory page: {}", e)))?;

        let fetched_at = Utc::now();
        let records = page
            .items
            .into_iter()
            .map(|item| ResourceRecord {
                account_id: credential.account_id.clone(),
                region: region.to_string(),
                service: service.to_string(),
                resource_id: item.id,
                resource_type: resource_type.to_string(),
                attributes: item.attributes,
                fetched_at,
            })
            .collect();

        Ok(ResourcePage {
            records,
            next_page_token: page.next_page_token.filter(|token| !token.is_empty()),
        })
    }
}

type InventoryKey = (String, String, String, String);

/// Serves pre-loaded inventory in fixed-size pages.
///
/// Page tokens are page indexes. Unknown (account, service, region,
/// resource_type) combinations list as empty.
#[derive(Debug, Default)]
pub struct InMemoryResourceApi {
    pages: HashMap<InventoryKey, Vec<Vec<ResourceRecord>>>,
}

impl InMemoryResourceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<ResourceRecord>, page_size: usize) -> Self {
        let mut api = Self::new();
        api.insert_records(records, page_size);
        api
    }

    /// Load a JSON array of resource records
    pub fn from_json_file(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory file {}", path.display()))?;
        let records: Vec<ResourceRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse inventory file {}", path.display()))?;

        info!(count = records.len(), path = %path.display(), "Loaded offline inventory");
        Ok(Self::from_records(records, page_size))
    }

    pub fn insert_records(&mut self, records: Vec<ResourceRecord>, page_size: usize) {
        let page_size = page_size.max(1);
        let mut grouped: HashMap<InventoryKey, Vec<ResourceRecord>> = HashMap::new();
        for record in records {
            let key = (
                record.account_id.clone(),
                record.service.clone(),
                record.region.clone(),
                record.resource_type.clone(),
            );
            grouped.entry(key).or_default().push(record);
        }

        for (key, records) in grouped {
            let pages = self.pages.entry(key).or_default();
            for chunk in records.chunks(page_size) {
                pages.push(chunk.to_vec());
            }
        }
    }
}

#[async_trait]
impl CloudResourceApi for InMemoryResourceApi {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn list_page(
        &self,
        credential: &DelegatedCredential,
        service: &str,
        region: &str,
        resource_type: &str,
        page_token: Option<&str>,
    ) -> Result<ResourcePage, CloudError> {
        let index = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| CloudError::BadRequest(format!("invalid page token {}", token)))?,
        };

        let key = (
            credential.account_id.clone(),
            service.to_string(),
            region.to_string(),
            resource_type.to_string(),
        );
        let Some(pages) = self.pages.get(&key) else {
            return Ok(ResourcePage::default());
        };

        match pages.get(index) {
            Some(records) => Ok(ResourcePage {
                records: records.clone(),
                next_page_token: (index + 1 < pages.len()).then(|| (index + 1).to_string()),
            }),
            None if index == 0 => Ok(ResourcePage::default()),
            None => Err(CloudError::BadRequest(format!("page token {} out of range", index))),
        }
    }
}

/// What one enumeration lists
#[derive(Debug, Clone)]
pub struct EnumerationTarget {
    pub account: Arc<AccountTarget>,
    pub service: String,
    pub region: String,
    pub resource_type: String,
}

/// Lazy, finite, single-use sequence of resource records.
///
/// Each page request runs under the backoff policy. An auth rejection refreshes
/// the credential once per enumeration and retries the page. Cancellation is
/// observed between pages, never during a fetch. Records of pages already
/// fetched are yielded before any later error.
pub struct PageEnumerator {
    api: Arc<dyn CloudResourceApi>,
    cache: Arc<CredentialCache>,
    credential: Arc<DelegatedCredential>,
    target: EnumerationTarget,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    buffer: VecDeque<ResourceRecord>,
    next_token: Option<String>,
    started: bool,
    finished: bool,
    refreshed: bool,
    pages_fetched: usize,
}

impl PageEnumerator {
    pub fn new(
        api: Arc<dyn CloudResourceApi>,
        cache: Arc<CredentialCache>,
        credential: Arc<DelegatedCredential>,
        target: EnumerationTarget,
    ) -> Self {
        Self {
            api,
            cache,
            credential,
            target,
            policy: BackoffPolicy::default(),
            cancel: CancellationToken::new(),
            buffer: VecDeque::new(),
            next_token: None,
            started: false,
            finished: false,
            refreshed: false,
            pages_fetched: 0,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Credential currently in use, possibly refreshed mid-enumeration
    pub fn credential(&self) -> Arc<DelegatedCredential> {
        Arc::clone(&self.credential)
    }

    pub async fn next(&mut self) -> Option<Result<ResourceRecord, ScanError>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.finished {
                return None;
            }
            if self.started && self.next_token.is_none() {
                self.finished = true;
                return None;
            }
            if self.cancel.is_cancelled() {
                self.finished = true;
                return Some(Err(ScanError::Cancelled));
            }

            match self.fetch_page().await {
                Ok(page) => {
                    self.started = true;
                    self.pages_fetched += 1;
                    self.next_token = page.next_page_token.filter(|token| !token.is_empty());
                    debug!(
                        account = %self.target.account.account_id,
                        region = %self.target.region,
                        resource_type = %self.target.resource_type,
                        page = self.pages_fetched,
                        records = page.records.len(),
                        "Fetched resource page"
                    );
                    self.buffer.extend(page.records);
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ResourceRecord, ScanError>> + Send {
        stream::unfold(self, |mut enumerator| async move {
            enumerator.next().await.map(|item| (item, enumerator))
        })
    }

    async fn fetch_page(&mut self) -> Result<ResourcePage, ScanError> {
        let mut attempt = 1;
        loop {
            let result = self
                .api
                .list_page(
                    &self.credential,
                    &self.target.service,
                    &self.target.region,
                    &self.target.resource_type,
                    self.next_token.as_deref(),
                )
                .await;
            let err = match result {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            match self.policy.decide(attempt, err.class()) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        account = %self.target.account.account_id,
                        region = %self.target.region,
                        service = %self.target.service,
                        attempt,
                        error = %err,
                        "Page request failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(ScanError::Cancelled),
                    }
                    attempt += 1;
                }
                RetryDecision::RefreshCredential if !self.refreshed => {
                    self.refreshed = true;
                    let fresh = self.cache.refresh(&self.target.account, &self.credential).await?;
                    self.credential = fresh;
                }
                RetryDecision::RefreshCredential | RetryDecision::GiveUp => {
                    return Err(ScanError::Enumeration {
                        service: self.target.service.clone(),
                        region: self.target.region.clone(),
                        resource_type: self.target.resource_type.clone(),
                        source: err,
                    });
                }
            }
        }
    }
}
