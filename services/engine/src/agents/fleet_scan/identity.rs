//! Delegated Credential Exchange
//!
//! Brokers trade the engine's root identity plus a target account for a
//! short-lived delegated credential. The cache memoizes one credential per
//! account and never runs more than one exchange per account at a time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backoff::{BackoffPolicy, RetryDecision};
use super::types::{AccountTarget, CloudError, DelegatedCredential, ScanError, SecretMaterial, TrustRelationship};

/// Exchanges the engine's root credential for an account-scoped one
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    fn name(&self) -> &str;

    async fn exchange(&self, account: &AccountTarget) -> Result<DelegatedCredential, CloudError>;
}

/// STS AssumeRoleWithWebIdentity response
#[derive(Debug, Deserialize)]
struct AssumeRoleWithWebIdentityResponse {
    #[serde(rename = "AssumeRoleWithWebIdentityResult")]
    result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResult {
    #[serde(rename = "Credentials")]
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
struct StsCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
    #[serde(rename = "Expiration")]
    expiration: String,
}

/// Broker backed by AWS STS web identity federation.
///
/// `role` trust relationships are exchanged through
/// AssumeRoleWithWebIdentity using the projected web identity token as the
/// root credential. `static_secret` relationships are resolved from
/// `<REF>_ACCESS_KEY_ID` / `<REF>_SECRET_ACCESS_KEY` / `<REF>_SESSION_TOKEN`.
pub struct StsCredentialBroker {
    http_client: reqwest::Client,
    endpoint: String,
    web_identity_token_file: PathBuf,
    session_prefix: String,
    session_duration: Duration,
}

impl StsCredentialBroker {
    pub fn new(region: &str, web_identity_token_file: impl Into<PathBuf>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            endpoint: format!("https://sts.{}.amazonaws.com", region),
            web_identity_token_file: web_identity_token_file.into(),
            session_prefix: "fleet-scan".to_string(),
            session_duration: Duration::from_secs(3600),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_session_duration(mut self, duration: Duration) -> Self {
        self.session_duration = duration;
        self
    }

    async fn read_web_identity_token(&self) -> Result<String, CloudError> {
        tokio::fs::read_to_string(&self.web_identity_token_file)
            .await
            .map(|token| token.trim().to_string())
            .map_err(|e| {
                CloudError::Forbidden(format!(
                    "cannot read web identity token {}: {}",
                    self.web_identity_token_file.display(),
                    e
                ))
            })
    }

    async fn assume_role(
        &self,
        account: &AccountTarget,
        role_identifier: &str,
        external_id: Option<&str>,
    ) -> Result<DelegatedCredential, CloudError> {
        let token = self.read_web_identity_token().await?;
        let session_label = format!("{}-{}", self.session_prefix, account.account_id);

        let duration = self.session_duration.as_secs().to_string();
        let mut form: Vec<(&str, &str)> = vec![
            ("Action", "AssumeRoleWithWebIdentity"),
            ("Version", "2011-06-15"),
            ("RoleArn", role_identifier),
            ("RoleSessionName", session_label.as_str()),
            ("DurationSeconds", duration.as_str()),
            ("WebIdentityToken", token.as_str()),
        ];
        if let Some(external_id) = external_id {
            form.push(("ExternalId", external_id));
        }

        // The token travels in the body only; urls end up in error messages
        let issued_at = Utc::now();
        let response = self
            .http_client
            .post(format!("{}/", self.endpoint))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(classify_sts_failure(status.as_u16(), &body));
        }

        let credentials = parse_sts_response(&body)?;
        let expires_at = DateTime::parse_from_rfc3339(&credentials.expiration)
            .map(|expiry| expiry.with_timezone(&Utc))
            .map_err(|e| CloudError::InvalidResponse(format!("bad STS expiration: {}", e)))?;

        info!(account = %account.account_id, role = %role_identifier, "Assumed role via web identity");

        Ok(DelegatedCredential {
            account_id: account.account_id.clone(),
            issued_at,
            expires_at,
            secret: SecretMaterial::new(
                credentials.access_key_id,
                credentials.secret_access_key,
                Some(credentials.session_token),
            ),
            session_label,
        })
    }

    fn static_secret(&self, account: &AccountTarget, secret_ref: &str) -> Result<DelegatedCredential, CloudError> {
        let prefix = secret_ref.to_uppercase().replace(['-', '.', '/'], "_");
        let lookup = |suffix: &str| env::var(format!("{}_{}", prefix, suffix)).ok();

        let (Some(access_key_id), Some(secret_access_key)) = (lookup("ACCESS_KEY_ID"), lookup("SECRET_ACCESS_KEY"))
        else {
            return Err(CloudError::Forbidden(format!(
                "static secret {} is not present in the environment",
                secret_ref
            )));
        };

        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.session_duration).unwrap_or_else(|_| chrono::Duration::hours(1));

        Ok(DelegatedCredential {
            account_id: account.account_id.clone(),
            issued_at,
            expires_at: issued_at + ttl,
            secret: SecretMaterial::new(access_key_id, secret_access_key, lookup("SESSION_TOKEN")),
            session_label: format!("{}-static-{}", self.session_prefix, account.account_id),
        })
    }
}

#[async_trait]
impl CredentialBroker for StsCredentialBroker {
    fn name(&self) -> &str {
        "sts"
    }

    async fn exchange(&self, account: &AccountTarget) -> Result<DelegatedCredential, CloudError> {
        match &account.trust_relationship {
            TrustRelationship::Role {
                role_identifier,
                external_id,
            } => self.assume_role(account, role_identifier, external_id.as_deref()).await,
            TrustRelationship::StaticSecret { static_secret_ref } => self.static_secret(account, static_secret_ref),
        }
    }
}

fn parse_sts_response(body: &str) -> Result<StsCredentials, CloudError> {
    let response: AssumeRoleWithWebIdentityResponse = quick_xml::de::from_str(body)
        .map_err(|e| CloudError::InvalidResponse(format!("failed to parse STS XML response: {}", e)))?;
    Ok(response.result.credentials)
}

/// STS reports throttling and token problems as 400s with an error code
fn classify_sts_failure(status: u16, body: &str) -> CloudError {
    let detail = format!("STS HTTP {}: {}", status, body.trim());
    if body.contains("<Code>Throttling</Code>") || body.contains("<Code>RequestLimitExceeded</Code>") {
        CloudError::Throttled(detail)
    } else if body.contains("<Code>ExpiredTokenException</Code>") || body.contains("<Code>ExpiredToken</Code>") {
        CloudError::Unauthorized(detail)
    } else if body.contains("<Code>IDPCommunicationError</Code>") {
        CloudError::Network(detail)
    } else {
        CloudError::from_status(status, body)
    }
}

/// In-process broker issuing synthetic credentials; for offline runs and tests
pub struct StaticCredentialBroker {
    ttl: Duration,
}

impl StaticCredentialBroker {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl Default for StaticCredentialBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl CredentialBroker for StaticCredentialBroker {
    fn name(&self) -> &str {
        "static"
    }

    async fn exchange(&self, account: &AccountTarget) -> Result<DelegatedCredential, CloudError> {
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));

        Ok(DelegatedCredential {
            account_id: account.account_id.clone(),
            issued_at,
            expires_at: issued_at + ttl,
            secret: SecretMaterial::new(format!("OFFLINE{}", account.account_id), "offline", None),
            session_label: format!("offline-{}", account.account_id),
        })
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Arc<DelegatedCredential>>>>;

/// Per-account memoized delegated credentials with single-flight refresh.
///
/// The outer map lock is held only to look up a slot; the per-account async
/// lock is held across the exchange so concurrent callers await the same
/// result. A caller that waited on a failed exchange runs its own exchange.
pub struct CredentialCache {
    broker: Arc<dyn CredentialBroker>,
    policy: BackoffPolicy,
    safety_margin: chrono::Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl CredentialCache {
    pub fn new(broker: Arc<dyn CredentialBroker>, policy: BackoffPolicy, safety_margin: Duration) -> Self {
        Self {
            broker,
            policy,
            safety_margin: chrono::Duration::from_std(safety_margin).unwrap_or_else(|_| chrono::Duration::days(1)),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, account_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            slots
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None))),
        )
    }

    /// Cached credential for the account, exchanging on miss or near expiry
    pub async fn get(&self, account: &AccountTarget) -> Result<Arc<DelegatedCredential>, ScanError> {
        let slot = self.slot(&account.account_id);
        let mut cached = slot.lock().await;

        if let Some(credential) = cached.as_ref() {
            if !credential.needs_refresh(Utc::now(), self.safety_margin) {
                return Ok(Arc::clone(credential));
            }
            debug!(account = %account.account_id, expires_at = %credential.expires_at, "Credential near expiry, refreshing");
        }

        let fresh = Arc::new(self.exchange_with_retry(account).await?);
        *cached = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Replace a credential the resource API rejected.
    ///
    /// If another caller already swapped `stale` out, the newer credential is
    /// returned without a second exchange.
    pub async fn refresh(
        &self,
        account: &AccountTarget,
        stale: &Arc<DelegatedCredential>,
    ) -> Result<Arc<DelegatedCredential>, ScanError> {
        let slot = self.slot(&account.account_id);
        let mut cached = slot.lock().await;

        if let Some(current) = cached.as_ref() {
            if !Arc::ptr_eq(current, stale) && !current.needs_refresh(Utc::now(), self.safety_margin) {
                return Ok(Arc::clone(current));
            }
        }

        info!(account = %account.account_id, "Refreshing rejected credential");
        *cached = None;
        let fresh = Arc::new(self.exchange_with_retry(account).await?);
        *cached = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    async fn exchange_with_retry(&self, account: &AccountTarget) -> Result<DelegatedCredential, ScanError> {
        let mut attempt = 1;
        loop {
            let err = match self.broker.exchange(account).await {
                Ok(credential) => {
                    info!(
                        account = %account.account_id,
                        broker = %self.broker.name(),
                        expires_at = %credential.expires_at,
                        "Delegated credential issued"
                    );
                    return Ok(credential);
                }
                Err(err) => err,
            };

            match self.policy.decide(attempt, err.class()) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        account = %account.account_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Credential exchange failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp | RetryDecision::RefreshCredential => {
                    warn!(account = %account.account_id, attempt, error = %err, "Credential exchange failed");
                    return Err(ScanError::Auth {
                        account_id: account.account_id.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    pub fn cached_accounts(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or_default()
    }

    /// Drop every cached credential; secrets are wiped when the last holder lets go
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let dropped = slots.len();
        slots.clear();
        debug!(count = dropped, "Credential cache cleared");
    }
}
