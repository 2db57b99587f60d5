//! Fleet Scan Types
//!
//! Core types for account targets, delegated credentials, resource records,
//! findings, scan progress and the fleet report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

use super::backoff::ErrorClass;

/// Scheduling priority of an account. Ordering is start order: `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// How the engine reaches into a target account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrustRelationship {
    /// Role assumed through a trust exchange (e.g. an IAM role ARN)
    Role {
        role_identifier: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
    },
    /// Reference to a static secret resolved by the broker
    StaticSecret { static_secret_ref: String },
}

/// One account of the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountTarget {
    pub account_id: String,
    #[serde(default)]
    pub display_name: String,
    pub trust_relationship: TrustRelationship,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AccountTarget {
    pub fn new(account_id: impl Into<String>, trust_relationship: TrustRelationship) -> Self {
        let account_id = account_id.into();
        Self {
            display_name: account_id.clone(),
            account_id,
            trust_relationship,
            regions: Vec::new(),
            priority: Priority::default(),
            enabled: true,
        }
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Human readable label, falling back to the account id
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.account_id
        } else {
            &self.display_name
        }
    }
}

/// Opaque secret half of a delegated credential, wiped on drop
#[derive(Clone, PartialEq, Eq)]
pub struct SecretMaterial {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl SecretMaterial {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretMaterial([redacted])")
    }
}

impl Drop for SecretMaterial {
    fn drop(&mut self) {
        self.access_key_id.zeroize();
        self.secret_access_key.zeroize();
        if let Some(token) = self.session_token.as_mut() {
            token.zeroize();
        }
    }
}

/// Short-lived credential scoped to exactly one account.
///
/// Only the credential cache stores these, and they are never serialized.
#[derive(Clone)]
pub struct DelegatedCredential {
    pub account_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub secret: SecretMaterial,
    pub session_label: String,
}

impl DelegatedCredential {
    /// True once `now + safety_margin` reaches the expiry
    pub fn needs_refresh(&self, now: DateTime<Utc>, safety_margin: chrono::Duration) -> bool {
        now + safety_margin >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> chrono::Duration {
        self.expires_at - Utc::now()
    }
}

impl fmt::Debug for DelegatedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedCredential")
            .field("account_id", &self.account_id)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("session_label", &self.session_label)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Snapshot of one cloud resource as returned by the resource API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub account_id: String,
    pub region: String,
    pub service: String,
    pub resource_id: String,
    pub resource_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(
        account_id: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            service: service.into(),
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            attributes: BTreeMap::new(),
            fetched_at: Utc::now(),
        }
    }

    /// Returns a copy carrying one more attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low];
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A rule violation detected on one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub finding_key: String,
    pub severity: Severity,
    pub rule_id: String,
    pub title: String,
    pub description: String,
    pub account_id: String,
    pub region: String,
    pub service: String,
    pub resource_id: String,
    #[serde(default)]
    pub pillar_tags: BTreeSet<String>,
    pub detected_at: DateTime<Utc>,
}

impl Finding {
    /// Deterministic identity of a finding, independent of region and time
    pub fn key_for(account_id: &str, service: &str, resource_id: &str, rule_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(account_id.as_bytes());
        hasher.update(b"|");
        hasher.update(service.as_bytes());
        hasher.update(b"|");
        hasher.update(resource_id.as_bytes());
        hasher.update(b"|");
        hasher.update(rule_id.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn for_record(
        record: &ResourceRecord,
        rule_id: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let rule_id = rule_id.into();
        Self {
            finding_key: Self::key_for(&record.account_id, &record.service, &record.resource_id, &rule_id),
            severity,
            rule_id,
            title: title.into(),
            description: description.into(),
            account_id: record.account_id.clone(),
            region: record.region.clone(),
            service: record.service.clone(),
            resource_id: record.resource_id.clone(),
            pillar_tags: BTreeSet::new(),
            detected_at: Utc::now(),
        }
    }

    pub fn with_pillar(mut self, tag: impl Into<String>) -> Self {
        self.pillar_tags.insert(tag.into());
        self
    }

    pub fn with_pillars<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pillar_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_detected_at(mut self, detected_at: DateTime<Utc>) -> Self {
        self.detected_at = detected_at;
        self
    }
}

/// Failure returned by a network boundary (credential broker or resource API)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CloudError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CloudError::Throttled(_) => ErrorClass::Throttling,
            CloudError::Network(_) => ErrorClass::TransientNetwork,
            CloudError::Unauthorized(_) => ErrorClass::AuthExpired,
            CloudError::Forbidden(_) | CloudError::NotFound(_) | CloudError::BadRequest(_) => {
                ErrorClass::PermanentClientError
            }
            CloudError::ServerError(_) | CloudError::InvalidResponse(_) => ErrorClass::PermanentServerError,
        }
    }

    /// Classify a non-success HTTP response
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("HTTP {}: {}", status, body.trim());
        match status {
            429 => CloudError::Throttled(detail),
            401 => CloudError::Unauthorized(detail),
            403 => CloudError::Forbidden(detail),
            404 => CloudError::NotFound(detail),
            408 => CloudError::Network(detail),
            400..=499 => CloudError::BadRequest(detail),
            _ => CloudError::ServerError(detail),
        }
    }
}

impl From<reqwest::Error> for CloudError {
    /// Request urls can carry credentials, so they are stripped
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_decode() {
            CloudError::InvalidResponse(err.to_string())
        } else {
            CloudError::Network(err.to_string())
        }
    }
}

/// Errors surfaced by the scanning core
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    #[error("credential exchange for account {account_id} failed after {attempts} attempt(s): {source}")]
    Auth {
        account_id: String,
        attempts: u32,
        #[source]
        source: CloudError,
    },

    #[error("enumerating {service}/{resource_type} in {region} failed: {source}")]
    Enumeration {
        service: String,
        region: String,
        resource_type: String,
        #[source]
        source: CloudError,
    },

    #[error("rule {rule_id} failed on resource {resource_id}: {message}")]
    RuleEvaluation {
        rule_id: String,
        resource_id: String,
        message: String,
    },

    #[error("scan cancelled")]
    Cancelled,

    #[error("report sink failed: {0}")]
    Sink(String),

    #[error("fleet run task failed: {0}")]
    Internal(String),
}

impl ScanError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            ScanError::Auth { source, .. } | ScanError::Enumeration { source, .. } => Some(source.class()),
            _ => None,
        }
    }
}

/// Error entry kept in an account result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
    pub message: String,
}

impl ErrorRecord {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            region: None,
            service: None,
            resource_type: None,
            class: None,
            message: message.into(),
        }
    }

    /// Fill in the unit coordinates the error itself does not carry
    pub fn in_unit(mut self, region: &str, service: &str) -> Self {
        self.region.get_or_insert_with(|| region.to_string());
        self.service.get_or_insert_with(|| service.to_string());
        self
    }
}

impl From<&ScanError> for ErrorRecord {
    fn from(err: &ScanError) -> Self {
        let mut record = ErrorRecord::message(err.to_string());
        record.class = err.class();
        if let ScanError::Enumeration {
            service,
            region,
            resource_type,
            ..
        } = err
        {
            record.region = Some(region.clone());
            record.service = Some(service.clone());
            record.resource_type = Some(resource_type.clone());
        }
        record
    }
}

/// Lifecycle of one account's scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Pending,
    Running,
    Partial,
    Done,
    Failed,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Partial | ScanState::Done | ScanState::Failed)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Pending => write!(f, "pending"),
            ScanState::Running => write!(f, "running"),
            ScanState::Partial => write!(f, "partial"),
            ScanState::Done => write!(f, "done"),
            ScanState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub account_id: String,
    pub state: ScanState,
    pub services_completed: usize,
    pub services_failed: usize,
    /// Units stopped or never started because of cancellation
    #[serde(default)]
    pub services_interrupted: usize,
    pub services_total: usize,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ScanProgress {
    pub fn pending(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            state: ScanState::Pending,
            services_completed: 0,
            services_failed: 0,
            services_interrupted: 0,
            services_total: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Final status of an account in the fleet report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Done,
    Partial,
    Failed,
    Skipped,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Done => write!(f, "done"),
            AccountStatus::Partial => write!(f, "partial"),
            AccountStatus::Failed => write!(f, "failed"),
            AccountStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl From<AccountStatus> for ScanState {
    fn from(status: AccountStatus) -> Self {
        match status {
            AccountStatus::Done => ScanState::Done,
            AccountStatus::Partial => ScanState::Partial,
            AccountStatus::Failed => ScanState::Failed,
            AccountStatus::Skipped => ScanState::Pending,
        }
    }
}

/// Everything one account scan produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResult {
    pub account_id: String,
    pub display_name: String,
    pub status: AccountStatus,
    pub findings: Vec<Finding>,
    pub resources: Vec<ResourceRecord>,
    pub errors: Vec<ErrorRecord>,
    pub services_completed: usize,
    pub services_total: usize,
    pub rule_failures: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AccountResult {
    pub fn begin(account: &AccountTarget, services_total: usize) -> Self {
        Self {
            account_id: account.account_id.clone(),
            display_name: account.label().to_string(),
            status: AccountStatus::Partial,
            findings: Vec::new(),
            resources: Vec::new(),
            errors: Vec::new(),
            services_completed: 0,
            services_total,
            rule_failures: 0,
            started_at: Some(Utc::now()),
            finished_at: None,
            last_error: None,
        }
    }

    /// Result for an account that never started
    pub fn skipped(account: &AccountTarget) -> Self {
        Self {
            status: AccountStatus::Skipped,
            started_at: None,
            ..Self::begin(account, 0)
        }
    }

    pub fn finish(&mut self, status: AccountStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        if self.last_error.is_none() {
            self.last_error = self.errors.last().map(|e| e.message.clone());
        }
    }

    pub fn needs_rescan(&self) -> bool {
        self.status != AccountStatus::Done
    }
}

/// Count and share of one rollup bucket
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RollupBucket {
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rollups {
    pub by_service: BTreeMap<String, RollupBucket>,
    pub by_severity: BTreeMap<String, RollupBucket>,
    pub by_pillar: BTreeMap<String, RollupBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub done: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Aggregated result of one fleet run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub per_account: BTreeMap<String, AccountResult>,
    /// Deduplicated findings, most severe first
    pub findings: Vec<Finding>,
    pub rollups: Rollups,
    pub status_counts: StatusCounts,
    pub total_resources: usize,
    pub duplicates_removed: usize,
}

impl FleetReport {
    /// Accounts a follow-up run should scan again
    pub fn accounts_to_rescan(&self) -> Vec<&str> {
        self.per_account
            .values()
            .filter(|result| result.needs_rescan())
            .map(|result| result.account_id.as_str())
            .collect()
    }

    pub fn status_of(&self, account_id: &str) -> Option<AccountStatus> {
        self.per_account.get(account_id).map(|result| result.status)
    }
}
