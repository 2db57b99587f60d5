//! Rule Catalog
//!
//! Rules are pure checks over a single resource record. The catalog maps each
//! service to the resource types it lists and each resource type to the rules
//! that apply, so rules can be added or removed without touching the scanner.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::types::{Finding, ResourceRecord, Severity};

pub const PILLAR_SECURITY: &str = "security";
pub const PILLAR_RELIABILITY: &str = "reliability";
pub const PILLAR_COST: &str = "cost_optimization";
pub const PILLAR_OPERATIONS: &str = "operational_excellence";
pub const PILLAR_PERFORMANCE: &str = "performance_efficiency";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("attribute `{attribute}` has unexpected type (expected {expected})")]
    MalformedAttribute { attribute: String, expected: &'static str },

    #[error("{0}")]
    Other(String),
}

pub trait Rule: Send + Sync {
    fn id(&self) -> &str;

    fn service(&self) -> &str;

    fn resource_type(&self) -> &str;

    fn evaluate(&self, record: &ResourceRecord) -> Result<Vec<Finding>, RuleError>;
}

/// Rule backed by a function or closure
pub struct FnRule<F> {
    id: String,
    service: String,
    resource_type: String,
    eval: F,
}

impl<F> FnRule<F> {
    pub fn new(id: impl Into<String>, service: impl Into<String>, resource_type: impl Into<String>, eval: F) -> Self
    where
        F: Fn(&ResourceRecord) -> Result<Vec<Finding>, RuleError> + Send + Sync,
    {
        Self {
            id: id.into(),
            service: service.into(),
            resource_type: resource_type.into(),
            eval,
        }
    }
}

impl<F> Rule for FnRule<F>
where
    F: Fn(&ResourceRecord) -> Result<Vec<Finding>, RuleError> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn evaluate(&self, record: &ResourceRecord) -> Result<Vec<Finding>, RuleError> {
        (self.eval)(record)
    }
}

/// Allow/deny lists of rule ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSelection {
    /// When set, only these rules run
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl RuleSelection {
    pub fn allows(&self, rule_id: &str) -> bool {
        let enabled = self
            .enabled
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == rule_id));
        enabled && !self.disabled.iter().any(|id| id == rule_id)
    }
}

type RuleKey = (String, String);

#[derive(Clone, Default)]
pub struct RuleCatalog {
    resource_types: BTreeMap<String, Vec<String>>,
    rules: BTreeMap<RuleKey, Vec<Arc<dyn Rule>>>,
}

impl fmt::Debug for RuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleCatalog")
            .field("resource_types", &self.resource_types)
            .field("rules", &self.rule_ids())
            .finish()
    }
}

impl RuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the built-in checks
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for check in BUILTIN_CHECKS {
            catalog.register(check.clone());
        }
        catalog
    }

    pub fn register_resource_type(&mut self, service: impl Into<String>, resource_type: impl Into<String>) {
        let resource_type = resource_type.into();
        let types = self.resource_types.entry(service.into()).or_default();
        if !types.contains(&resource_type) {
            types.push(resource_type);
        }
    }

    pub fn register<R: Rule + 'static>(&mut self, rule: R) {
        self.register_arc(Arc::new(rule));
    }

    pub fn register_arc(&mut self, rule: Arc<dyn Rule>) {
        self.register_resource_type(rule.service(), rule.resource_type());
        self.rules
            .entry((rule.service().to_string(), rule.resource_type().to_string()))
            .or_default()
            .push(rule);
    }

    /// Remove every rule with this id; resource types stay registered
    pub fn remove(&mut self, rule_id: &str) -> bool {
        let mut removed = false;
        for rules in self.rules.values_mut() {
            let before = rules.len();
            rules.retain(|rule| rule.id() != rule_id);
            removed |= rules.len() != before;
        }
        removed
    }

    pub fn apply_selection(&mut self, selection: &RuleSelection) {
        for rules in self.rules.values_mut() {
            rules.retain(|rule| selection.allows(rule.id()));
        }
    }

    pub fn services(&self) -> Vec<String> {
        self.resource_types.keys().cloned().collect()
    }

    pub fn resource_types(&self, service: &str) -> Vec<String> {
        self.resource_types.get(service).cloned().unwrap_or_default()
    }

    pub fn rules_for(&self, service: &str, resource_type: &str) -> Vec<Arc<dyn Rule>> {
        self.rules
            .get(&(service.to_string(), resource_type.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn rule_ids(&self) -> BTreeSet<String> {
        self.rules
            .values()
            .flatten()
            .map(|rule| rule.id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A built-in check: one predicate, one finding
#[derive(Clone)]
pub struct Check {
    pub id: &'static str,
    pub service: &'static str,
    pub resource_type: &'static str,
    pub severity: Severity,
    pub title: &'static str,
    pub description: &'static str,
    pub pillars: &'static [&'static str],
    pub predicate: fn(&ResourceRecord) -> Result<bool, RuleError>,
}

impl Rule for Check {
    fn id(&self) -> &str {
        self.id
    }

    fn service(&self) -> &str {
        self.service
    }

    fn resource_type(&self) -> &str {
        self.resource_type
    }

    fn evaluate(&self, record: &ResourceRecord) -> Result<Vec<Finding>, RuleError> {
        if !(self.predicate)(record)? {
            return Ok(Vec::new());
        }
        let finding = Finding::for_record(record, self.id, self.severity, self.title, self.description)
            .with_pillars(self.pillars.iter().copied());
        Ok(vec![finding])
    }
}

fn bool_attr(record: &ResourceRecord, key: &str) -> Result<Option<bool>, RuleError> {
    match record.attribute(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(_) => Err(RuleError::MalformedAttribute {
            attribute: key.to_string(),
            expected: "bool",
        }),
    }
}

fn u64_attr(record: &ResourceRecord, key: &str) -> Result<Option<u64>, RuleError> {
    match record.attribute(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| RuleError::MalformedAttribute {
            attribute: key.to_string(),
            expected: "unsigned integer",
        }),
    }
}

fn str_attr<'a>(record: &'a ResourceRecord, key: &str) -> Result<Option<&'a str>, RuleError> {
    match record.attribute(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(RuleError::MalformedAttribute {
            attribute: key.to_string(),
            expected: "string",
        }),
    }
}

fn is_false(record: &ResourceRecord, key: &str) -> Result<bool, RuleError> {
    Ok(bool_attr(record, key)? == Some(false))
}

fn is_true(record: &ResourceRecord, key: &str) -> Result<bool, RuleError> {
    Ok(bool_attr(record, key)? == Some(true))
}

const OPEN_CIDRS: [&str; 2] = ["0.0.0.0/0", "::/0"];
const ADMIN_PORTS: [u64; 2] = [22, 3389];
const STALE_ACCESS_KEY_DAYS: u64 = 90;
const DEPRECATED_RUNTIMES: [&str; 9] = [
    "python2.7",
    "python3.6",
    "python3.7",
    "nodejs10.x",
    "nodejs12.x",
    "nodejs14.x",
    "ruby2.5",
    "dotnetcore2.1",
    "go1.x",
];

fn admin_port_open_to_world(record: &ResourceRecord) -> Result<bool, RuleError> {
    let Some(ingress) = record.attribute("ingress") else {
        return Ok(false);
    };
    let rules = ingress.as_array().ok_or_else(|| RuleError::MalformedAttribute {
        attribute: "ingress".to_string(),
        expected: "array",
    })?;

    for rule in rules {
        let cidr = rule.get("cidr").and_then(Value::as_str).unwrap_or_default();
        if !OPEN_CIDRS.contains(&cidr) {
            continue;
        }
        let from = rule.get("from_port").and_then(Value::as_u64).unwrap_or(0);
        let to = rule.get("to_port").and_then(Value::as_u64).unwrap_or(65535);
        if ADMIN_PORTS.iter().any(|port| (from..=to).contains(port)) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub static BUILTIN_CHECKS: &[Check] = &[
    Check {
        id: "S3_BUCKET_PUBLIC_ACCESS",
        service: "s3",
        resource_type: "bucket",
        severity: Severity::High,
        title: "S3 bucket without public access block",
        description: "Block Public Access is disabled, so ACLs or bucket policies can expose objects publicly.",
        pillars: &[PILLAR_SECURITY],
        predicate: |r| is_false(r, "public_access_block_enabled"),
    },
    Check {
        id: "S3_BUCKET_UNENCRYPTED",
        service: "s3",
        resource_type: "bucket",
        severity: Severity::Medium,
        title: "S3 bucket without default encryption",
        description: "Objects written without explicit encryption headers are stored unencrypted.",
        pillars: &[PILLAR_SECURITY],
        predicate: |r| is_false(r, "default_encryption_enabled"),
    },
    Check {
        id: "S3_BUCKET_VERSIONING_DISABLED",
        service: "s3",
        resource_type: "bucket",
        severity: Severity::Low,
        title: "S3 bucket versioning disabled",
        description: "Overwritten or deleted objects cannot be recovered.",
        pillars: &[PILLAR_RELIABILITY],
        predicate: |r| Ok(str_attr(r, "versioning")?.is_some_and(|status| status != "Enabled")),
    },
    Check {
        id: "IAM_USER_NO_MFA",
        service: "iam",
        resource_type: "user",
        severity: Severity::High,
        title: "IAM console user without MFA",
        description: "A user with console access has no MFA device attached.",
        pillars: &[PILLAR_SECURITY],
        predicate: |r| Ok(is_true(r, "console_access")? && is_false(r, "mfa_enabled")?),
    },
    Check {
        id: "IAM_ACCESS_KEY_STALE",
        service: "iam",
        resource_type: "user",
        severity: Severity::Medium,
        title: "IAM access key not rotated",
        description: "An active access key is older than 90 days.",
        pillars: &[PILLAR_SECURITY, PILLAR_OPERATIONS],
        predicate: |r| Ok(u64_attr(r, "access_key_age_days")?.is_some_and(|days| days > STALE_ACCESS_KEY_DAYS)),
    },
    Check {
        id: "EC2_SG_OPEN_ADMIN_PORT",
        service: "ec2",
        resource_type: "security_group",
        severity: Severity::Critical,
        title: "Security group exposes SSH or RDP to the internet",
        description: "An ingress rule allows 0.0.0.0/0 or ::/0 on port 22 or 3389.",
        pillars: &[PILLAR_SECURITY],
        predicate: admin_port_open_to_world,
    },
    Check {
        id: "EC2_VOLUME_UNENCRYPTED",
        service: "ec2",
        resource_type: "volume",
        severity: Severity::Medium,
        title: "EBS volume not encrypted",
        description: "Data at rest and snapshots of this volume are unencrypted.",
        pillars: &[PILLAR_SECURITY],
        predicate: |r| is_false(r, "encrypted"),
    },
    Check {
        id: "EC2_VOLUME_UNATTACHED",
        service: "ec2",
        resource_type: "volume",
        severity: Severity::Low,
        title: "EBS volume unattached",
        description: "The volume is not attached to any instance but still incurs storage cost.",
        pillars: &[PILLAR_COST],
        predicate: |r| Ok(str_attr(r, "state")? == Some("available")),
    },
    Check {
        id: "EC2_INSTANCE_IMDSV1",
        service: "ec2",
        resource_type: "instance",
        severity: Severity::Medium,
        title: "EC2 instance allows IMDSv1",
        description: "Instance metadata is reachable without session tokens.",
        pillars: &[PILLAR_SECURITY],
        predicate: |r| Ok(str_attr(r, "metadata_http_tokens")?.is_some_and(|tokens| tokens != "required")),
    },
    Check {
        id: "CLOUDTRAIL_LOGGING_DISABLED",
        service: "cloudtrail",
        resource_type: "trail",
        severity: Severity::High,
        title: "CloudTrail trail not logging",
        description: "API activity is not being recorded for this trail.",
        pillars: &[PILLAR_SECURITY, PILLAR_OPERATIONS],
        predicate: |r| is_false(r, "is_logging"),
    },
    Check {
        id: "CLOUDTRAIL_LOG_VALIDATION_DISABLED",
        service: "cloudtrail",
        resource_type: "trail",
        severity: Severity::Low,
        title: "CloudTrail log file validation disabled",
        description: "Tampering with delivered log files cannot be detected.",
        pillars: &[PILLAR_SECURITY],
        predicate: |r| is_false(r, "log_file_validation_enabled"),
    },
    Check {
        id: "RDS_PUBLICLY_ACCESSIBLE",
        service: "rds",
        resource_type: "db_instance",
        severity: Severity::Critical,
        title: "RDS instance publicly accessible",
        description: "The database endpoint resolves to a public address.",
        pillars: &[PILLAR_SECURITY],
        predicate: |r| is_true(r, "publicly_accessible"),
    },
    Check {
        id: "RDS_STORAGE_UNENCRYPTED",
        service: "rds",
        resource_type: "db_instance",
        severity: Severity::High,
        title: "RDS storage not encrypted",
        description: "Database storage, backups and replicas are unencrypted.",
        pillars: &[PILLAR_SECURITY],
        predicate: |r| is_false(r, "storage_encrypted"),
    },
    Check {
        id: "RDS_BACKUPS_DISABLED",
        service: "rds",
        resource_type: "db_instance",
        severity: Severity::High,
        title: "RDS automated backups disabled",
        description: "Backup retention is zero days, so point-in-time recovery is unavailable.",
        pillars: &[PILLAR_RELIABILITY],
        predicate: |r| Ok(u64_attr(r, "backup_retention_period")? == Some(0)),
    },
    Check {
        id: "RDS_NO_MULTI_AZ",
        service: "rds",
        resource_type: "db_instance",
        severity: Severity::Medium,
        title: "RDS instance is single-AZ",
        description: "An availability zone outage takes the database offline.",
        pillars: &[PILLAR_RELIABILITY, PILLAR_PERFORMANCE],
        predicate: |r| is_false(r, "multi_az"),
    },
    Check {
        id: "LAMBDA_DEPRECATED_RUNTIME",
        service: "lambda",
        resource_type: "function",
        severity: Severity::Medium,
        title: "Lambda function on deprecated runtime",
        description: "The runtime no longer receives security patches.",
        pillars: &[PILLAR_SECURITY, PILLAR_OPERATIONS],
        predicate: |r| Ok(str_attr(r, "runtime")?.is_some_and(|runtime| DEPRECATED_RUNTIMES.contains(&runtime))),
    },
];
