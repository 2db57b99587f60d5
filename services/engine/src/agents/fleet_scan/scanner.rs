//! Service Scanner
//!
//! Scans one service in one (account, region): enumerates every registered
//! resource type and runs the applicable rules on each record.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backoff::BackoffPolicy;
use super::discovery::{CloudResourceApi, EnumerationTarget, PageEnumerator};
use super::identity::CredentialCache;
use super::rules::{Rule, RuleCatalog};
use super::types::{AccountTarget, DelegatedCredential, Finding, ResourceRecord, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

/// Outcome of one (region, service) scan
#[derive(Debug, Clone)]
pub struct ServiceScanOutcome {
    pub region: String,
    pub service: String,
    pub findings: Vec<Finding>,
    pub resources: Vec<ResourceRecord>,
    pub errors: Vec<ScanError>,
    pub rule_failures: usize,
    pub resource_types_scanned: usize,
    pub resource_types_failed: usize,
    pub cancelled: bool,
}

impl ServiceScanOutcome {
    fn new(region: &str, service: &str) -> Self {
        Self {
            region: region.to_string(),
            service: service.to_string(),
            findings: Vec::new(),
            resources: Vec::new(),
            errors: Vec::new(),
            rule_failures: 0,
            resource_types_scanned: 0,
            resource_types_failed: 0,
            cancelled: false,
        }
    }

    /// Rule failures never affect the status
    pub fn status(&self) -> UnitStatus {
        if self.cancelled {
            UnitStatus::Cancelled
        } else if self.resource_types_failed == 0 {
            UnitStatus::Succeeded
        } else if self.resource_types_failed < self.resource_types_scanned {
            UnitStatus::Partial
        } else {
            UnitStatus::Failed
        }
    }

    pub fn error(&self) -> Option<&ScanError> {
        self.errors.last()
    }
}

pub struct ServiceScanner {
    api: Arc<dyn CloudResourceApi>,
    cache: Arc<CredentialCache>,
    catalog: Arc<RuleCatalog>,
    policy: BackoffPolicy,
}

impl ServiceScanner {
    pub fn new(api: Arc<dyn CloudResourceApi>, cache: Arc<CredentialCache>, catalog: Arc<RuleCatalog>) -> Self {
        Self {
            api,
            cache,
            catalog,
            policy: BackoffPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub async fn scan(
        &self,
        credential: Arc<DelegatedCredential>,
        account: Arc<AccountTarget>,
        region: &str,
        service: &str,
        cancel: &CancellationToken,
    ) -> ServiceScanOutcome {
        let mut outcome = ServiceScanOutcome::new(region, service);
        let resource_types = self.catalog.resource_types(service);
        if resource_types.is_empty() {
            warn!(service = %service, "No resource types registered for service");
            return outcome;
        }

        let mut credential = credential;
        for resource_type in resource_types {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            outcome.resource_types_scanned += 1;

            let rules = self.catalog.rules_for(service, &resource_type);
            let target = EnumerationTarget {
                account: Arc::clone(&account),
                service: service.to_string(),
                region: region.to_string(),
                resource_type: resource_type.clone(),
            };
            let mut enumerator = PageEnumerator::new(
                Arc::clone(&self.api),
                Arc::clone(&self.cache),
                Arc::clone(&credential),
                target,
            )
            .with_policy(self.policy)
            .with_cancellation(cancel.clone());

            while let Some(item) = enumerator.next().await {
                match item {
                    Ok(record) => {
                        evaluate_rules(&rules, &record, &mut outcome);
                        outcome.resources.push(record);
                    }
                    Err(ScanError::Cancelled) => {
                        outcome.cancelled = true;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            account = %account.account_id,
                            region = %region,
                            service = %service,
                            resource_type = %resource_type,
                            error = %err,
                            "Enumeration aborted"
                        );
                        outcome.resource_types_failed += 1;
                        outcome.errors.push(err);
                        break;
                    }
                }
            }

            credential = enumerator.credential();
            if outcome.cancelled {
                break;
            }
        }

        info!(
            account = %account.account_id,
            region = %region,
            service = %service,
            resources = outcome.resources.len(),
            findings = outcome.findings.len(),
            rule_failures = outcome.rule_failures,
            status = ?outcome.status(),
            "Service scan finished"
        );
        outcome
    }
}

/// A failing or panicking rule only loses its own findings for this record
fn evaluate_rules(rules: &[Arc<dyn Rule>], record: &ResourceRecord, outcome: &mut ServiceScanOutcome) {
    for rule in rules {
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(record))) {
            Ok(Ok(findings)) => {
                outcome.findings.extend(findings);
                continue;
            }
            Ok(Err(err)) => err.to_string(),
            Err(payload) => format!("rule panicked: {}", panic_message(payload.as_ref())),
        };

        outcome.rule_failures += 1;
        let err = ScanError::RuleEvaluation {
            rule_id: rule.id().to_string(),
            resource_id: record.resource_id.clone(),
            message: failure,
        };
        warn!(region = %record.region, service = %record.service, error = %err, "Rule evaluation failed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
