//! Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use fleetscan_engine::fleet_scan::{
    AccountScanCoordinator, AccountTarget, BackoffPolicy, CloudError, CloudResourceApi, CredentialBroker,
    CredentialCache, DelegatedCredential, Finding, FleetReport, FnRule, ReportSink, ResourcePage, ResourceRecord,
    RuleCatalog, ScanError, ServiceScanner, Severity, TrustRelationship,
};
use fleetscan_engine::fleet_scan::types::SecretMaterial;

/// Broker that counts exchanges, records call order and can be scripted to fail
pub struct CountingBroker {
    calls: AtomicUsize,
    order: Mutex<Vec<String>>,
    delay: Duration,
    ttl: chrono::Duration,
    scripted_failures: Mutex<HashMap<String, VecDeque<CloudError>>>,
    always_fail: Mutex<HashMap<String, CloudError>>,
}

impl CountingBroker {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            ttl: chrono::Duration::hours(1),
            scripted_failures: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn fail_times(self, account_id: &str, errors: Vec<CloudError>) -> Self {
        self.scripted_failures
            .lock()
            .unwrap()
            .insert(account_id.to_string(), errors.into());
        self
    }

    pub fn fail_always(self, account_id: &str, error: CloudError) -> Self {
        self.always_fail.lock().unwrap().insert(account_id.to_string(), error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Accounts in the order their first exchange started
    pub fn first_calls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.order
            .lock()
            .unwrap()
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CredentialBroker for CountingBroker {
    fn name(&self) -> &str {
        "counting"
    }

    async fn exchange(&self, account: &AccountTarget) -> Result<DelegatedCredential, CloudError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.order.lock().unwrap().push(account.account_id.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(err) = self.always_fail.lock().unwrap().get(&account.account_id) {
            return Err(err.clone());
        }
        let scripted = self
            .scripted_failures
            .lock()
            .unwrap()
            .get_mut(&account.account_id)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        let issued_at = Utc::now();
        Ok(DelegatedCredential {
            account_id: account.account_id.clone(),
            issued_at,
            expires_at: issued_at + self.ttl,
            secret: SecretMaterial::new(format!("KEY{}", call), "secret", Some(format!("session-{}", call))),
            session_label: format!("test-{}", account.account_id),
        })
    }
}

/// One scripted page of a listing
#[derive(Clone, Default)]
pub struct ScriptedPage {
    pub records: Vec<ResourceRecord>,
    pub delay: Duration,
    /// Returned (one per call) before the page succeeds
    pub errors: VecDeque<CloudError>,
    /// Returned on every call
    pub always: Option<CloudError>,
}

impl ScriptedPage {
    pub fn of(records: Vec<ResourceRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(mut self, errors: Vec<CloudError>) -> Self {
        self.errors = errors.into();
        self
    }

    pub fn failing(error: CloudError) -> Self {
        Self {
            always: Some(error),
            ..Default::default()
        }
    }
}

/// Resource API serving scripted pages keyed by account/service/region/resource_type.
///
/// Unscripted listings return one empty page.
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, Vec<ScriptedPage>>>,
    calls: Mutex<Vec<String>>,
    keys_seen: Mutex<Vec<String>>,
}

fn script_key(account: &str, service: &str, region: &str, resource_type: &str) -> String {
    format!("{}/{}/{}/{}", account, service, region, resource_type)
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, account: &str, service: &str, region: &str, resource_type: &str, pages: Vec<ScriptedPage>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(script_key(account, service, region, resource_type), pages);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Access key ids presented, in call order
    pub fn keys_seen(&self) -> Vec<String> {
        self.keys_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudResourceApi for ScriptedApi {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_page(
        &self,
        credential: &DelegatedCredential,
        service: &str,
        region: &str,
        resource_type: &str,
        page_token: Option<&str>,
    ) -> Result<ResourcePage, CloudError> {
        let index: usize = page_token.map(|token| token.parse().unwrap()).unwrap_or(0);
        let key = script_key(&credential.account_id, service, region, resource_type);
        self.calls.lock().unwrap().push(format!("{}#{}", key, index));
        self.keys_seen
            .lock()
            .unwrap()
            .push(credential.secret.access_key_id.clone());

        let (delay, outcome) = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&key) {
                None => (Duration::ZERO, Ok(ResourcePage::default())),
                Some(pages) => {
                    let total = pages.len();
                    let page = &mut pages[index];
                    let outcome = if let Some(err) = page.always.clone() {
                        Err(err)
                    } else if let Some(err) = page.errors.pop_front() {
                        Err(err)
                    } else {
                        Ok(ResourcePage {
                            records: page.records.clone(),
                            next_page_token: (index + 1 < total).then(|| (index + 1).to_string()),
                        })
                    };
                    (page.delay, outcome)
                }
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

pub fn account(id: &str, regions: &[&str]) -> AccountTarget {
    AccountTarget::new(
        id,
        TrustRelationship::Role {
            role_identifier: format!("arn:aws:iam::{}:role/FleetScan", id),
            external_id: None,
        },
    )
    .with_regions(regions.iter().copied())
}

/// Storage bucket record; `public` drives the test rule
pub fn bucket(account: &str, region: &str, id: &str, public: bool) -> ResourceRecord {
    ResourceRecord::new(account, region, "storage", "bucket", id).with_attribute("public", public)
}

/// Compute instance record; `open_ssh` drives the test rule
pub fn instance(account: &str, region: &str, id: &str, open_ssh: bool) -> ResourceRecord {
    ResourceRecord::new(account, region, "compute", "instance", id).with_attribute("open_ssh", open_ssh)
}

/// Catalog with one rule per test service
pub fn test_catalog() -> RuleCatalog {
    let mut catalog = RuleCatalog::new();
    catalog.register(FnRule::new("STORAGE_PUBLIC", "storage", "bucket", |record: &ResourceRecord| {
        let public = record.attribute("public").and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(if public {
            vec![Finding::for_record(record, "STORAGE_PUBLIC", Severity::High, "Public bucket", "").with_pillar("security")]
        } else {
            Vec::new()
        })
    }));
    catalog.register(FnRule::new("COMPUTE_OPEN_SSH", "compute", "instance", |record: &ResourceRecord| {
        let open = record.attribute("open_ssh").and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(if open {
            vec![Finding::for_record(record, "COMPUTE_OPEN_SSH", Severity::Critical, "SSH open", "").with_pillar("security")]
        } else {
            Vec::new()
        })
    }));
    catalog
}

pub fn fast_policy() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 5)
}

pub struct Harness {
    pub broker: Arc<CountingBroker>,
    pub api: Arc<ScriptedApi>,
    pub cache: Arc<CredentialCache>,
}

impl Harness {
    pub fn new(broker: CountingBroker, api: ScriptedApi) -> Self {
        let broker = Arc::new(broker);
        let api = Arc::new(api);
        let cache = Arc::new(CredentialCache::new(
            broker.clone() as Arc<dyn CredentialBroker>,
            fast_policy(),
            Duration::from_secs(120),
        ));
        Self { broker, api, cache }
    }

    pub fn scanner(&self, catalog: RuleCatalog) -> Arc<ServiceScanner> {
        Arc::new(
            ServiceScanner::new(self.api.clone() as Arc<dyn CloudResourceApi>, self.cache.clone(), Arc::new(catalog))
                .with_policy(fast_policy()),
        )
    }

    pub fn coordinator(&self, services: &[&str], concurrency: usize) -> AccountScanCoordinator {
        AccountScanCoordinator::new(
            self.cache.clone(),
            self.scanner(test_catalog()),
            services.iter().map(|s| s.to_string()).collect(),
        )
        .with_concurrency(concurrency)
    }
}

pub fn never_cancelled() -> CancellationToken {
    CancellationToken::new()
}

/// Sink that keeps every submitted report
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<FleetReport>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<FleetReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn submit(&self, report: &FleetReport) -> Result<(), ScanError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}
