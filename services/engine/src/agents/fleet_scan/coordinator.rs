//! Account Scan Coordinator
//!
//! Runs every (region, service) unit of one account under a per-account
//! concurrency limit and folds the outcomes into an `AccountResult`.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::identity::CredentialCache;
use super::progress::ProgressHandle;
use super::scanner::{ServiceScanOutcome, ServiceScanner, UnitStatus};
use super::types::{AccountResult, AccountStatus, AccountTarget, ErrorRecord, ScanError};

/// Default number of concurrent service scans per account
pub const DEFAULT_PER_ACCOUNT_CONCURRENCY: usize = 4;

enum UnitReport {
    Finished(ServiceScanOutcome),
    NotStarted,
}

#[derive(Debug, Default)]
struct UnitTally {
    succeeded: usize,
    partial: usize,
    failed: usize,
    interrupted: usize,
}

impl UnitTally {
    fn settle(&self, cancelled: bool) -> AccountStatus {
        let any_success = self.succeeded + self.partial > 0;
        if cancelled && self.interrupted > 0 {
            AccountStatus::Partial
        } else if self.failed == 0 && self.partial == 0 {
            AccountStatus::Done
        } else if !any_success {
            AccountStatus::Failed
        } else {
            AccountStatus::Partial
        }
    }
}

pub struct AccountScanCoordinator {
    cache: Arc<CredentialCache>,
    scanner: Arc<ServiceScanner>,
    services: Vec<String>,
    concurrency: usize,
}

impl AccountScanCoordinator {
    pub fn new(cache: Arc<CredentialCache>, scanner: Arc<ServiceScanner>, services: Vec<String>) -> Self {
        Self {
            cache,
            scanner,
            services,
            concurrency: DEFAULT_PER_ACCOUNT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    pub async fn run(
        &self,
        account: Arc<AccountTarget>,
        progress: ProgressHandle,
        cancel: CancellationToken,
    ) -> AccountResult {
        let units: Vec<(String, String)> = account
            .regions
            .iter()
            .flat_map(|region| {
                self.services
                    .iter()
                    .map(move |service| (region.clone(), service.clone()))
            })
            .collect();

        let mut result = AccountResult::begin(&account, units.len());
        progress.start(units.len());
        info!(
            account = %account.account_id,
            regions = account.regions.len(),
            units = units.len(),
            "Account scan started"
        );

        let credential = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
            credential = self.cache.get(&account) => credential,
        };
        let credential = match credential {
            Ok(credential) => credential,
            Err(ScanError::Cancelled) => {
                warn!(account = %account.account_id, "Account scan cancelled before credentials were issued");
                result.last_error = Some(ScanError::Cancelled.to_string());
                return self.conclude(&account, result, AccountStatus::Partial, &progress);
            }
            Err(err) => {
                error!(account = %account.account_id, error = %err, "Credential acquisition failed");
                result.errors.push(ErrorRecord::from(&err));
                return self.conclude(&account, result, AccountStatus::Failed, &progress);
            }
        };

        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (region, service) in units {
            let scanner = Arc::clone(&self.scanner);
            let cache = Arc::clone(&self.cache);
            let account = Arc::clone(&account);
            let credential = Arc::clone(&credential);
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return UnitReport::NotStarted,
                    permit = limiter.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return UnitReport::NotStarted,
                    },
                };
                if cancel.is_cancelled() {
                    return UnitReport::NotStarted;
                }
                // Units that queued behind the limiter re-check expiry
                let credential = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return UnitReport::NotStarted,
                    fresh = cache.get(&account) => fresh.unwrap_or_else(|err| {
                        warn!(
                            account = %account.account_id,
                            region = %region,
                            service = %service,
                            error = %err,
                            "Credential re-check failed, using the account credential"
                        );
                        credential
                    }),
                };
                UnitReport::Finished(scanner.scan(credential, account, &region, &service, &cancel).await)
            });
        }

        let mut tally = UnitTally::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(UnitReport::Finished(outcome)) => outcome,
                Ok(UnitReport::NotStarted) => {
                    tally.interrupted += 1;
                    progress.unit_interrupted();
                    continue;
                }
                Err(join_err) => {
                    error!(account = %account.account_id, error = %join_err, "Service scan task failed");
                    let message = format!("service scan task failed: {}", join_err);
                    result.errors.push(ErrorRecord::message(message.clone()));
                    tally.failed += 1;
                    progress.unit_finished(false, Some(message));
                    continue;
                }
            };

            let status = outcome.status();
            let last_error = outcome.error().map(ToString::to_string);
            absorb(&mut result, outcome);
            match status {
                UnitStatus::Succeeded => {
                    tally.succeeded += 1;
                    progress.unit_finished(true, None);
                }
                UnitStatus::Partial => {
                    tally.partial += 1;
                    progress.unit_finished(true, last_error);
                }
                UnitStatus::Failed => {
                    tally.failed += 1;
                    progress.unit_finished(false, last_error);
                }
                UnitStatus::Cancelled => {
                    tally.interrupted += 1;
                    progress.unit_interrupted();
                }
            }
        }

        result.services_completed = tally.succeeded + tally.partial;
        let status = tally.settle(cancel.is_cancelled());
        self.conclude(&account, result, status, &progress)
    }

    fn conclude(
        &self,
        account: &AccountTarget,
        mut result: AccountResult,
        status: AccountStatus,
        progress: &ProgressHandle,
    ) -> AccountResult {
        result.finish(status);
        progress.finish(status.into(), result.last_error.clone());
        info!(
            account = %account.account_id,
            status = %status,
            findings = result.findings.len(),
            resources = result.resources.len(),
            errors = result.errors.len(),
            "Account scan finished"
        );
        result
    }
}

fn absorb(result: &mut AccountResult, outcome: ServiceScanOutcome) {
    let ServiceScanOutcome {
        region,
        service,
        findings,
        resources,
        errors,
        rule_failures,
        ..
    } = outcome;

    result.findings.extend(findings);
    result.resources.extend(resources);
    result.rule_failures += rule_failures;
    result
        .errors
        .extend(errors.iter().map(|err| ErrorRecord::from(err).in_unit(&region, &service)));
}
