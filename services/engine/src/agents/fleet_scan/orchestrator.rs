//! Fleet Orchestrator
//!
//! Fans account scans out across the fleet under a global concurrency limit,
//! starting accounts in priority order, and hands the aggregated report to
//! the sink once every started account has terminated.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregator::{aggregate, RunInfo};
use super::coordinator::AccountScanCoordinator;
use super::progress::{ProgressBoard, ProgressHandle};
use super::sink::ReportSink;
use super::types::{AccountResult, AccountStatus, AccountTarget, FleetReport, ScanError, ScanProgress};

pub const DEFAULT_MAX_PARALLEL_ACCOUNTS: usize = 4;

#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub max_parallel_accounts: usize,
    /// Whole-run deadline; running accounts are cancelled, unstarted ones skipped
    pub timeout: Option<Duration>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            max_parallel_accounts: DEFAULT_MAX_PARALLEL_ACCOUNTS,
            timeout: None,
        }
    }
}

pub struct FleetOrchestrator {
    coordinator: Arc<AccountScanCoordinator>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl FleetOrchestrator {
    pub fn new(coordinator: AccountScanCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start a run in the background. Must be called inside a tokio runtime.
    pub fn start(&self, fleet: Vec<AccountTarget>, options: FleetOptions) -> FleetRun {
        let run_id = Uuid::new_v4();

        let (mut accounts, disabled): (Vec<AccountTarget>, Vec<AccountTarget>) =
            fleet.into_iter().partition(|account| account.enabled);
        for account in &disabled {
            debug!(account = %account.account_id, "Account disabled, not scheduled");
        }
        // Stable sort: equal priorities keep input order
        accounts.sort_by_key(|account| account.priority);
        let accounts: Vec<Arc<AccountTarget>> = accounts.into_iter().map(Arc::new).collect();

        let (board, handles) = ProgressBoard::register(accounts.iter().map(|account| account.as_ref()));
        let board = Arc::new(board);
        let cancel = CancellationToken::new();

        info!(
            run_id = %run_id,
            accounts = accounts.len(),
            disabled = disabled.len(),
            max_parallel_accounts = options.max_parallel_accounts,
            "Fleet scan started"
        );

        let dispatch = Dispatch {
            run_id,
            accounts,
            handles,
            coordinator: Arc::clone(&self.coordinator),
            sink: self.sink.clone(),
            options,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(dispatch.run());

        FleetRun {
            run_id,
            board,
            cancel,
            handle,
        }
    }

    pub async fn run_fleet(&self, fleet: Vec<AccountTarget>, options: FleetOptions) -> Result<FleetReport, ScanError> {
        self.start(fleet, options).wait().await
    }
}

/// Handle to an in-flight fleet run
pub struct FleetRun {
    run_id: Uuid,
    board: Arc<ProgressBoard>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<FleetReport, ScanError>>,
}

impl FleetRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Latest progress of every scheduled account; never blocks scanning
    pub fn snapshot(&self) -> BTreeMap<String, ScanProgress> {
        self.board.snapshot()
    }

    pub fn progress(&self) -> Arc<ProgressBoard> {
        Arc::clone(&self.board)
    }

    /// User abort: running accounts stop early, unstarted ones are skipped
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<FleetReport, ScanError> {
        self.handle
            .await
            .map_err(|e| ScanError::Internal(e.to_string()))?
    }
}

struct Dispatch {
    run_id: Uuid,
    accounts: Vec<Arc<AccountTarget>>,
    handles: HashMap<String, ProgressHandle>,
    coordinator: Arc<AccountScanCoordinator>,
    sink: Option<Arc<dyn ReportSink>>,
    options: FleetOptions,
    cancel: CancellationToken,
}

impl Dispatch {
    async fn run(self) -> Result<FleetReport, ScanError> {
        let Dispatch {
            run_id,
            accounts,
            mut handles,
            coordinator,
            sink,
            options,
            cancel,
        } = self;
        let started_at = Utc::now();

        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let timer = deadline.map(|deadline| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                warn!("Fleet timeout reached, cancelling running account scans");
                cancel.cancel();
            })
        });
        let expired = || cancel.is_cancelled() || deadline.is_some_and(|deadline| Instant::now() >= deadline);

        let limiter = Arc::new(Semaphore::new(options.max_parallel_accounts.max(1)));
        let mut running = JoinSet::new();
        let mut started: Vec<Arc<AccountTarget>> = Vec::new();
        let mut skipped: Vec<Arc<AccountTarget>> = Vec::new();

        let mut queue = accounts.into_iter();
        while let Some(account) = queue.next() {
            let permit = if expired() {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = Arc::clone(&limiter).acquire_owned() => permit.ok(),
                }
            };
            let permit = match permit {
                Some(permit) if !expired() => permit,
                _ => {
                    skipped.push(account);
                    skipped.extend(queue.by_ref());
                    break;
                }
            };

            let progress = handles
                .remove(&account.account_id)
                .unwrap_or_else(|| ProgressHandle::detached(account.account_id.clone()));
            info!(account = %account.account_id, priority = %account.priority, "Dispatching account scan");

            started.push(Arc::clone(&account));
            let coordinator = Arc::clone(&coordinator);
            let child = cancel.child_token();
            running.spawn(async move {
                let _permit = permit;
                coordinator.run(account, progress, child).await
            });
        }

        let mut results: Vec<AccountResult> = Vec::with_capacity(started.len() + skipped.len());
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Account scan task failed"),
            }
        }
        if let Some(timer) = timer {
            timer.abort();
        }

        let finished: HashSet<&str> = results.iter().map(|result| result.account_id.as_str()).collect();
        let lost: Vec<AccountResult> = started
            .iter()
            .filter(|account| !finished.contains(account.account_id.as_str()))
            .map(|account| {
                let mut result = AccountResult::begin(account, 0);
                result.last_error = Some("account scan task aborted".to_string());
                result.finish(AccountStatus::Failed);
                result
            })
            .collect();
        results.extend(lost);

        for account in &skipped {
            info!(account = %account.account_id, "Account never started, reporting as skipped");
            results.push(AccountResult::skipped(account));
        }

        coordinator.cache().clear();

        let report = aggregate(
            RunInfo {
                run_id,
                started_at,
                finished_at: Utc::now(),
            },
            results,
        );
        info!(
            run_id = %run_id,
            done = report.status_counts.done,
            partial = report.status_counts.partial,
            failed = report.status_counts.failed,
            skipped = report.status_counts.skipped,
            findings = report.findings.len(),
            "Fleet scan finished"
        );

        if let Some(sink) = sink {
            sink.submit(&report).await?;
        }
        Ok(report)
    }
}
