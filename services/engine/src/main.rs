//! Fleet Scan - Standalone Binary
//!
//! Scans every enabled account of a fleet configuration, logs progress while
//! the run is in flight and writes the aggregated report.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fleetscan_engine::config::FleetConfig;
use fleetscan_engine::fleet_scan::{
    AccountScanCoordinator, CloudResourceApi, CredentialBroker, CredentialCache, FanoutSink, FleetOrchestrator,
    FleetReport, InMemoryResourceApi, JsonFileSink, LogSink, ReportSink, RestResourceApi, RuleCatalog,
    ServiceScanner, StaticCredentialBroker, StsCredentialBroker,
};

/// Fleet Scan - multi-account cloud resource scanner
#[derive(Parser, Debug)]
#[command(name = "fleet-scan", version, about)]
struct Args {
    /// Fleet configuration file (JSON)
    #[arg(long, env = "FLEET_CONFIG")]
    config: PathBuf,

    /// Base URL of the inventory gateway
    #[arg(long, env = "INVENTORY_API_URL")]
    inventory_url: Option<String>,

    /// Offline inventory snapshot (JSON array of resource records)
    #[arg(long, conflicts_with = "inventory_url")]
    inventory_file: Option<PathBuf>,

    /// Page size used when serving an offline inventory
    #[arg(long, default_value = "100")]
    inventory_page_size: usize,

    /// Projected web identity token exchanged for account roles
    #[arg(
        long,
        env = "AWS_WEB_IDENTITY_TOKEN_FILE",
        default_value = "/var/run/secrets/eks.amazonaws.com/serviceaccount/token"
    )]
    web_identity_token_file: PathBuf,

    /// Region of the STS endpoint
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    sts_region: String,

    /// Issue synthetic in-process credentials instead of calling STS
    #[arg(long, default_value = "false")]
    offline_credentials: bool,

    /// Write the report to this file
    #[arg(long, env = "FLEET_REPORT_PATH")]
    output: Option<PathBuf>,

    /// Override scan.max_parallel_accounts
    #[arg(long, env = "MAX_PARALLEL_ACCOUNTS")]
    max_parallel_accounts: Option<usize>,

    /// Override scan.per_account_concurrency
    #[arg(long)]
    per_account_concurrency: Option<usize>,

    /// Override scan.timeout_secs
    #[arg(long, env = "FLEET_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Previous report; only its non-done accounts are scanned
    #[arg(long)]
    retry_from: Option<PathBuf>,

    /// Progress log interval in seconds
    #[arg(long, default_value = "30", env = "PROGRESS_INTERVAL")]
    progress_interval: u64,

    /// Validate configuration and print the plan without scanning
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .json()
        .init();

    let args = Args::parse();

    let mut config = FleetConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load fleet configuration {}", args.config.display()))?;
    if let Some(limit) = args.max_parallel_accounts {
        config.scan.max_parallel_accounts = limit;
    }
    if let Some(limit) = args.per_account_concurrency {
        config.scan.per_account_concurrency = limit;
    }
    if let Some(timeout) = args.timeout_secs {
        config.scan.timeout_secs = Some(timeout);
    }
    config.validate().context("Invalid configuration after CLI overrides")?;

    let mut accounts = config.accounts.clone();
    if let Some(previous) = &args.retry_from {
        let rescan = load_rescan_set(previous)?;
        accounts.retain(|account| rescan.contains(&account.account_id));
        info!(previous = %previous.display(), accounts = accounts.len(), "Retrying accounts from previous report");
    }

    info!(
        accounts = accounts.iter().filter(|account| account.enabled).count(),
        services = ?config.services,
        max_parallel_accounts = config.scan.max_parallel_accounts,
        per_account_concurrency = config.scan.per_account_concurrency,
        "Starting Fleet Scan"
    );

    let mut catalog = RuleCatalog::builtin();
    catalog.apply_selection(&config.rules);
    for service in &config.services {
        if catalog.resource_types(service).is_empty() {
            warn!(service = %service, "No rules registered for service, it will be skipped");
        }
    }
    info!(rules = catalog.len(), "Rule catalog loaded");

    if args.dry_run {
        for account in accounts.iter().filter(|account| account.enabled) {
            info!(
                account = %account.account_id,
                name = %account.label(),
                priority = %account.priority,
                regions = ?account.regions,
                "[DRY RUN] Would scan account"
            );
        }
        return Ok(());
    }

    let broker: Arc<dyn CredentialBroker> = if args.offline_credentials {
        Arc::new(StaticCredentialBroker::default())
    } else {
        Arc::new(StsCredentialBroker::new(&args.sts_region, &args.web_identity_token_file)?)
    };

    let api: Arc<dyn CloudResourceApi> = match (&args.inventory_url, &args.inventory_file) {
        (Some(url), _) => Arc::new(RestResourceApi::new(url)?),
        (None, Some(path)) => Arc::new(InMemoryResourceApi::from_json_file(path, args.inventory_page_size)?),
        (None, None) => bail!("Either --inventory-url or --inventory-file is required"),
    };

    let policy = config.scan.backoff.policy();
    let cache = Arc::new(CredentialCache::new(broker, policy, config.safety_margin()));
    let scanner = ServiceScanner::new(api, Arc::clone(&cache), Arc::new(catalog)).with_policy(policy);
    let coordinator = AccountScanCoordinator::new(cache, Arc::new(scanner), config.services.clone())
        .with_concurrency(config.scan.per_account_concurrency);

    let mut sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::new(LogSink::default())];
    if let Some(path) = &args.output {
        sinks.push(Arc::new(JsonFileSink::new(path)));
    }
    let orchestrator = FleetOrchestrator::new(coordinator).with_sink(Arc::new(FanoutSink::new(sinks)));

    let run = orchestrator.start(accounts, config.fleet_options());
    info!(run_id = %run.run_id(), "Fleet run dispatched");

    let board = run.progress();
    let progress_interval = Duration::from_secs(args.progress_interval.max(1));
    let reporter = tokio::spawn(async move {
        let mut ticker = interval(progress_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let summary = board.summary();
            info!(
                pending = summary.pending,
                running = summary.running,
                done = summary.done,
                partial = summary.partial,
                failed = summary.failed,
                "Fleet progress"
            );
        }
    });

    let abort = run.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling fleet run");
            abort.cancel();
        }
    });

    let report = run.wait().await;
    reporter.abort();
    let report = report.context("Fleet run failed")?;

    let rescan = report.accounts_to_rescan();
    if !rescan.is_empty() {
        warn!(accounts = ?rescan, "Some accounts did not complete cleanly");
    }
    Ok(())
}

/// Accounts a previous report marked as not done
fn load_rescan_set(path: &Path) -> Result<HashSet<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read previous report {}", path.display()))?;
    let report: FleetReport = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse previous report {}", path.display()))?;

    Ok(report
        .accounts_to_rescan()
        .into_iter()
        .map(ToString::to_string)
        .collect())
}
