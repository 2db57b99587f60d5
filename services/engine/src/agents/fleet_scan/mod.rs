//! Multi-Account Fleet Scan Agent
//!
//! Scans a fleet of cloud accounts, each reached through a short-lived
//! delegated credential, and merges the per-account results into a single
//! deduplicated report.
//!
//! ## Architecture
//!
//! - **Fleet Orchestrator**: priority-ordered account dispatch under a global limit
//! - **Account Scan Coordinator**: region x service units under a per-account limit
//! - **Service Scanner**: paginated enumeration plus rule evaluation
//! - **Credential Cache**: single-flight, expiry-aware delegated credentials
//!
//! ## Failure Model
//!
//! - Retries go through one backoff policy
//! - Failures stay in the narrowest scope (rule, resource type, account)
//! - Cancellation stops work between pages and keeps everything already collected

pub mod aggregator;
pub mod backoff;
pub mod coordinator;
pub mod discovery;
pub mod identity;
pub mod orchestrator;
pub mod progress;
pub mod rules;
pub mod scanner;
pub mod sink;
pub mod types;

pub use aggregator::{aggregate, RunInfo};
pub use backoff::{BackoffPolicy, ErrorClass, RetryDecision};
pub use coordinator::AccountScanCoordinator;
pub use discovery::{CloudResourceApi, InMemoryResourceApi, PageEnumerator, ResourcePage, RestResourceApi};
pub use identity::{CredentialBroker, CredentialCache, StaticCredentialBroker, StsCredentialBroker};
pub use orchestrator::{FleetOptions, FleetOrchestrator, FleetRun};
pub use progress::{ProgressBoard, ProgressHandle, ProgressSummary};
pub use rules::{FnRule, Rule, RuleCatalog, RuleError, RuleSelection};
pub use scanner::{ServiceScanOutcome, ServiceScanner, UnitStatus};
pub use sink::{FanoutSink, JsonFileSink, LogSink, ReportSink};
pub use types::{
    AccountResult, AccountStatus, AccountTarget, CloudError, DelegatedCredential, ErrorRecord, Finding,
    FleetReport, Priority, ResourceRecord, ScanError, ScanProgress, ScanState, Severity, TrustRelationship,
};
