//! Report Sinks
//!
//! Receives the aggregated fleet report exactly once per run.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::types::{FleetReport, ScanError};

#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, report: &FleetReport) -> Result<(), ScanError>;
}

/// Writes the report as pretty-printed JSON
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn submit(&self, report: &FleetReport) -> Result<(), ScanError> {
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| ScanError::Sink(format!("failed to serialize report: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScanError::Sink(format!("failed to create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| ScanError::Sink(format!("failed to write {}: {}", self.path.display(), e)))?;

        info!(path = %self.path.display(), run_id = %report.run_id, "Fleet report written");
        Ok(())
    }
}

/// Logs a summary and the highest ranked findings
pub struct LogSink {
    top_findings: usize,
}

impl LogSink {
    pub fn new(top_findings: usize) -> Self {
        Self { top_findings }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl ReportSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn submit(&self, report: &FleetReport) -> Result<(), ScanError> {
        info!(
            run_id = %report.run_id,
            accounts = report.per_account.len(),
            done = report.status_counts.done,
            partial = report.status_counts.partial,
            failed = report.status_counts.failed,
            skipped = report.status_counts.skipped,
            resources = report.total_resources,
            findings = report.findings.len(),
            duplicates_removed = report.duplicates_removed,
            "Fleet report"
        );

        for finding in report.findings.iter().take(self.top_findings) {
            info!(
                severity = %finding.severity,
                rule = %finding.rule_id,
                account = %finding.account_id,
                region = %finding.region,
                resource = %finding.resource_id,
                "{}",
                finding.title
            );
        }

        for result in report.per_account.values().filter(|result| result.needs_rescan()) {
            warn!(
                account = %result.account_id,
                status = %result.status,
                last_error = result.last_error.as_deref().unwrap_or(""),
                "Account needs rescan"
            );
        }
        Ok(())
    }
}

/// Forwards the report to several sinks in order, stopping at the first failure
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ReportSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn submit(&self, report: &FleetReport) -> Result<(), ScanError> {
        for sink in &self.sinks {
            sink.submit(report)
                .await
                .map_err(|e| ScanError::Sink(format!("{}: {}", sink.name(), e)))?;
        }
        Ok(())
    }
}
