//! Aggregator
//!
//! Folds terminated account results into the fleet report: dedupes findings
//! by key, ranks them and computes rollups over the deduplicated set.

use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::types::{AccountResult, AccountStatus, Finding, FleetReport, RollupBucket, Rollups, Severity, StatusCounts};

#[derive(Debug, Clone, Copy)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn aggregate(run: RunInfo, results: Vec<AccountResult>) -> FleetReport {
    let mut unique: HashMap<&str, &Finding> = HashMap::new();
    let mut raw = 0;
    for finding in results.iter().flat_map(|result| &result.findings) {
        raw += 1;
        match unique.entry(finding.finding_key.as_str()) {
            Entry::Occupied(mut kept) => {
                if finding.detected_at < kept.get().detected_at {
                    kept.insert(finding);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(finding);
            }
        }
    }

    let mut findings: Vec<Finding> = unique.into_values().cloned().collect();
    rank_findings(&mut findings);
    let duplicates_removed = raw - findings.len();
    let rollups = compute_rollups(&findings);

    let mut status_counts = StatusCounts::default();
    let mut total_resources = 0;
    let mut per_account = BTreeMap::new();
    for result in results {
        match result.status {
            AccountStatus::Done => status_counts.done += 1,
            AccountStatus::Partial => status_counts.partial += 1,
            AccountStatus::Failed => status_counts.failed += 1,
            AccountStatus::Skipped => status_counts.skipped += 1,
        }
        total_resources += result.resources.len();
        per_account.insert(result.account_id.clone(), result);
    }

    FleetReport {
        run_id: run.run_id,
        started_at: run.started_at,
        finished_at: run.finished_at,
        per_account,
        findings,
        rollups,
        status_counts,
        total_resources,
        duplicates_removed,
    }
}

/// Most severe first, then earliest detection
pub fn rank_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(a.detected_at.cmp(&b.detected_at))
            .then_with(|| a.finding_key.cmp(&b.finding_key))
    });
}

fn compute_rollups(findings: &[Finding]) -> Rollups {
    let mut rollups = Rollups::default();
    for severity in Severity::ALL {
        rollups.by_severity.insert(severity.to_string(), RollupBucket::default());
    }

    for finding in findings {
        rollups.by_service.entry(finding.service.clone()).or_default().count += 1;
        rollups
            .by_severity
            .entry(finding.severity.to_string())
            .or_default()
            .count += 1;
        // pillar_tags is a set, so a finding counts at most once per pillar
        for pillar in &finding.pillar_tags {
            rollups.by_pillar.entry(pillar.clone()).or_default().count += 1;
        }
    }

    let total = findings.len();
    for bucket in rollups
        .by_service
        .values_mut()
        .chain(rollups.by_severity.values_mut())
        .chain(rollups.by_pillar.values_mut())
    {
        bucket.percentage = percentage(bucket.count, total);
    }
    rollups
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 10_000.0 / total as f64).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::fleet_scan::types::{AccountTarget, ResourceRecord, TrustRelationship};
    use chrono::Duration;

    fn run() -> RunInfo {
        RunInfo {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn account(id: &str) -> AccountTarget {
        AccountTarget::new(
            id,
            TrustRelationship::StaticSecret {
                static_secret_ref: "X".to_string(),
            },
        )
    }

    fn finding(account_id: &str, service: &str, resource: &str, rule: &str, severity: Severity) -> Finding {
        let record = ResourceRecord::new(account_id, "us-east-1", service, "thing", resource);
        Finding::for_record(&record, rule, severity, rule, "")
    }

    fn result(id: &str, status: AccountStatus, findings: Vec<Finding>) -> AccountResult {
        let mut result = AccountResult::begin(&account(id), 1);
        result.findings = findings;
        result.finish(status);
        result
    }

    #[test]
    fn test_dedup_keeps_earliest_detection() {
        let base = Utc::now();
        let copies: Vec<Finding> = [3, 1, 2]
            .into_iter()
            .map(|minutes| {
                finding("111", "s3", "bucket-a", "S3_1", Severity::High).with_detected_at(base + Duration::minutes(minutes))
            })
            .collect();

        let report = aggregate(
            run(),
            vec![
                result("111", AccountStatus::Done, copies[..2].to_vec()),
                result("222", AccountStatus::Done, copies[2..].to_vec()),
            ],
        );

        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].detected_at, base + Duration::minutes(1));
        assert_eq!(report.duplicates_removed, 2);
        assert_eq!(report.rollups.by_service["s3"].count, 1);
        assert_eq!(report.rollups.by_severity["high"].count, 1);
    }

    #[test]
    fn test_rollups_and_percentages() {
        let findings = vec![
            finding("111", "s3", "a", "R1", Severity::Critical).with_pillars(["security", "reliability"]),
            finding("111", "s3", "b", "R1", Severity::Low).with_pillar("security"),
            finding("111", "rds", "c", "R2", Severity::Low).with_pillar("reliability"),
            finding("111", "iam", "d", "R3", Severity::Medium),
        ];
        let report = aggregate(run(), vec![result("111", AccountStatus::Done, findings)]);
        let rollups = &report.rollups;

        assert_eq!(rollups.by_service["s3"], RollupBucket { count: 2, percentage: 50.0 });
        assert_eq!(rollups.by_service["iam"].percentage, 25.0);
        assert_eq!(rollups.by_severity["low"].count, 2);
        assert_eq!(rollups.by_severity["high"], RollupBucket::default());
        assert_eq!(rollups.by_pillar["security"].count, 2);
        assert_eq!(rollups.by_pillar["reliability"].count, 2);
        assert!(!rollups.by_pillar.contains_key("cost_optimization"));

        let service_total: usize = rollups.by_service.values().map(|b| b.count).sum();
        let severity_total: usize = rollups.by_severity.values().map(|b| b.count).sum();
        assert_eq!(service_total, 4);
        assert_eq!(severity_total, 4);
    }

    #[test]
    fn test_ranking_and_status_counts() {
        let base = Utc::now();
        let findings = vec![
            finding("111", "s3", "a", "LOW", Severity::Low).with_detected_at(base),
            finding("111", "s3", "b", "CRIT_LATE", Severity::Critical).with_detected_at(base + Duration::seconds(5)),
            finding("111", "s3", "c", "CRIT_EARLY", Severity::Critical).with_detected_at(base),
        ];
        let report = aggregate(
            run(),
            vec![
                result("111", AccountStatus::Partial, findings),
                result("222", AccountStatus::Failed, vec![]),
                AccountResult::skipped(&account("333")),
                result("444", AccountStatus::Done, vec![]),
            ],
        );

        let order: Vec<&str> = report.findings.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(order, vec!["CRIT_EARLY", "CRIT_LATE", "LOW"]);
        assert_eq!(
            report.status_counts,
            StatusCounts {
                done: 1,
                partial: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert_eq!(report.accounts_to_rescan(), vec!["111", "222", "333"]);
    }

    #[test]
    fn test_empty_fleet() {
        let report = aggregate(run(), Vec::new());
        assert!(report.findings.is_empty());
        assert_eq!(report.rollups.by_severity["critical"].percentage, 0.0);
        assert!(report.per_account.is_empty());
    }
}
