//! Report collection and JSON export.
//!
//! Agents' reports arrive on the scheduler thread; the recorder forwards them
//! over a channel so the harness can drain them once the run has finished.

use crossbeam::channel::{unbounded, Receiver, Sender};
use mwgrid_core::{ReportListener, RunSummary};
use mwgrid_env::{EntityId, Time};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// One report as delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub entity: u64,
    pub time: Time,
    pub report: String,
}

/// Listener half of a [`ReportLog`].
pub struct ReportRecorder {
    tx: Sender<ReportRecord>,
}

impl ReportListener for ReportRecorder {
    fn collect_report(&self, entity: EntityId, time: Time, report: &str) {
        // The log may already be gone when a detached run winds down
        let _ = self.tx.send(ReportRecord {
            entity: entity.as_u64(),
            time,
            report: report.to_string(),
        });
    }
}

/// Accumulates reports from any number of recorders.
pub struct ReportLog {
    tx: Sender<ReportRecord>,
    rx: Receiver<ReportRecord>,
    records: Vec<ReportRecord>,
}

impl Default for ReportLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportLog {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            records: Vec::new(),
        }
    }

    /// Creates a listener feeding this log.
    pub fn recorder(&self) -> Arc<ReportRecorder> {
        Arc::new(ReportRecorder { tx: self.tx.clone() })
    }

    /// Moves everything received so far into the log. Returns how many
    /// records were added.
    pub fn drain(&mut self) -> usize {
        let before = self.records.len();
        self.records.extend(self.rx.try_iter());
        self.records.len() - before
    }

    pub fn records(&self) -> &[ReportRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Entities that reported at least once.
    pub fn entities(&self) -> BTreeSet<u64> {
        self.records.iter().map(|r| r.entity).collect()
    }

    /// Distinct report times of `entity`, ascending.
    ///
    /// A time unit re-executed after a rollback may be reported twice; it
    /// is listed once.
    pub fn times(&self, entity: EntityId) -> Vec<Time> {
        let times: BTreeSet<Time> = self
            .records
            .iter()
            .filter(|r| r.entity == entity.as_u64())
            .map(|r| r.time)
            .collect();
        times.into_iter().collect()
    }

    /// Most recently delivered report of `entity`.
    pub fn latest(&self, entity: EntityId) -> Option<&ReportRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.entity == entity.as_u64())
    }

    /// Parses the latest report of `entity` as JSON.
    pub fn decode_latest<T: DeserializeOwned>(&self, entity: EntityId) -> Option<T> {
        self.latest(entity)
            .and_then(|r| serde_json::from_str(&r.report).ok())
    }
}

/// Complete export of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct RunExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Kernel counters, absent for runs that failed to start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,

    /// All reports in delivery order
    pub reports: Vec<ReportRecord>,
}

impl RunExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            passed: false,
            failure_reason: None,
            summary: None,
            reports: Vec::new(),
        }
    }

    /// Copies the drained contents of `log`.
    pub fn with_reports(mut self, log: &ReportLog) -> Self {
        self.reports = log.records().to_vec();
        self
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>, summary: Option<RunSummary>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.summary = summary;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_feeds_log() {
        let mut log = ReportLog::new();
        let recorder = log.recorder();
        recorder.collect_report(EntityId(3), 1, "a");
        recorder.collect_report(EntityId(4), 1, "b");
        recorder.collect_report(EntityId(3), 2, "c");
        assert!(log.is_empty());

        assert_eq!(log.drain(), 3);
        assert_eq!(log.times(EntityId(3)), vec![1, 2]);
        assert_eq!(log.latest(EntityId(3)).map(|r| r.report.as_str()), Some("c"));
        assert_eq!(log.entities().len(), 2);
        assert_eq!(log.drain(), 0);
    }

    #[test]
    fn test_reexecuted_time_listed_once() {
        let mut log = ReportLog::new();
        let recorder = log.recorder();
        recorder.collect_report(EntityId(1), 4, "{\"n\":1}");
        recorder.collect_report(EntityId(1), 4, "{\"n\":2}");
        log.drain();

        assert_eq!(log.times(EntityId(1)), vec![4]);
        let latest: serde_json::Value = log.decode_latest(EntityId(1)).unwrap();
        assert_eq!(latest["n"], 2);
        assert!(log.decode_latest::<serde_json::Value>(EntityId(9)).is_none());
    }

    #[test]
    fn test_export_writes_json() {
        let mut log = ReportLog::new();
        log.recorder().collect_report(EntityId(1), 1, "tick");
        log.drain();

        let mut export = RunExport::new("random_walk", 42).with_reports(&log);
        export.finalize(true, None, Some(RunSummary::default()));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["scenario"], "random_walk");
        assert_eq!(json["reports"][0]["report"], "tick");
        assert!(json.get("failure_reason").is_none());
    }
}
