/*!
   Structured records of the commands run by relayers.

   A [`Reporter`] collects [`ExecRecord`]s from any number of
   [`ExecReporter`] handles and optionally appends each one as a JSON
   line to a [`LogSink`].
*/

use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::docker::ExecOutput;
use crate::error::Error;
use crate::util::file::LogSink;

/// One command executed in a container on behalf of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRecord {
    pub test_name: String,
    pub container: String,
    pub command: Vec<String>,
    pub started_at_ms: u128,
    pub duration_ms: u128,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

#[derive(Default)]
struct ReporterInner {
    sink: Option<LogSink>,
    records: Mutex<Vec<ExecRecord>>,
}

#[derive(Clone, Default)]
pub struct Reporter {
    inner: Arc<ReporterInner>,
}

/// A [`Reporter`] handle scoped to one test.
#[derive(Clone)]
pub struct ExecReporter {
    test_name: String,
    reporter: Reporter,
}

impl Reporter {
    /// A reporter that only keeps records in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: LogSink) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                sink: Some(sink),
                records: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn exec_reporter(&self, test_name: impl Into<String>) -> ExecReporter {
        ExecReporter {
            test_name: test_name.into(),
            reporter: self.clone(),
        }
    }

    pub fn records(&self) -> Vec<ExecRecord> {
        match self.inner.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, record: ExecRecord) {
        if let Some(sink) = &self.inner.sink {
            let line = serde_json::to_string(&record).unwrap_or_default();

            if let Err(e) = sink.write_line(&line) {
                warn!("failed to write exec record to {}: {}", sink.path().display(), e);
            }
        }

        match self.inner.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

fn unix_millis(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

impl ExecReporter {
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Record the outcome of `command`, which started at `started_at` and took `elapsed`.
    pub fn track_exec(
        &self,
        container: &str,
        command: &[&str],
        started_at: SystemTime,
        elapsed: Duration,
        result: &Result<ExecOutput, Error>,
    ) {
        let (exit_code, stdout, stderr, error) = match result {
            Ok(output) => (
                Some(output.exit_code),
                output.stdout.clone(),
                output.stderr.clone(),
                None,
            ),
            Err(e) => (None, String::new(), String::new(), Some(e.to_string())),
        };

        self.reporter.push(ExecRecord {
            test_name: self.test_name.clone(),
            container: container.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            started_at_ms: unix_millis(started_at),
            duration_ms: elapsed.as_millis(),
            exit_code,
            stdout,
            stderr,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path().join("exec.jsonl")).unwrap();
        let reporter = Reporter::with_sink(sink.clone());

        let exec = reporter.exec_reporter("ics");
        exec.track_exec(
            "hermes-ics-1",
            &["hermes", "create", "client"],
            SystemTime::now(),
            Duration::from_millis(12),
            &Ok(ExecOutput::success("{}")),
        );
        exec.track_exec(
            "hermes-ics-1",
            &["hermes", "start"],
            SystemTime::now(),
            Duration::from_millis(3),
            &Err(Error::assertion("boom".to_string())),
        );

        sink.close().unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let parsed: Vec<ExecRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(parsed, reporter.records());
        assert_eq!(parsed[0].exit_code, Some(0));
        assert_eq!(parsed[0].command, vec!["hermes", "create", "client"]);
        assert!(parsed[1].error.as_deref().unwrap().contains("boom"));
    }
}
