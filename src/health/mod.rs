pub mod process;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::agents::AgentDescriptor;
use crate::clock::{seconds_between, Clock};

pub use process::{ProcessControl, ProcessInfo, SysinfoProcessControl};

/// Case-insensitive substrings that mark a log line as a failure line.
pub const FAILURE_KEYWORDS: [&str; 5] = ["error", "exception", "traceback", "failed", "crash"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub agent: String,
    pub running: bool,
    pub pid: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub uptime: Option<Duration>,
    pub memory_percent: Option<f64>,
    /// Failure lines from the log tail, oldest first.
    pub recent_error_lines: Vec<String>,
    /// Byte offset in the log where each failure line ends.
    #[serde(skip)]
    pub error_line_ends: Vec<u64>,
    /// Bytes in the log at poll time.
    pub log_size: u64,
    pub tail_line_count: usize,
    pub last_log_line: Option<String>,
    pub status: HealthStatus,
    pub observed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.tail_line_count == 0 {
            0.0
        } else {
            self.recent_error_lines.len() as f64 / self.tail_line_count as f64
        }
    }

    /// Failure lines that end past `offset`. A log shorter than `offset` was
    /// rotated or truncated, so all of them count.
    pub fn errors_after(&self, offset: Option<u64>) -> &[String] {
        let Some(offset) = offset.filter(|o| *o <= self.log_size) else {
            return &self.recent_error_lines;
        };
        let first = self.error_line_ends.partition_point(|end| *end <= offset);
        &self.recent_error_lines[first..]
    }
}

pub fn is_failure_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    FAILURE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Read-only observer of process liveness and log tails.
pub struct HealthMonitor {
    process: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
    tail_lines: usize,
    tail_bytes: u64,
}

impl HealthMonitor {
    pub fn new(process: Arc<dyn ProcessControl>, clock: Arc<dyn Clock>, tail_lines: usize, tail_bytes: u64) -> Self {
        Self {
            process,
            clock,
            tail_lines: tail_lines.max(1),
            tail_bytes: tail_bytes.max(1),
        }
    }

    pub async fn poll(&self, agent: &AgentDescriptor) -> HealthSnapshot {
        let observed_at = self.clock.now();

        let process = self.process.find(agent.process_pattern()).await;
        let tail = read_tail_lines(agent.log_path(), self.tail_bytes, self.tail_lines).await;

        let (running, info, query_failed) = match process {
            Ok(Some(info)) => (true, Some(info), false),
            Ok(None) => (false, None, false),
            Err(e) => {
                warn!(agent = agent.name(), "Process query failed: {}", e);
                (false, None, true)
            }
        };

        let (log_size, lines, log_readable) = match tail {
            Ok((size, lines)) => (size, lines, true),
            Err(e) => {
                warn!(agent = agent.name(), "Log {:?} unreadable: {}", agent.log_path(), e);
                (0, Vec::new(), false)
            }
        };

        let (error_line_ends, recent_error_lines): (Vec<u64>, Vec<String>) = lines
            .iter()
            .filter(|l| is_failure_line(&l.text))
            .map(|l| (l.end_offset, l.text.clone()))
            .unzip();

        let status = if query_failed {
            HealthStatus::Unknown
        } else if !running {
            HealthStatus::Stopped
        } else if !log_readable {
            HealthStatus::Unknown
        } else if !recent_error_lines.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        debug!(
            agent = agent.name(),
            ?status,
            errors = recent_error_lines.len(),
            "Polled agent health"
        );

        HealthSnapshot {
            agent: agent.name().to_string(),
            running,
            pid: info.as_ref().map(|i| i.pid),
            uptime: info.as_ref().map(|i| i.uptime),
            memory_percent: info.as_ref().map(|i| i.memory_percent),
            recent_error_lines,
            error_line_ends,
            log_size,
            tail_line_count: lines.len(),
            last_log_line: lines.last().map(|l| l.text.clone()),
            status,
            observed_at,
        }
    }
}

/// Last `max_lines` lines within the final `max_bytes` of the file. A file that
/// does not exist yet reads as empty.
pub async fn read_tail(path: &Path, max_bytes: u64, max_lines: usize) -> std::io::Result<Vec<String>> {
    let (_, lines) = read_tail_lines(path, max_bytes, max_lines).await?;
    Ok(lines.into_iter().map(|l| l.text).collect())
}

#[derive(Debug, Clone)]
struct TailLine {
    end_offset: u64,
    text: String,
}

/// Tail lines with the byte offset each one ends at, plus the size read up to.
async fn read_tail_lines(path: &Path, max_bytes: u64, max_lines: usize) -> std::io::Result<(u64, Vec<TailLine>)> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, Vec::new())),
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;
    let size = start + buf.len() as u64;

    let mut segments: Vec<&[u8]> = buf.split(|b| *b == b'\n').collect();
    if buf.last() == Some(&b'\n') {
        segments.pop();
    }

    let mut offset = start;
    let mut lines = Vec::with_capacity(segments.len());
    for segment in segments {
        offset = (offset + segment.len() as u64 + 1).min(size);
        let text = String::from_utf8_lossy(segment);
        lines.push(TailLine {
            end_offset: offset,
            text: text.strip_suffix('\r').unwrap_or(&*text).to_string(),
        });
    }

    // first line is probably cut in half
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(max_lines);

    Ok((
        size,
        lines
            .into_iter()
            .skip(skip)
            .filter(|l| !l.text.trim().is_empty())
            .collect(),
    ))
}

/// Signals pushed by external detectors (anomaly detection, disk probes).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalSignals {
    pub error_rate: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub disk_growth_per_hour: Option<f64>,
    pub memory_growth_per_hour: Option<f64>,
}

/// The current and previous snapshot of one agent; nothing older is kept.
#[derive(Debug, Clone, Default)]
pub struct HealthHistory {
    current: Option<HealthSnapshot>,
    previous: Option<HealthSnapshot>,
}

impl HealthHistory {
    pub fn push(&mut self, snapshot: HealthSnapshot) {
        self.previous = self.current.take();
        self.current = Some(snapshot);
    }

    pub fn current(&self) -> Option<&HealthSnapshot> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&HealthSnapshot> {
        self.previous.as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthTrend {
    pub uptime_hours: f64,
    pub error_rate: f64,
    pub memory_percent: Option<f64>,
    pub memory_growth_per_hour: Option<f64>,
    pub disk_percent: Option<f64>,
    pub disk_growth_per_hour: Option<f64>,
}

impl HealthTrend {
    /// Derived from the latest two snapshots. `None` until one exists.
    pub fn from_history(history: &HealthHistory, signals: &ExternalSignals) -> Option<Self> {
        let current = history.current()?;

        let memory_growth_per_hour = signals.memory_growth_per_hour.or_else(|| {
            let previous = history.previous()?;
            // a new pid means the memory baseline reset
            if previous.pid != current.pid {
                return None;
            }
            let hours = seconds_between(previous.observed_at, current.observed_at) / 3600.0;
            match (previous.memory_percent, current.memory_percent) {
                (Some(before), Some(after)) if hours > 0.0 => Some((after - before) / hours),
                _ => None,
            }
        });

        Some(Self {
            uptime_hours: current.uptime.map(|u| u.as_secs_f64() / 3600.0).unwrap_or(0.0),
            error_rate: signals.error_rate.unwrap_or_else(|| current.error_rate()),
            memory_percent: signals.memory_percent.or(current.memory_percent),
            memory_growth_per_hour,
            disk_percent: signals.disk_percent,
            disk_growth_per_hour: signals.disk_growth_per_hour,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::process::MockProcessControl;
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::OrchestratorError;
    use std::io::Write;
    use tempfile::tempdir;

    fn running(pid: u32) -> ProcessInfo {
        ProcessInfo {
            pid,
            uptime: Duration::from_secs(7200),
            memory_bytes: 1024,
            memory_percent: 12.5,
        }
    }

    fn monitor(mock: MockProcessControl) -> HealthMonitor {
        HealthMonitor::new(Arc::new(mock), Arc::new(ManualClock::new(Utc::now())), 50, 64 * 1024)
    }

    #[tokio::test]
    async fn test_degraded_when_tail_has_failure_keywords() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("worker.log");
        let mut file = std::fs::File::create(&log).unwrap();
        writeln!(file, "starting up").unwrap();
        writeln!(file, "Traceback (most recent call last):").unwrap();
        writeln!(file, "ModuleNotFoundError: No module named 'foo'").unwrap();

        let mut mock = MockProcessControl::new();
        mock.expect_find().returning(|_| Ok(Some(running(42))));

        let agent = AgentDescriptor::new("worker-1", "worker_1.py", &log);
        let snapshot = monitor(mock).poll(&agent).await;

        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert_eq!(snapshot.pid, Some(42));
        assert_eq!(snapshot.recent_error_lines.len(), 2);
        assert_eq!(snapshot.tail_line_count, 3);
    }

    #[tokio::test]
    async fn test_stopped_and_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let mut mock = MockProcessControl::new();
        mock.expect_find().returning(|_| Ok(None));

        let agent = AgentDescriptor::new("worker-1", "worker_1.py", dir.path().join("absent.log"));
        let snapshot = monitor(mock).poll(&agent).await;

        assert_eq!(snapshot.status, HealthStatus::Stopped);
        assert!(!snapshot.running);
        assert!(snapshot.recent_error_lines.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_when_process_query_fails_or_log_unreadable() {
        let dir = tempdir().unwrap();

        let mut mock = MockProcessControl::new();
        mock.expect_find()
            .returning(|_| Err(OrchestratorError::ProcessControl("proc unavailable".into())));
        let agent = AgentDescriptor::new("worker-1", "worker_1.py", dir.path().join("a.log"));
        assert_eq!(monitor(mock).poll(&agent).await.status, HealthStatus::Unknown);

        // a directory cannot be read as a log file
        let mut mock = MockProcessControl::new();
        mock.expect_find().returning(|_| Ok(Some(running(7))));
        let agent = AgentDescriptor::new("worker-1", "worker_1.py", dir.path());
        assert_eq!(monitor(mock).poll(&agent).await.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_read_tail_bounds_lines_and_bytes() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("big.log");
        let mut file = std::fs::File::create(&log).unwrap();
        for i in 0..200 {
            writeln!(file, "line number {}", i).unwrap();
        }

        let lines = read_tail(&log, 64 * 1024, 50).await.unwrap();
        assert_eq!(lines.len(), 50);
        assert_eq!(lines.last().unwrap(), "line number 199");

        let lines = read_tail(&log, 40, 50).await.unwrap();
        assert!(lines.len() < 4);
        assert_eq!(lines.last().unwrap(), "line number 199");
    }

    #[tokio::test]
    async fn test_error_lines_are_located_by_offset() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("worker.log");
        let mut file = std::fs::File::create(&log).unwrap();
        writeln!(file, "ERROR upstream refused").unwrap();
        writeln!(file, "INFO retrying").unwrap();

        let mut mock = MockProcessControl::new();
        mock.expect_find().returning(|_| Ok(Some(running(42))));
        let monitor = monitor(mock);
        let agent = AgentDescriptor::new("worker-1", "worker_1.py", &log);

        let first = monitor.poll(&agent).await;
        assert_eq!(first.log_size, 37);
        assert_eq!(first.error_line_ends, vec![23]);
        assert!(first.errors_after(Some(first.log_size)).is_empty());

        // the same text logged again is a new failure
        writeln!(file, "ERROR upstream refused").unwrap();
        let second = monitor.poll(&agent).await;
        assert_eq!(second.recent_error_lines.len(), 2);
        assert_eq!(second.errors_after(Some(first.log_size)), ["ERROR upstream refused".to_string()]);
        assert_eq!(second.errors_after(None).len(), 2);

        // a rotated log starts over
        std::fs::write(&log, "ERROR upstream refused\n").unwrap();
        let rotated = monitor.poll(&agent).await;
        assert_eq!(rotated.errors_after(Some(second.log_size)).len(), 1);
    }

    #[test]
    fn test_trend_from_two_snapshots() {
        let t0 = Utc::now();
        let snapshot = |at: DateTime<Utc>, memory: f64| HealthSnapshot {
            agent: "worker-3".into(),
            running: true,
            pid: Some(9),
            uptime: Some(Duration::from_secs(50 * 3600)),
            memory_percent: Some(memory),
            recent_error_lines: vec!["error".into()],
            error_line_ends: vec![100],
            log_size: 400,
            tail_line_count: 20,
            last_log_line: None,
            status: HealthStatus::Degraded,
            observed_at: at,
        };

        let mut history = HealthHistory::default();
        history.push(snapshot(t0, 40.0));
        history.push(snapshot(t0 + chrono::Duration::minutes(30), 45.0));

        let trend = HealthTrend::from_history(&history, &ExternalSignals::default()).unwrap();
        assert_eq!(trend.uptime_hours, 50.0);
        assert_eq!(trend.error_rate, 0.05);
        assert_eq!(trend.memory_growth_per_hour, Some(10.0));

        let signals = ExternalSignals {
            error_rate: Some(0.3),
            ..Default::default()
        };
        let trend = HealthTrend::from_history(&history, &signals).unwrap();
        assert_eq!(trend.error_rate, 0.3);
    }
}
