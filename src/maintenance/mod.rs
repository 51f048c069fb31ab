use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::health::HealthTrend;
use crate::storage::{load_document, save_document, StateStore, MAINTENANCE_KEY};

/// Exhaustion further out than this is not scheduled.
const EXHAUSTION_HORIZON_HOURS: f64 = 24.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceKind {
    Restart,
    Cleanup,
    Optimize,
}

impl fmt::Display for MaintenanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MaintenanceKind::Restart => "restart",
            MaintenanceKind::Cleanup => "cleanup",
            MaintenanceKind::Optimize => "optimize",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Pending,
    Notified,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Memory,
    Disk,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Memory => f.write_str("Memory"),
            Resource::Disk => f.write_str("Disk"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: Uuid,
    pub agent: String,
    pub kind: MaintenanceKind,
    pub scheduled_at: DateTime<Utc>,
    pub reason: String,
    pub status: WindowStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    pub window: MaintenanceWindow,
    pub success: bool,
    pub notes: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExhaustionPrediction {
    pub resource: Resource,
    pub hours_until_exhaustion: f64,
    pub exhausted_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Schedule {
    windows: BTreeMap<String, Vec<MaintenanceWindow>>,
    #[serde(default)]
    history: VecDeque<MaintenanceRecord>,
}

/// Reason attached to a preventive restart window.
pub fn restart_reason(trend: &HealthTrend) -> String {
    format!(
        "Preventive restart (uptime: {:.1}h, errors: {:.2}%)",
        trend.uptime_hours,
        trend.error_rate * 100.0
    )
}

fn hours(h: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((h * 3_600_000.0) as i64)
}

/// Hours until `usage` reaches 100% at `growth` percent per hour, if that is
/// inside the scheduling horizon.
fn hours_to_exhaustion(usage: Option<f64>, growth: Option<f64>) -> Option<f64> {
    let (usage, growth) = (usage?, growth?);
    if growth <= 0.0 || usage >= 100.0 {
        return None;
    }
    let remaining = (100.0 - usage) / growth;
    (remaining > 0.0 && remaining <= EXHAUSTION_HORIZON_HOURS).then_some(remaining)
}

pub struct PredictiveScheduler {
    schedule: Mutex<Schedule>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    history_cap: usize,
    dirty: AtomicBool,
}

impl PredictiveScheduler {
    pub async fn load(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, history_cap: usize) -> Self {
        let schedule = match load_document::<Schedule>(store.as_ref(), MAINTENANCE_KEY).await {
            Ok(Some(schedule)) => {
                let pending: usize = schedule.windows.values().map(Vec::len).sum();
                info!("Loaded {} maintenance windows", pending);
                schedule
            }
            Ok(None) => Schedule::default(),
            Err(e) => {
                warn!("Starting with an empty maintenance schedule: {}", e);
                Schedule::default()
            }
        };

        Self {
            schedule: Mutex::new(schedule),
            store,
            clock,
            history_cap: history_cap.max(1),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn predict_restart_time(&self, trend: &HealthTrend) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let memory = trend.memory_percent.unwrap_or(0.0);

        if trend.error_rate > 0.2 {
            Some(now + ChronoDuration::minutes(30))
        } else if trend.uptime_hours > 48.0 {
            Some(now + ChronoDuration::hours(1))
        } else if trend.uptime_hours > 24.0 && (trend.error_rate > 0.1 || memory > 80.0) {
            Some(now + ChronoDuration::hours(6))
        } else {
            None
        }
    }

    /// Linear extrapolation of memory and disk growth.
    pub fn predict_resource_exhaustion(&self, trend: &HealthTrend) -> BTreeMap<Resource, ExhaustionPrediction> {
        let now = self.clock.now();
        let mut predictions = BTreeMap::new();

        let inputs = [
            (Resource::Memory, trend.memory_percent, trend.memory_growth_per_hour),
            (Resource::Disk, trend.disk_percent, trend.disk_growth_per_hour),
        ];
        for (resource, usage, growth) in inputs {
            if let Some(h) = hours_to_exhaustion(usage, growth) {
                predictions.insert(
                    resource,
                    ExhaustionPrediction {
                        resource,
                        hours_until_exhaustion: h,
                        exhausted_at: now + hours(h),
                    },
                );
            }
        }
        predictions
    }

    /// Runs both predictors for one agent and schedules what they find.
    /// Returns the windows that were created or moved earlier.
    pub async fn evaluate(&self, agent: &str, trend: &HealthTrend) -> Vec<MaintenanceWindow> {
        let mut scheduled = Vec::new();

        if let Some(at) = self.predict_restart_time(trend) {
            if let Some(window) = self.schedule(agent, MaintenanceKind::Restart, at, restart_reason(trend)).await {
                scheduled.push(window);
            }
        }

        let now = self.clock.now();
        for prediction in self.predict_resource_exhaustion(trend).into_values() {
            // clean up halfway to the projected exhaustion
            let at = now + hours(prediction.hours_until_exhaustion / 2.0);
            let reason = format!(
                "{} exhaustion predicted in {:.1}h",
                prediction.resource, prediction.hours_until_exhaustion
            );
            if let Some(window) = self.schedule(agent, MaintenanceKind::Cleanup, at, reason).await {
                scheduled.push(window);
            }
        }

        scheduled
    }

    /// Adds a window unless one of the same kind is already open for the
    /// agent. An open pending window is moved earlier when `at` precedes it.
    pub async fn schedule(
        &self,
        agent: &str,
        kind: MaintenanceKind,
        at: DateTime<Utc>,
        reason: String,
    ) -> Option<MaintenanceWindow> {
        let mut schedule = self.schedule.lock().await;
        let windows = schedule.windows.entry(agent.to_string()).or_default();

        let result = match windows.iter_mut().find(|w| w.kind == kind && w.status != WindowStatus::Completed) {
            Some(existing) if existing.status == WindowStatus::Pending && at < existing.scheduled_at => {
                existing.scheduled_at = at;
                existing.reason = reason;
                Some(existing.clone())
            }
            Some(existing) => {
                debug!(agent, kind = %kind, "Maintenance already scheduled for {}", existing.scheduled_at);
                None
            }
            None => {
                let window = MaintenanceWindow {
                    id: Uuid::new_v4(),
                    agent: agent.to_string(),
                    kind,
                    scheduled_at: at,
                    reason,
                    status: WindowStatus::Pending,
                    created_at: self.clock.now(),
                };
                windows.push(window.clone());
                Some(window)
            }
        };

        if let Some(ref window) = result {
            windows.sort_by_key(|w| w.scheduled_at);
            info!(
                agent,
                kind = %kind,
                "Maintenance scheduled for {}: {}",
                window.scheduled_at.format("%Y-%m-%d %H:%M:%S UTC"),
                window.reason
            );
            self.persist(&schedule).await;
        }
        result
    }

    /// Pending windows whose time has come, marked Notified.
    pub async fn take_due(&self) -> Vec<MaintenanceWindow> {
        let now = self.clock.now();
        let mut schedule = self.schedule.lock().await;
        let mut due = Vec::new();

        for window in schedule.windows.values_mut().flatten() {
            if window.status == WindowStatus::Pending && window.scheduled_at <= now {
                window.status = WindowStatus::Notified;
                due.push(window.clone());
            }
        }

        if !due.is_empty() {
            self.persist(&schedule).await;
        }
        due
    }

    /// Marks a Notified window Completed, moves it into the history and drops
    /// it from the schedule. A window still Pending was never handed out by
    /// `take_due` and stays where it is.
    pub async fn complete(&self, id: Uuid, success: bool, notes: impl Into<String>) -> Option<MaintenanceRecord> {
        let now = self.clock.now();
        let mut schedule = self.schedule.lock().await;

        let mut found = None;
        for windows in schedule.windows.values_mut() {
            if let Some(pos) = windows.iter().position(|w| w.id == id) {
                if windows[pos].status != WindowStatus::Notified {
                    warn!(
                        agent = %windows[pos].agent,
                        kind = %windows[pos].kind,
                        "Refusing to complete maintenance that was never notified"
                    );
                    return None;
                }
                found = Some(windows.remove(pos));
                break;
            }
        }
        let mut window = found?;
        window.status = WindowStatus::Completed;
        schedule.windows.retain(|_, windows| !windows.is_empty());

        let record = MaintenanceRecord {
            window,
            success,
            notes: notes.into(),
            completed_at: now,
        };
        schedule.history.push_back(record.clone());
        while schedule.history.len() > self.history_cap {
            schedule.history.pop_front();
        }

        self.persist(&schedule).await;
        Some(record)
    }

    /// Drops every open window for an agent that left the roster.
    pub async fn forget_agent(&self, agent: &str) {
        let mut schedule = self.schedule.lock().await;
        if schedule.windows.remove(agent).is_some() {
            self.persist(&schedule).await;
        }
    }

    pub async fn windows(&self, agent: Option<&str>) -> Vec<MaintenanceWindow> {
        let schedule = self.schedule.lock().await;
        let mut out: Vec<MaintenanceWindow> = schedule
            .windows
            .iter()
            .filter(|(name, _)| agent.map_or(true, |a| a == name.as_str()))
            .flat_map(|(_, windows)| windows.iter().cloned())
            .collect();
        out.sort_by_key(|w| w.scheduled_at);
        out
    }

    pub async fn history(&self, limit: usize) -> Vec<MaintenanceRecord> {
        self.schedule.lock().await.history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn flush_if_dirty(&self) {
        if self.dirty.load(Ordering::SeqCst) {
            let schedule = self.schedule.lock().await;
            self.persist(&schedule).await;
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let schedule = self.schedule.lock().await;
        save_document(self.store.as_ref(), MAINTENANCE_KEY, &*schedule).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn persist(&self, schedule: &Schedule) {
        match save_document(self.store.as_ref(), MAINTENANCE_KEY, schedule).await {
            Ok(()) => self.dirty.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!("Failed to persist the maintenance schedule, keeping it in memory: {}", e);
                self.dirty.store(true, Ordering::SeqCst);
            }
        }
    }
}
