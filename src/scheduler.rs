use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchExecutor, BatchSummary, OeBatchExecutor, OeBatchSummary};
use crate::config;
use crate::engine::PollingConfig;
use crate::runtime::RuntimeClient;
use crate::schedule::{is_due, next_execution_after, Schedule, ScheduleCategory};

/// Observability record for one scheduler tick.
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub job_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Process-wide scheduler state shared with the HTTP facade. The fields
/// are advisory; readers may observe them slightly stale.
#[derive(Default)]
pub struct SchedulerState {
    running: AtomicBool,
    pub total_cycles: AtomicU64,
    pub last_cycle: Mutex<Option<CycleRecord>>,
    stop: Notify,
}

impl SchedulerState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the loop as running. Returns false when it already was.
    pub fn mark_running(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    /// Ask the loop to stop: the current inter-tick sleep returns promptly
    /// and an in-flight tick is allowed to finish.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_waiters();
    }
}

/// One scheduler pass: list active schedules, filter the due ones, and
/// execute each in listing order.
pub struct Scheduler {
    client: RuntimeClient,
}

impl Scheduler {
    pub fn new(client: RuntimeClient) -> Self {
        Self { client }
    }

    /// Returns the tracking-job ids created during this cycle. A schedule
    /// listing failure fails the whole cycle; per-schedule failures are
    /// logged and skipped.
    pub async fn run_cycle(&self) -> anyhow::Result<Vec<String>> {
        let raw_schedules = self.client.list_schedules(Some(true)).await?;

        let mut schedules = Vec::new();
        for raw in &raw_schedules {
            match Schedule::parse(raw) {
                Ok(schedule) => schedules.push(schedule),
                Err(err) => warn!(?err, record = %raw, "dropping unparseable schedule"),
            }
        }

        let now = Utc::now();
        let due: Vec<Schedule> = schedules
            .into_iter()
            .filter(|schedule| is_due(schedule, now))
            .collect();
        if due.is_empty() {
            debug!("no schedules due for execution");
            return Ok(Vec::new());
        }
        info!(count = due.len(), "schedules due for execution");

        let mut created = Vec::new();
        for schedule in &due {
            if let Some(job_id) = self.execute_schedule(schedule).await {
                created.push(job_id);
            }
        }
        Ok(created)
    }

    /// Execute one schedule: create and locate its tracking job, route to
    /// the matching batch executor, then update the schedule statistics.
    pub async fn execute_schedule(&self, schedule: &Schedule) -> Option<String> {
        info!(
            schedule_id = schedule.id.as_str(),
            name = schedule.name.as_str(),
            "executing schedule"
        );

        let draft = job_draft(schedule);
        let job_id = match self.client.create_job_and_locate(&draft, &schedule.id).await {
            Ok(Some(job_id)) => job_id,
            Ok(None) => {
                error!(
                    schedule_id = schedule.id.as_str(),
                    "could not locate the created tracking job"
                );
                return None;
            }
            Err(err) => {
                error!(?err, schedule_id = schedule.id.as_str(), "failed to create tracking job");
                return None;
            }
        };
        info!(
            job_id = job_id.as_str(),
            schedule_id = schedule.id.as_str(),
            "created tracking job"
        );

        let success = match schedule.category {
            ScheduleCategory::PartialDataMissing => self.run_oe_batch(schedule, &job_id).await,
            ScheduleCategory::SolutionEmpty => self.run_solution_batch(schedule, &job_id).await,
        };

        let now = Utc::now();
        let mut patch = json!({
            "totalExecutions": schedule.total_executions + 1,
            "lastExecutionId": job_id,
            "lastExecutionDate": now.to_rfc3339(),
            "nextExecutionDate": next_execution_after(schedule, now).map(|next| next.to_rfc3339()),
        });
        if success {
            patch["successfulExecutions"] = (schedule.successful_executions + 1).into();
        } else {
            patch["failedExecutions"] = (schedule.failed_executions + 1).into();
        }
        if let Err(err) = self.client.update_schedule(&schedule.id, &patch).await {
            warn!(?err, schedule_id = schedule.id.as_str(), "failed to update schedule stats");
        }

        Some(job_id)
    }

    async fn run_solution_batch(&self, schedule: &Schedule, job_id: &str) -> bool {
        let discovered = match self
            .client
            .discover_solutions(schedule.category.as_str(), schedule.max_batch_size)
            .await
        {
            Ok(discovered) => discovered,
            Err(err) => {
                error!(?err, schedule_id = schedule.id.as_str(), "solution discovery failed");
                Vec::new()
            }
        };
        if discovered.is_empty() {
            info!(schedule_id = schedule.id.as_str(), "no solutions found");
            self.mark_job_empty(job_id, false).await;
            return true;
        }

        let ticket_map: HashMap<String, String> = discovered
            .iter()
            .map(|entry| (entry.solution_id.clone(), entry.ticket_id.clone()))
            .collect();
        let solution_ids: Vec<String> = discovered
            .into_iter()
            .map(|entry| entry.solution_id)
            .collect();

        let mut executor = BatchExecutor::new(
            self.client.clone(),
            Some(job_id.to_string()),
            Some(ticket_map),
            PollingConfig::from_env(),
        );
        executor
            .execute(solution_ids, Some(schedule.max_batch_size))
            .await;
        info!(
            schedule_id = schedule.id.as_str(),
            successful = executor.summary.successful,
            failed = executor.summary.failed,
            skipped = executor.summary.skipped,
            "solution batch complete"
        );
        executor.summary.failed == 0
    }

    async fn run_oe_batch(&self, schedule: &Schedule, job_id: &str) -> bool {
        let entries = match self.client.discover_services(schedule.max_batch_size).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(?err, schedule_id = schedule.id.as_str(), "oe discovery failed");
                Vec::new()
            }
        };
        if entries.is_empty() {
            info!(schedule_id = schedule.id.as_str(), "no oe services found");
            self.mark_job_empty(job_id, true).await;
            return true;
        }

        let mut executor =
            OeBatchExecutor::new(self.client.clone(), Some(job_id.to_string()), false);
        executor.execute(entries, Some(schedule.max_batch_size)).await;
        info!(
            schedule_id = schedule.id.as_str(),
            remediated = executor.summary.remediated,
            not_impacted = executor.summary.not_impacted,
            skipped = executor.summary.skipped,
            failed = executor.summary.failed,
            "oe batch complete"
        );
        executor.summary.failed == 0
    }

    async fn mark_job_empty(&self, job_id: &str, oe: bool) {
        let summary = if oe {
            serde_json::to_string(&OeBatchSummary::default()).unwrap_or_default()
        } else {
            serde_json::to_string(&BatchSummary::default()).unwrap_or_default()
        };
        let patch = json!({
            "state": "completed",
            "actualQuantity": 0,
            "x_summary": summary,
        });
        if let Err(err) = self.client.update_job(job_id, &patch).await {
            warn!(?err, job_id, "failed to finalise empty tracking job");
        }
    }
}

/// Draft for the tracking job materialised per schedule execution.
fn job_draft(schedule: &Schedule) -> Value {
    let execution_number = schedule.total_executions + 1;
    json!({
        "name": format!("{} - Execution {}", schedule.name, execution_number),
        "description": format!("Auto-created by schedule {}", schedule.id),
        "category": schedule.category.as_str(),
        "requestedQuantity": schedule.max_batch_size,
        "x_configuration": serde_json::to_string(&schedule.selection_criteria).unwrap_or_default(),
        "x_isRecurrent": true,
        "x_parentScheduleId": schedule.id,
        "x_executionNumber": execution_number,
    })
}

/// Start the periodic loop on the runtime. The loop exits when
/// [`SchedulerState::request_stop`] is called; only one tick is ever in
/// flight, and a long tick simply delays the next one.
pub fn spawn(client: RuntimeClient, state: Arc<SchedulerState>) {
    tokio::spawn(async move {
        run_loop(client, state).await;
    });
}

async fn run_loop(client: RuntimeClient, state: Arc<SchedulerState>) {
    let interval = Duration::from_secs(*config::SCHEDULER_INTERVAL_SECS);
    let scheduler = Scheduler::new(client);
    info!(interval_secs = interval.as_secs(), "scheduler loop started");

    while state.is_running() {
        let started_at = Utc::now();
        let tick_started = Instant::now();
        let cycle_number = state.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;

        let record = match scheduler.run_cycle().await {
            Ok(job_ids) => {
                info!(cycle_number, created = job_ids.len(), "scheduler cycle complete");
                CycleRecord {
                    cycle_number,
                    started_at,
                    duration_seconds: Some(tick_started.elapsed().as_secs_f64()),
                    job_ids,
                    error: None,
                }
            }
            Err(err) => {
                error!(?err, cycle_number, "scheduler cycle failed");
                CycleRecord {
                    cycle_number,
                    started_at,
                    duration_seconds: Some(tick_started.elapsed().as_secs_f64()),
                    job_ids: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        };
        *state.last_cycle.lock().await = Some(record);

        if !state.is_running() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = state.stop.notified() => {}
        }
    }
    info!("scheduler loop stopped");
}
