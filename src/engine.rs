use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config;
use crate::runtime::{failure_message, normalize_success, truthy_flag, RuntimeClient};
use crate::state::{ItemState, SolutionState, StateMachine, TransitionRecord};

pub const STEP_VALIDATE: &str = "VALIDATE";
pub const STEP_DELETE: &str = "DELETE";
pub const STEP_MIGRATE: &str = "MIGRATE";
pub const STEP_POLL: &str = "POLL";
pub const STEP_POST_UPDATE: &str = "POST_UPDATE";

// Basket stages that block automated remediation.
const SENSITIVE_STAGES: [&str; 2] = ["Order Enrichment", "Submitted"];
const MIN_BASKET_AGE_DAYS: i64 = 60;

/// Exponential-backoff parameters for the migration-status poll loop.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: f64,
    pub max_duration: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_duration: Duration::from_secs(1800),
        }
    }
}

impl PollingConfig {
    pub fn from_env() -> Self {
        Self {
            initial_delay: Duration::from_secs_f64(*config::REMEDIATION_INITIAL_DELAY),
            poll_interval: Duration::from_secs_f64(*config::REMEDIATION_POLL_INTERVAL),
            max_interval: Duration::from_secs_f64(*config::REMEDIATION_MAX_INTERVAL),
            backoff_factor: *config::REMEDIATION_BACKOFF_FACTOR,
            max_duration: Duration::from_secs_f64(*config::REMEDIATION_MAX_DURATION),
        }
    }
}

/// Outcome of one remediation step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub action: &'static str,
    pub success: bool,
    pub duration_ms: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Final result for one solution.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationOutcome {
    pub item_id: String,
    pub success: bool,
    pub final_state: SolutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepResult>,
    pub state_history: Vec<TransitionRecord>,
    pub total_duration_ms: u64,
}

/// Invoked at step boundaries: before each step with `(action, true, 0)`
/// for progress display, and after it with the step's outcome.
pub type StepCallback<'a> = &'a (dyn Fn(&'static str, bool, u64) + Send + Sync);

#[derive(Default)]
pub struct RemediateOptions<'a> {
    /// Start directly at DELETE, marking validation as skipped by the caller.
    pub skip_validation: bool,
    /// Override the default post-update field writes wholesale.
    pub sfdc_updates: Option<Value>,
    pub on_step: Option<StepCallback<'a>>,
}

/// Decide MACD eligibility from the validation response's details.
/// Returns the ineligibility reason, or `None` when remediation may
/// proceed.
pub fn should_skip_macd(macd_details: &Value) -> Option<String> {
    if !truthy_flag(macd_details.get("macdBasketExists")) {
        return None;
    }

    let baskets = match macd_details.get("basketDetails").and_then(Value::as_array) {
        Some(baskets) if !baskets.is_empty() => baskets,
        // Fail safe: a basket reportedly exists but nothing is known about it.
        _ => return Some("MACD basket exists but basket details are unavailable".to_string()),
    };

    let sensitive: Vec<&str> = baskets
        .iter()
        .filter_map(|basket| basket.get("basketStage").and_then(Value::as_str))
        .filter(|stage| SENSITIVE_STAGES.contains(stage))
        .collect();
    if !sensitive.is_empty() {
        return Some(format!(
            "MACD basket in sensitive stage(s): {}",
            sensitive.join(", ")
        ));
    }

    let youngest = baskets
        .iter()
        .filter_map(|basket| basket.get("basketAgeInDays").and_then(Value::as_i64))
        .min();
    if let Some(age) = youngest {
        if age < MIN_BASKET_AGE_DAYS {
            return Some(format!(
                "MACD basket is {age} days old, below the {MIN_BASKET_AGE_DAYS}-day threshold"
            ));
        }
    }

    None
}

/// Drives a single solution through the five-step remediation flow:
/// VALIDATE, DELETE, MIGRATE, POLL (exponential backoff), POST_UPDATE.
pub struct RemediationEngine<'a> {
    client: &'a RuntimeClient,
    polling: PollingConfig,
}

impl<'a> RemediationEngine<'a> {
    pub fn new(client: &'a RuntimeClient, polling: PollingConfig) -> Self {
        Self { client, polling }
    }

    pub async fn remediate(
        &self,
        solution_id: &str,
        opts: RemediateOptions<'_>,
    ) -> RemediationOutcome {
        let started = Instant::now();
        let mut machine = StateMachine::<SolutionState>::new(solution_id);
        let mut steps: Vec<StepResult> = Vec::new();
        let mut failed_at: Option<&'static str> = None;
        let mut job_id: Option<String> = None;

        self.run_flow(
            solution_id,
            &opts,
            &mut machine,
            &mut steps,
            &mut failed_at,
            &mut job_id,
        )
        .await;

        let final_state = machine.current();
        let outcome = RemediationOutcome {
            item_id: solution_id.to_string(),
            success: final_state == SolutionState::Completed,
            final_state,
            failed_at,
            error: machine.error().map(str::to_string),
            steps,
            state_history: machine.history().to_vec(),
            total_duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            solution_id,
            final_state = final_state.as_str(),
            duration_ms = outcome.total_duration_ms,
            "solution remediation finished"
        );
        outcome
    }

    async fn run_flow(
        &self,
        solution_id: &str,
        opts: &RemediateOptions<'_>,
        machine: &mut StateMachine<SolutionState>,
        steps: &mut Vec<StepResult>,
        failed_at: &mut Option<&'static str>,
        job_id: &mut Option<String>,
    ) {
        use SolutionState::*;

        // VALIDATE
        notify(opts, STEP_VALIDATE, true, 0);
        if opts.skip_validation {
            if !advance(machine, Validating, "validation skipped by caller")
                || !advance(machine, Validated, "validation skipped by caller")
            {
                *failed_at = Some(STEP_VALIDATE);
                return;
            }
            steps.push(StepResult {
                action: STEP_VALIDATE,
                success: true,
                duration_ms: 0,
                message: "validation skipped by caller".to_string(),
                job_id: None,
                status: None,
            });
            notify(opts, STEP_VALIDATE, true, 0);
        } else {
            let step_started = Instant::now();
            if !advance(machine, Validating, "starting validation") {
                *failed_at = Some(STEP_VALIDATE);
                return;
            }
            let (success, message) = match self.client.get_solution_info(solution_id).await {
                Err(err) => {
                    let message = err.to_string();
                    let _ = machine.transition(Failed, &message);
                    (false, message)
                }
                Ok(info) if !normalize_success(&info) => {
                    let message = failure_message(&info, "validation rejected by runtime");
                    let _ = machine.transition(Failed, &message);
                    (false, message)
                }
                Ok(info) => {
                    let macd = info
                        .get("macdDetails")
                        .or_else(|| info.get("macd_details"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    match should_skip_macd(&macd) {
                        Some(reason) => {
                            let _ = machine.transition(Skipped, &reason);
                            (false, reason)
                        }
                        None => {
                            if !advance(machine, Validated, "eligible for remediation") {
                                (false, "state error".to_string())
                            } else {
                                (true, "solution validated".to_string())
                            }
                        }
                    }
                }
            };
            let duration_ms = step_started.elapsed().as_millis() as u64;
            steps.push(StepResult {
                action: STEP_VALIDATE,
                success,
                duration_ms,
                message,
                job_id: None,
                status: None,
            });
            notify(opts, STEP_VALIDATE, success, duration_ms);
            if machine.current() == Failed {
                *failed_at = Some(STEP_VALIDATE);
            }
            if machine.is_terminal() || machine.current() != Validated {
                return;
            }
        }

        // DELETE
        notify(opts, STEP_DELETE, true, 0);
        let step_started = Instant::now();
        if !advance(machine, Deleting, "deleting solution-management data") {
            *failed_at = Some(STEP_DELETE);
            return;
        }
        let (success, message) = match self.client.delete_solution(solution_id).await {
            Ok(resp) if normalize_success(&resp) => (true, "solution data deleted".to_string()),
            Ok(resp) => (false, failure_message(&resp, "delete rejected by runtime")),
            Err(err) => (false, err.to_string()),
        };
        let duration_ms = step_started.elapsed().as_millis() as u64;
        steps.push(StepResult {
            action: STEP_DELETE,
            success,
            duration_ms,
            message: message.clone(),
            job_id: None,
            status: None,
        });
        notify(opts, STEP_DELETE, success, duration_ms);
        if !success {
            let _ = machine.transition(DeleteFailed, &message);
            let _ = machine.transition(Failed, &message);
            *failed_at = Some(STEP_DELETE);
            return;
        }

        // MIGRATE
        notify(opts, STEP_MIGRATE, true, 0);
        let step_started = Instant::now();
        if !advance(machine, Migrating, "requesting migration") {
            *failed_at = Some(STEP_MIGRATE);
            return;
        }
        let (success, message) = match self.client.migrate_solution(solution_id).await {
            Ok(resp) if normalize_success(&resp) => {
                *job_id = resp
                    .get("jobId")
                    .or_else(|| resp.get("job_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                (true, "migration requested".to_string())
            }
            Ok(resp) => (false, failure_message(&resp, "migration rejected by runtime")),
            Err(err) => (false, err.to_string()),
        };
        let duration_ms = step_started.elapsed().as_millis() as u64;
        steps.push(StepResult {
            action: STEP_MIGRATE,
            success,
            duration_ms,
            message: message.clone(),
            job_id: job_id.clone(),
            status: None,
        });
        notify(opts, STEP_MIGRATE, success, duration_ms);
        if !success {
            let _ = machine.transition(MigrationFailed, &message);
            let _ = machine.transition(Failed, &message);
            *failed_at = Some(STEP_MIGRATE);
            return;
        }

        // POLL
        notify(opts, STEP_POLL, true, 0);
        let step_started = Instant::now();
        if !advance(machine, WaitingConfirmation, "waiting for migration confirmation") {
            *failed_at = Some(STEP_POLL);
            return;
        }
        let (success, message, last_status) = self.poll_until_confirmed(solution_id).await;
        let duration_ms = step_started.elapsed().as_millis() as u64;
        steps.push(StepResult {
            action: STEP_POLL,
            success,
            duration_ms,
            message: message.clone(),
            job_id: None,
            status: last_status,
        });
        notify(opts, STEP_POLL, success, duration_ms);
        if !success {
            let _ = machine.transition(MigrationFailed, &message);
            let _ = machine.transition(Failed, &message);
            *failed_at = Some(STEP_POLL);
            return;
        }
        if !advance(machine, Confirmed, &message) {
            *failed_at = Some(STEP_POLL);
            return;
        }

        // POST_UPDATE: non-fatal by design; the migration is already
        // confirmed server-side, so the item completes either way.
        notify(opts, STEP_POST_UPDATE, true, 0);
        let step_started = Instant::now();
        if !advance(machine, PostUpdate, "writing post-migration fields") {
            *failed_at = Some(STEP_POST_UPDATE);
            return;
        }
        let (success, message) = match self
            .client
            .post_update_solution(solution_id, job_id.as_deref(), opts.sfdc_updates.clone())
            .await
        {
            Ok(resp) if normalize_success(&resp) => (true, "post-update applied".to_string()),
            Ok(resp) => (
                false,
                failure_message(&resp, "post-update rejected by runtime"),
            ),
            Err(err) if err.is_endpoint_missing() => {
                (false, format!("post-update endpoint unavailable: {err}"))
            }
            Err(err) => (false, err.to_string()),
        };
        let duration_ms = step_started.elapsed().as_millis() as u64;
        if !success {
            warn!(solution_id, %message, "post-update failed; completing anyway");
        }
        steps.push(StepResult {
            action: STEP_POST_UPDATE,
            success,
            duration_ms,
            message: message.clone(),
            job_id: None,
            status: None,
        });
        notify(opts, STEP_POST_UPDATE, success, duration_ms);
        advance(machine, Completed, &message);
    }

    /// Poll the migration status with exponential backoff until it reaches
    /// a terminal status or the overall timeout elapses. Transport errors
    /// are logged and retried on the next tick.
    async fn poll_until_confirmed(&self, solution_id: &str) -> (bool, String, Option<String>) {
        let started = Instant::now();
        let mut interval = self.polling.poll_interval.as_secs_f64();
        let mut last_status: Option<String> = None;

        sleep(self.polling.initial_delay).await;
        loop {
            if started.elapsed() >= self.polling.max_duration {
                let message = format!(
                    "migration polling timed out after {:.0}s (last status: {})",
                    started.elapsed().as_secs_f64(),
                    last_status.as_deref().unwrap_or("none"),
                );
                return (false, message, last_status);
            }

            match self.client.poll_migration_status(solution_id).await {
                Ok(resp) => {
                    let status = resp
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_ascii_uppercase();
                    debug!(solution_id, %status, "migration status poll");
                    last_status = Some(status.clone());
                    match status.as_str() {
                        "COMPLETED" | "SUCCESS" => {
                            return (
                                true,
                                format!("migration confirmed with status {status}"),
                                last_status,
                            );
                        }
                        "FAILED" | "ERROR" => {
                            let message = failure_message(
                                &resp,
                                &format!("migration failed with status {status}"),
                            );
                            return (false, message, last_status);
                        }
                        _ => {}
                    }
                }
                Err(err) => {
                    warn!(?err, solution_id, "migration status poll failed; retrying");
                }
            }

            let wait = interval.min(self.polling.max_interval.as_secs_f64());
            sleep(Duration::from_secs_f64(wait)).await;
            interval *= self.polling.backoff_factor;
        }
    }
}

fn notify(opts: &RemediateOptions<'_>, action: &'static str, success: bool, duration_ms: u64) {
    if let Some(on_step) = opts.on_step {
        on_step(action, success, duration_ms);
    }
}

/// Attempt a transition that should be legal by construction. On a state
/// error the item is forced to FAILED and the flow aborts.
fn advance(machine: &mut StateMachine<SolutionState>, target: SolutionState, reason: &str) -> bool {
    match machine.transition(target, reason) {
        Ok(_) => true,
        Err(err) => {
            warn!(item_id = machine.item_id(), %err, "invalid state transition");
            let _ = machine.transition(SolutionState::Failed, &err.to_string());
            false
        }
    }
}
