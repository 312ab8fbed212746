use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::engine::{
    PollingConfig, RemediateOptions, RemediationEngine, RemediationOutcome, STEP_DELETE,
    STEP_MIGRATE, STEP_POLL, STEP_POST_UPDATE, STEP_VALIDATE,
};
use crate::oe::{OeEngine, OeOptions, OeOutcome};
use crate::runtime::{DiscoveredService, RuntimeClient};
use crate::state::{ItemState, OeState, SolutionState};

/// Per-batch counters for the Solution variant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
}

/// Per-batch counters for the OE variant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OeBatchSummary {
    pub total: usize,
    pub remediated: usize,
    pub not_impacted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Cooperative cancellation flag, checked between items only; an item in
/// flight always runs to a terminal state.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn final_job_state(cancelled: bool, failed: usize, succeeded: usize) -> &'static str {
    if cancelled {
        "cancelled"
    } else if failed > 0 && succeeded == 0 {
        "failed"
    } else {
        "completed"
    }
}

/// Tracking-job state shown while a given Solution step runs.
fn state_for_action(action: &str) -> &'static str {
    match action {
        STEP_VALIDATE => "VALIDATING",
        STEP_DELETE => "DELETING",
        STEP_MIGRATE => "MIGRATING",
        STEP_POLL => "WAITING_CONFIRMATION",
        STEP_POST_UPDATE => "POST_UPDATE",
        _ => "IN_PROGRESS",
    }
}

/// Sequences solutions through the five-step engine, one at a time, while
/// keeping the tracking job and the originating problem tickets up to
/// date. Secondary update failures are logged and never change an item's
/// outcome.
pub struct BatchExecutor {
    client: RuntimeClient,
    job_id: Option<String>,
    ticket_map: Option<HashMap<String, String>>,
    polling: PollingConfig,
    cancel: CancelToken,
    pub summary: BatchSummary,
    pub results: Vec<RemediationOutcome>,
}

impl BatchExecutor {
    pub fn new(
        client: RuntimeClient,
        job_id: Option<String>,
        ticket_map: Option<HashMap<String, String>>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            client,
            job_id,
            ticket_map,
            polling,
            cancel: CancelToken::default(),
            summary: BatchSummary::default(),
            results: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn execute(
        &mut self,
        solution_ids: Vec<String>,
        max_count: Option<usize>,
    ) -> &[RemediationOutcome] {
        let mut to_process = solution_ids;
        if let Some(max) = max_count {
            to_process.truncate(max);
        }

        // Resolve owning tickets up front with one bulk listing; items with
        // no ticket are still processed, only the final status write is
        // skipped for them.
        if self.ticket_map.is_none() {
            self.ticket_map = match self.client.resolve_problem_tickets(&to_process).await {
                Ok(mapping) => Some(mapping),
                Err(err) => {
                    warn!(?err, "failed to resolve problem tickets; continuing without");
                    Some(HashMap::new())
                }
            };
        }

        self.summary = BatchSummary {
            total: to_process.len(),
            pending: to_process.len(),
            ..BatchSummary::default()
        };
        self.update_job(json!({
            "state": "inProgress",
            "x_summary": encode_summary(&self.summary),
        }))
        .await;

        let mut cancelled = false;
        for (index, solution_id) in to_process.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(processed = index, "solution batch cancelled between items");
                cancelled = true;
                break;
            }

            info!(
                item = index + 1,
                total = to_process.len(),
                solution_id = solution_id.as_str(),
                "processing solution"
            );
            self.update_job(json!({
                "x_currentItemId": solution_id,
                "x_currentItemState": "VALIDATING",
                "actualQuantity": index,
            }))
            .await;

            let outcome = self.process_single(solution_id).await;

            match outcome.final_state {
                SolutionState::Completed => self.summary.successful += 1,
                SolutionState::Skipped => self.summary.skipped += 1,
                _ => self.summary.failed += 1,
            }
            self.summary.pending -= 1;

            self.update_ticket_for(&outcome).await;
            self.update_job(json!({
                "actualQuantity": index + 1,
                "x_summary": encode_summary(&self.summary),
            }))
            .await;
            self.results.push(outcome);
        }

        let final_state = final_job_state(cancelled, self.summary.failed, self.summary.successful);
        self.update_job(json!({
            "state": final_state,
            "actualQuantity": self.results.len(),
            "x_summary": encode_summary(&self.summary),
            "x_currentItemId": "",
            "x_currentItemState": if final_state == "completed" { "COMPLETED" } else { "FAILED" },
        }))
        .await;

        &self.results
    }

    async fn process_single(&self, solution_id: &str) -> RemediationOutcome {
        // Step progress flows through a channel so the synchronous step
        // callback never blocks on the HTTP update.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<&'static str>();
        let updater = self.job_id.clone().map(|job_id| {
            let client = self.client.clone();
            tokio::spawn(async move {
                let mut last = "";
                while let Some(state) = progress_rx.recv().await {
                    if state == last {
                        continue;
                    }
                    last = state;
                    let patch = json!({ "x_currentItemState": state });
                    if let Err(err) = client.update_job(&job_id, &patch).await {
                        warn!(?err, job_id, "failed to update tracking job progress");
                    }
                }
            })
        });

        let on_step = move |action: &'static str, _success: bool, _duration_ms: u64| {
            let _ = progress_tx.send(state_for_action(action));
        };
        let engine = RemediationEngine::new(&self.client, self.polling.clone());
        let outcome = engine
            .remediate(
                solution_id,
                RemediateOptions {
                    on_step: Some(&on_step),
                    ..RemediateOptions::default()
                },
            )
            .await;

        drop(on_step);
        if let Some(updater) = updater {
            let _ = updater.await;
        }
        outcome
    }

    async fn update_ticket_for(&self, outcome: &RemediationOutcome) {
        let ticket_id = self
            .ticket_map
            .as_ref()
            .and_then(|map| map.get(&outcome.item_id));
        let Some(ticket_id) = ticket_id else {
            return;
        };
        let status = match outcome.final_state {
            SolutionState::Completed => "resolved",
            _ => "rejected",
        };
        let reason = outcome
            .error
            .clone()
            .or_else(|| {
                outcome
                    .state_history
                    .last()
                    .map(|record| record.reason.clone())
            })
            .unwrap_or_default();
        if let Err(err) = self
            .client
            .update_ticket(ticket_id, status, outcome.final_state.as_str(), &reason)
            .await
        {
            warn!(
                ?err,
                ticket_id,
                solution_id = outcome.item_id.as_str(),
                "failed to update problem ticket"
            );
        }
    }

    async fn update_job(&self, patch: Value) {
        let Some(job_id) = self.job_id.as_deref() else {
            return;
        };
        if let Err(err) = self.client.update_job(job_id, &patch).await {
            warn!(?err, job_id, "failed to update tracking job");
        }
    }
}

/// Sequences OE services through the four-step engine. Mirrors
/// [`BatchExecutor`] but marks tickets in progress before each item and
/// uses the OE summary/status mappings.
pub struct OeBatchExecutor {
    client: RuntimeClient,
    job_id: Option<String>,
    dry_run: bool,
    cancel: CancelToken,
    pub summary: OeBatchSummary,
    pub results: Vec<OeOutcome>,
}

impl OeBatchExecutor {
    pub fn new(client: RuntimeClient, job_id: Option<String>, dry_run: bool) -> Self {
        Self {
            client,
            job_id,
            dry_run,
            cancel: CancelToken::default(),
            summary: OeBatchSummary::default(),
            results: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn execute(
        &mut self,
        entries: Vec<DiscoveredService>,
        max_count: Option<usize>,
    ) -> &[OeOutcome] {
        let mut to_process = entries;
        if let Some(max) = max_count {
            to_process.truncate(max);
        }

        self.summary = OeBatchSummary {
            total: to_process.len(),
            pending: to_process.len(),
            ..OeBatchSummary::default()
        };
        self.update_job(json!({
            "state": "inProgress",
            "x_summary": encode_summary(&self.summary),
        }))
        .await;

        let mut cancelled = false;
        for (index, entry) in to_process.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(processed = index, "oe batch cancelled between items");
                cancelled = true;
                break;
            }

            info!(
                item = index + 1,
                total = to_process.len(),
                service_id = entry.service_id.as_str(),
                "processing oe service"
            );
            self.update_job(json!({
                "x_currentItemId": entry.service_id,
                "x_currentItemState": "VALIDATING",
                "actualQuantity": index,
            }))
            .await;
            self.update_ticket(&entry.ticket_id, "inProgress", "VALIDATING", "")
                .await;

            let engine = OeEngine::new(&self.client);
            let outcome = engine
                .remediate(
                    &entry.service_id,
                    OeOptions {
                        dry_run: self.dry_run,
                        enrichment: None,
                    },
                )
                .await;

            match outcome.final_state {
                OeState::Remediated => self.summary.remediated += 1,
                OeState::NotImpacted => self.summary.not_impacted += 1,
                OeState::Skipped => self.summary.skipped += 1,
                OeState::Failed => self.summary.failed += 1,
                _ => {}
            }
            self.summary.pending -= 1;

            let status = match outcome.final_state {
                OeState::Remediated => "resolved",
                OeState::NotImpacted | OeState::Skipped => "closed",
                OeState::Failed => "pending",
                _ => "inProgress",
            };
            let reason = outcome.error.clone().unwrap_or_else(|| {
                if outcome.fields_patched.is_empty() {
                    String::new()
                } else {
                    format!("Patched: {}", outcome.fields_patched.join(", "))
                }
            });
            self.update_ticket(
                &entry.ticket_id,
                status,
                outcome.final_state.as_str(),
                &reason,
            )
            .await;

            self.update_job(json!({
                "actualQuantity": index + 1,
                "x_currentItemState": outcome.final_state.as_str(),
                "x_summary": encode_summary(&self.summary),
            }))
            .await;
            self.results.push(outcome);
        }

        let final_state = final_job_state(cancelled, self.summary.failed, self.summary.remediated);
        self.update_job(json!({
            "state": final_state,
            "actualQuantity": self.results.len(),
            "x_summary": encode_summary(&self.summary),
            "x_currentItemId": "",
            "x_currentItemState": final_state.to_ascii_uppercase(),
        }))
        .await;

        &self.results
    }

    async fn update_job(&self, patch: Value) {
        let Some(job_id) = self.job_id.as_deref() else {
            return;
        };
        if let Err(err) = self.client.update_job(job_id, &patch).await {
            warn!(?err, job_id, "failed to update tracking job");
        }
    }

    async fn update_ticket(&self, ticket_id: &str, status: &str, state: &str, reason: &str) {
        if ticket_id.is_empty() {
            return;
        }
        if let Err(err) = self
            .client
            .update_ticket(ticket_id, status, state, reason)
            .await
        {
            warn!(?err, ticket_id, "failed to update problem ticket");
        }
    }
}

fn encode_summary<S: Serialize>(summary: &S) -> String {
    serde_json::to_string(summary).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_job_state_mapping() {
        assert_eq!(final_job_state(true, 0, 0), "cancelled");
        assert_eq!(final_job_state(true, 3, 0), "cancelled");
        assert_eq!(final_job_state(false, 2, 0), "failed");
        assert_eq!(final_job_state(false, 2, 1), "completed");
        assert_eq!(final_job_state(false, 0, 0), "completed");
        assert_eq!(final_job_state(false, 0, 5), "completed");
    }

    #[test]
    fn step_actions_map_to_item_states() {
        assert_eq!(state_for_action(STEP_VALIDATE), "VALIDATING");
        assert_eq!(state_for_action(STEP_DELETE), "DELETING");
        assert_eq!(state_for_action(STEP_MIGRATE), "MIGRATING");
        assert_eq!(state_for_action(STEP_POLL), "WAITING_CONFIRMATION");
        assert_eq!(state_for_action(STEP_POST_UPDATE), "POST_UPDATE");
        assert_eq!(state_for_action("SOMETHING_ELSE"), "IN_PROGRESS");
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::default();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn summaries_serialise_with_counter_names() {
        let summary = BatchSummary {
            total: 3,
            successful: 1,
            failed: 1,
            skipped: 1,
            pending: 0,
        };
        let encoded = encode_summary(&summary);
        assert!(encoded.contains("\"successful\":1"));
        assert!(encoded.contains("\"pending\":0"));

        let oe = OeBatchSummary {
            total: 2,
            remediated: 1,
            not_impacted: 1,
            ..OeBatchSummary::default()
        };
        let encoded = encode_summary(&oe);
        assert!(encoded.contains("\"remediated\":1"));
        assert!(encoded.contains("\"not_impacted\":1"));
    }
}
