//! OE remediation engine: drives one service through the four-step flow
//! FETCH, ANALYSE+PATCH, PERSIST, TRIGGER_SYNC. The analyse/patch logic is
//! the pure transform in [`patch`]; this module owns the remote side.

pub mod patch;

use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::runtime::{failure_message, normalize_success, truthy_flag, Enrichment, RuntimeClient};
use crate::state::{ItemState, OeState, StateMachine, TransitionRecord};
use self::patch::{analyse, apply_patch, build_instructions, ServiceType};

pub const STEP_FETCH: &str = "FETCH";
pub const STEP_ANALYZE: &str = "ANALYZE";
pub const STEP_PERSIST: &str = "PERSIST";
pub const STEP_TRIGGER_SYNC: &str = "TRIGGER_SYNC";

#[derive(Debug, Clone, Default)]
pub struct OeOptions {
    /// Analyse and build the patch, but stop before any side effect.
    pub dry_run: bool,
    /// Pre-resolved enrichment values; resolved via the runtime when absent.
    pub enrichment: Option<Enrichment>,
}

/// Final result for one OE service.
#[derive(Debug, Clone, Serialize)]
pub struct OeOutcome {
    pub item_id: String,
    pub success: bool,
    pub final_state: OeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
    pub missing_fields: Vec<String>,
    pub fields_patched: Vec<String>,
    pub dry_run: bool,
    pub state_history: Vec<TransitionRecord>,
    pub total_duration_ms: u64,
}

struct FlowState {
    machine: StateMachine<OeState>,
    failed_at: Option<&'static str>,
    service_type: Option<ServiceType>,
    missing_fields: Vec<String>,
    fields_patched: Vec<String>,
}

impl FlowState {
    fn fail(&mut self, step: &'static str, reason: &str) {
        let _ = self.machine.transition(OeState::Failed, reason);
        self.failed_at = Some(step);
    }
}

/// Drives a single OE service through detection analysis, attachment
/// patching, persistence, and the downstream sync trigger.
pub struct OeEngine<'a> {
    client: &'a RuntimeClient,
}

impl<'a> OeEngine<'a> {
    pub fn new(client: &'a RuntimeClient) -> Self {
        Self { client }
    }

    pub async fn remediate(&self, service_id: &str, opts: OeOptions) -> OeOutcome {
        let started = Instant::now();
        let mut flow = FlowState {
            machine: StateMachine::<OeState>::new(service_id),
            failed_at: None,
            service_type: None,
            missing_fields: Vec::new(),
            fields_patched: Vec::new(),
        };

        self.run_flow(service_id, &opts, &mut flow).await;

        let final_state = flow.machine.current();
        let success = matches!(final_state, OeState::Remediated | OeState::NotImpacted)
            || (opts.dry_run && final_state == OeState::Validated);
        let outcome = OeOutcome {
            item_id: service_id.to_string(),
            success,
            final_state,
            failed_at: flow.failed_at,
            error: flow.machine.error().map(str::to_string),
            service_type: flow.service_type,
            missing_fields: flow.missing_fields,
            fields_patched: flow.fields_patched,
            dry_run: opts.dry_run,
            state_history: flow.machine.history().to_vec(),
            total_duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            service_id,
            final_state = final_state.as_str(),
            patched = outcome.fields_patched.len(),
            duration_ms = outcome.total_duration_ms,
            "oe remediation finished"
        );
        outcome
    }

    async fn run_flow(&self, service_id: &str, opts: &OeOptions, flow: &mut FlowState) {
        use OeState::*;

        // FETCH
        if flow
            .machine
            .transition(Validating, "fetching OE service data")
            .is_err()
        {
            flow.fail(STEP_FETCH, "state error");
            return;
        }
        let info = match self.client.get_oe_service_info(service_id).await {
            Ok(info) => info,
            Err(err) => {
                flow.fail(STEP_FETCH, &err.to_string());
                return;
            }
        };
        if !normalize_success(&info) {
            let message = failure_message(&info, "service info rejected by runtime");
            flow.fail(STEP_FETCH, &message);
            return;
        }
        if truthy_flag(info.get("replacementServiceExists")) {
            let _ = flow
                .machine
                .transition(Skipped, "replacement service already exists");
            return;
        }
        let raw_attachment = info
            .get("attachmentContent")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if raw_attachment.is_empty() {
            flow.fail(STEP_FETCH, "service has no attachment content");
            return;
        }
        let attachment: Value = match serde_json::from_str(raw_attachment) {
            Ok(parsed) => parsed,
            Err(err) => {
                flow.fail(STEP_FETCH, &format!("attachment is not valid JSON: {err}"));
                return;
            }
        };
        let product_definition_name = info
            .get("productDefinitionName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // ANALYSE + PATCH (pure)
        if flow
            .machine
            .transition(Analyzing, "analysing attachment")
            .is_err()
        {
            flow.fail(STEP_ANALYZE, "state error");
            return;
        }
        let service_type = ServiceType::from_product_definition(&product_definition_name)
            .or_else(|| ServiceType::from_attachment(&attachment));
        let Some(service_type) = service_type else {
            flow.fail(
                STEP_ANALYZE,
                &format!("unknown service type for product definition '{product_definition_name}'"),
            );
            return;
        };
        flow.service_type = Some(service_type);

        let analysis = analyse(&attachment, service_type);
        flow.missing_fields = analysis.missing.iter().map(|f| f.to_string()).collect();
        if analysis.missing.is_empty() {
            let _ = flow
                .machine
                .transition(NotImpacted, "all mandatory fields present");
            return;
        }

        let enrichment = match opts.enrichment.clone() {
            Some(enrichment) => enrichment,
            None => self.client.get_enrichment(service_id).await,
        };
        let instructions = build_instructions(&analysis.missing, &enrichment);
        if instructions.is_empty() {
            flow.fail(
                STEP_ANALYZE,
                "no patchable fields: enrichment data unavailable",
            );
            return;
        }

        let (patched, fields_patched) = apply_patch(&attachment, &instructions, service_type);
        if fields_patched.is_empty() {
            let _ = flow
                .machine
                .transition(NotImpacted, "no fields required patching");
            return;
        }
        flow.fields_patched = fields_patched;
        let reason = format!("patch prepared for: {}", flow.fields_patched.join(", "));
        if flow.machine.transition(Validated, &reason).is_err() {
            flow.fail(STEP_ANALYZE, "state error");
            return;
        }
        if opts.dry_run {
            info!(service_id, fields = ?flow.fields_patched, "dry run; stopping before persist");
            return;
        }

        // PERSIST
        let serialised = serde_json::to_string(&patched).unwrap_or_default();
        match self.client.update_oe_attachment(service_id, &serialised).await {
            Ok(resp) if normalize_success(&resp) => {
                let _ = flow
                    .machine
                    .transition(AttachmentUpdated, "patched attachment persisted");
            }
            Ok(resp) => {
                let message = failure_message(&resp, "attachment update rejected by runtime");
                flow.fail(STEP_PERSIST, &message);
                return;
            }
            Err(err) => {
                flow.fail(STEP_PERSIST, &err.to_string());
                return;
            }
        }

        // TRIGGER_SYNC
        match self
            .client
            .trigger_oe_remediation(service_id, &product_definition_name)
            .await
        {
            Ok(resp) if normalize_success(&resp) => {
                let _ = flow
                    .machine
                    .transition(RemediationStarted, "downstream sync triggered");
                let _ = flow.machine.transition(Remediated, "remediation complete");
            }
            Ok(resp) => {
                let message = failure_message(&resp, "sync trigger rejected by runtime");
                flow.fail(STEP_TRIGGER_SYNC, &message);
            }
            Err(err) => {
                warn!(?err, service_id, "sync trigger failed");
                flow.fail(STEP_TRIGGER_SYNC, &err.to_string());
            }
        }
    }
}
