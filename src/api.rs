use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::{BatchExecutor, OeBatchExecutor};
use crate::config;
use crate::engine::{PollingConfig, RemediateOptions, RemediationEngine, RemediationOutcome};
use crate::error::{AppError, AppResult};
use crate::oe::patch::{analyse, ServiceType};
use crate::oe::{OeEngine, OeOptions, OeOutcome};
use crate::runtime::{normalize_success, truthy_flag, DiscoveredService, RuntimeClient};
use crate::schedule::Schedule;
use crate::scheduler::{self, Scheduler, SchedulerState};
use crate::state::{ItemState, SolutionState};

pub async fn health(
    Extension(client): Extension<RuntimeClient>,
    Extension(state): Extension<Arc<SchedulerState>>,
) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "remediation-orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
        "scheduler_running": state.is_running(),
        "runtime_base_url": client.base_url(),
    }))
}

pub async fn status(Extension(state): Extension<Arc<SchedulerState>>) -> Json<Value> {
    let last_cycle = state.last_cycle.lock().await.clone();
    let last_cycle_at = last_cycle.as_ref().map(|record| record.started_at);
    let last_cycle_error = last_cycle.as_ref().and_then(|record| record.error.clone());
    let last_cycle_result = last_cycle.filter(|record| record.error.is_none());
    Json(json!({
        "scheduler_running": state.is_running(),
        "scheduler_interval": *config::SCHEDULER_INTERVAL_SECS,
        "total_cycles": state.total_cycles.load(std::sync::atomic::Ordering::SeqCst),
        "last_cycle_at": last_cycle_at,
        "last_cycle_result": last_cycle_result,
        "last_cycle_error": last_cycle_error,
    }))
}

/// Run one scheduler cycle synchronously.
pub async fn execute(Extension(client): Extension<RuntimeClient>) -> AppResult<Json<Value>> {
    let scheduler = Scheduler::new(client);
    let job_ids = scheduler
        .run_cycle()
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    Ok(Json(json!({
        "count": job_ids.len(),
        "job_ids": job_ids,
    })))
}

/// Run one schedule immediately, bypassing the due-now predicate and the
/// execution window.
pub async fn execute_schedule(
    Extension(client): Extension<RuntimeClient>,
    Path(schedule_id): Path<String>,
) -> AppResult<Json<Value>> {
    let raw = client.get_schedule(&schedule_id).await.map_err(|err| {
        if err.is_endpoint_missing() {
            AppError::NotFound
        } else {
            AppError::Upstream(err)
        }
    })?;
    let schedule = Schedule::parse(&raw).map_err(|err| AppError::BadRequest(err.to_string()))?;
    let scheduler = Scheduler::new(client);
    match scheduler.execute_schedule(&schedule).await {
        Some(job_id) => Ok(Json(json!({
            "schedule_id": schedule_id,
            "job_id": job_id,
        }))),
        None => Err(AppError::Message(
            "failed to create a tracking job for the schedule".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct RemediateBatchRequest {
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub max_count: Option<usize>,
    #[serde(default)]
    pub job_name: Option<String>,
}

/// Run an ad-hoc Solution batch. When a job name is supplied a tracking
/// job is created for the run.
pub async fn remediate_batch(
    Extension(client): Extension<RuntimeClient>,
    Json(payload): Json<RemediateBatchRequest>,
) -> AppResult<Json<Value>> {
    if payload.item_ids.is_empty() {
        return Err(AppError::BadRequest("item_ids must not be empty".to_string()));
    }

    let job_id = match &payload.job_name {
        Some(job_name) => {
            create_manual_job(&client, job_name, "SolutionEmpty", payload.item_ids.len()).await
        }
        None => None,
    };

    let mut executor = BatchExecutor::new(
        client.clone(),
        job_id.clone(),
        None,
        PollingConfig::from_env(),
    );
    executor.execute(payload.item_ids, payload.max_count).await;

    Ok(Json(json!({
        "job_id": job_id,
        "summary": executor.summary,
        "results": executor.results,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemediateSolutionRequest {
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default)]
    pub sfdc_updates: Option<Value>,
    #[serde(default)]
    pub ticket_id: Option<String>,
}

/// Remediate a single solution through the five-step flow.
pub async fn remediate_solution(
    Extension(client): Extension<RuntimeClient>,
    Path(solution_id): Path<String>,
    payload: Option<Json<RemediateSolutionRequest>>,
) -> AppResult<Json<RemediationOutcome>> {
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    info!(
        solution_id = solution_id.as_str(),
        skip_validation = payload.skip_validation,
        "manual solution remediation"
    );

    let engine = RemediationEngine::new(&client, PollingConfig::from_env());
    let outcome = engine
        .remediate(
            &solution_id,
            RemediateOptions {
                skip_validation: payload.skip_validation,
                sfdc_updates: payload.sfdc_updates,
                on_step: None,
            },
        )
        .await;

    if let Some(ticket_id) = payload.ticket_id.as_deref() {
        let status = match outcome.final_state {
            SolutionState::Completed => "resolved",
            _ => "rejected",
        };
        let reason = outcome.error.clone().unwrap_or_default();
        if let Err(err) = client
            .update_ticket(ticket_id, status, outcome.final_state.as_str(), &reason)
            .await
        {
            warn!(?err, ticket_id, "failed to update problem ticket");
        }
    }

    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
pub struct OeDiscoverRequest {
    #[serde(default)]
    pub max_count: Option<usize>,
}

/// Scan migrated services for missing OE data and create problem tickets
/// for the impacted ones.
pub async fn oe_discover(
    Extension(client): Extension<RuntimeClient>,
    payload: Option<Json<OeDiscoverRequest>>,
) -> AppResult<Json<Value>> {
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    let max_count = payload.max_count.unwrap_or(100);

    let services = client.list_migrated_services(max_count).await?;
    let mut scanned = 0usize;
    let mut impacted = Vec::new();

    for service in services.iter().take(max_count) {
        let Some(service_id) = service.get("id").and_then(Value::as_str) else {
            continue;
        };
        scanned += 1;

        let info = match client.get_oe_service_info(service_id).await {
            Ok(info) => info,
            Err(err) => {
                warn!(?err, service_id, "oe discovery: failed to fetch service info");
                continue;
            }
        };
        if !normalize_success(&info) || truthy_flag(info.get("replacementServiceExists")) {
            continue;
        }
        let Some(attachment) = info
            .get("attachmentContent")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        else {
            continue;
        };
        let product_definition_name = info
            .get("productDefinitionName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(service_type) = ServiceType::from_product_definition(product_definition_name)
            .or_else(|| ServiceType::from_attachment(&attachment))
        else {
            continue;
        };

        let analysis = analyse(&attachment, service_type);
        if analysis.missing.is_empty() {
            continue;
        }
        let missing: Vec<String> = analysis.missing.iter().map(|f| f.to_string()).collect();
        match client
            .create_oe_ticket(service_id, service_type.display(), &missing)
            .await
        {
            Ok(_) => impacted.push(json!({
                "service_id": service_id,
                "service_type": service_type.display(),
                "missing_fields": missing,
            })),
            Err(err) => warn!(?err, service_id, "oe discovery: failed to create ticket"),
        }
    }

    info!(scanned, impacted = impacted.len(), "oe discovery complete");
    Ok(Json(json!({
        "scanned": scanned,
        "tickets_created": impacted.len(),
        "services": impacted,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct OeRemediateBatchRequest {
    #[serde(default)]
    pub service_ids: Option<Vec<String>>,
    #[serde(default)]
    pub max_count: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub job_name: Option<String>,
}

/// Run an OE batch over supplied service ids, or over freshly discovered
/// tickets when none are given.
pub async fn oe_remediate_batch(
    Extension(client): Extension<RuntimeClient>,
    payload: Option<Json<OeRemediateBatchRequest>>,
) -> AppResult<Json<Value>> {
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    let entries: Vec<DiscoveredService> = match payload.service_ids.clone() {
        Some(service_ids) if !service_ids.is_empty() => service_ids
            .into_iter()
            .map(|service_id| DiscoveredService {
                service_id,
                ticket_id: String::new(),
                service_type: String::new(),
            })
            .collect(),
        _ => {
            client
                .discover_services(payload.max_count.unwrap_or(100))
                .await?
        }
    };
    if entries.is_empty() {
        return Ok(Json(json!({
            "job_id": null,
            "summary": crate::batch::OeBatchSummary::default(),
            "results": [],
        })));
    }

    let job_id = match &payload.job_name {
        Some(job_name) => {
            create_manual_job(&client, job_name, "PartialDataMissing", entries.len()).await
        }
        None => None,
    };

    let mut executor = OeBatchExecutor::new(client.clone(), job_id.clone(), payload.dry_run);
    executor.execute(entries, payload.max_count).await;

    Ok(Json(json!({
        "job_id": job_id,
        "summary": executor.summary,
        "results": executor.results,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct OeRemediateServiceRequest {
    #[serde(default)]
    pub dry_run: bool,
}

/// Remediate a single OE service; `dry_run` stops before any side effect.
pub async fn remediate_oe_service(
    Extension(client): Extension<RuntimeClient>,
    Path(service_id): Path<String>,
    payload: Option<Json<OeRemediateServiceRequest>>,
) -> AppResult<Json<OeOutcome>> {
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    info!(
        service_id = service_id.as_str(),
        dry_run = payload.dry_run,
        "manual oe remediation"
    );
    let engine = OeEngine::new(&client);
    let outcome = engine
        .remediate(
            &service_id,
            OeOptions {
                dry_run: payload.dry_run,
                enrichment: None,
            },
        )
        .await;
    Ok(Json(outcome))
}

pub async fn scheduler_start(
    Extension(client): Extension<RuntimeClient>,
    Extension(state): Extension<Arc<SchedulerState>>,
) -> Json<Value> {
    let message = if state.mark_running() {
        scheduler::spawn(client, state.clone());
        "Scheduler started"
    } else {
        "Scheduler already running"
    };
    Json(json!({
        "message": message,
        "interval": *config::SCHEDULER_INTERVAL_SECS,
    }))
}

pub async fn scheduler_stop(Extension(state): Extension<Arc<SchedulerState>>) -> Json<Value> {
    state.request_stop();
    Json(json!({ "message": "Scheduler stopped" }))
}

/// Create and locate a tracking job for a manual batch. The synthetic
/// parent id keeps the locate-by-fingerprint lookup unambiguous.
async fn create_manual_job(
    client: &RuntimeClient,
    job_name: &str,
    category: &str,
    requested_quantity: usize,
) -> Option<String> {
    let parent_id = format!("manual-{}", Uuid::new_v4());
    let draft = json!({
        "name": job_name,
        "description": "Manual batch remediation",
        "category": category,
        "requestedQuantity": requested_quantity,
        "x_isRecurrent": false,
        "x_parentScheduleId": parent_id,
    });
    match client.create_job_and_locate(&draft, &parent_id).await {
        Ok(job_id) => job_id,
        Err(err) => {
            warn!(?err, job_name, "failed to create manual tracking job");
            None
        }
    }
}
