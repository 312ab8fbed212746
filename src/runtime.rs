use std::collections::{HashMap, HashSet};
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
// Discovery, validation and attachment operations proxy to slow backends.
const SLOW_TIMEOUT: Duration = Duration::from_secs(60);
// Migration and sync triggers kick off long-running work upstream.
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

const RESOLVE_LISTING_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("runtime returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

impl ClientError {
    /// True when the upstream endpoint itself is absent (404). The
    /// post-update step tolerates this.
    pub fn is_endpoint_missing(&self) -> bool {
        matches!(self, ClientError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Entry returned by Solution-ticket discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredSolution {
    pub solution_id: String,
    pub ticket_id: String,
}

/// Entry returned by OE-ticket discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub service_id: String,
    pub ticket_id: String,
    pub service_type: String,
}

/// Values resolved through the service -> billing account -> individual
/// traversal, used to fill missing OE attributes. Every field is optional;
/// a hop that fails leaves the rest unset.
#[derive(Debug, Default, Clone)]
pub struct Enrichment {
    pub reserved_number: Option<String>,
    pub billing_account_id: Option<String>,
    pub billing_account_name: Option<String>,
    pub pic_email: Option<String>,
}

/// Typed HTTP client for the upstream runtime API. Wraps the batch-schedule,
/// batch-job, service-problem and remediation endpoints. Stateless; safe to
/// clone across tasks.
#[derive(Clone)]
pub struct RuntimeClient {
    base: String,
    api_key: String,
    http: Client,
}

impl RuntimeClient {
    pub fn new(base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http: Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .expect("http client build"),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            config::RUNTIME_BASE_URL.as_str(),
            config::RUNTIME_API_KEY.as_str(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let url = format!("{}{}", self.base, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("X-API-Key", &self.api_key)
            .timeout(timeout);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| ClientError::Shape(err.to_string()))
    }

    fn expect_list(value: Value, context: &str) -> Result<Vec<Value>, ClientError> {
        match value {
            Value::Array(items) => Ok(items),
            other => Err(ClientError::Shape(format!(
                "{context}: expected a list, got {other}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Batch schedules
    // ------------------------------------------------------------------

    pub async fn list_schedules(&self, active: Option<bool>) -> Result<Vec<Value>, ClientError> {
        let mut query = Vec::new();
        if let Some(active) = active {
            query.push(("isActive", active.to_string()));
        }
        let value = self
            .request(
                Method::GET,
                "/tmf-api/batchProcessing/v1/batchSchedule",
                &query,
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Self::expect_list(value, "list_schedules")
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Value, ClientError> {
        self.request(
            Method::GET,
            &format!("/tmf-api/batchProcessing/v1/batchSchedule/{schedule_id}"),
            &[],
            None,
            DEFAULT_TIMEOUT,
        )
        .await
    }

    pub async fn update_schedule(
        &self,
        schedule_id: &str,
        patch: &Value,
    ) -> Result<(), ClientError> {
        self.request(
            Method::PATCH,
            &format!("/tmf-api/batchProcessing/v1/batchSchedule/{schedule_id}"),
            &[],
            Some(patch),
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batch jobs (tracking entities)
    // ------------------------------------------------------------------

    pub async fn create_job(&self, draft: &Value) -> Result<(), ClientError> {
        self.request(
            Method::POST,
            "/tmf-api/batchProcessing/v1/batchJob",
            &[],
            Some(draft),
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn list_jobs(&self) -> Result<Vec<Value>, ClientError> {
        let value = self
            .request(
                Method::GET,
                "/tmf-api/batchProcessing/v1/batchJob",
                &[],
                None,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Self::expect_list(value, "list_jobs")
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Value, ClientError> {
        self.request(
            Method::GET,
            &format!("/tmf-api/batchProcessing/v1/batchJob/{job_id}"),
            &[],
            None,
            DEFAULT_TIMEOUT,
        )
        .await
    }

    pub async fn update_job(&self, job_id: &str, patch: &Value) -> Result<(), ClientError> {
        self.request(
            Method::PATCH,
            &format!("/tmf-api/batchProcessing/v1/batchJob/{job_id}"),
            &[],
            Some(patch),
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), ClientError> {
        self.request(
            Method::DELETE,
            &format!("/tmf-api/batchProcessing/v1/batchJob/{job_id}"),
            &[],
            None,
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// The create endpoint does not return the assigned id, so the job is
    /// located afterwards by fingerprint: same parent schedule, still
    /// pending, preferring an exact name match. Best effort; racy when
    /// another producer creates a like-named job at the same instant.
    pub async fn create_job_and_locate(
        &self,
        draft: &Value,
        parent_schedule_id: &str,
    ) -> Result<Option<String>, ClientError> {
        self.create_job(draft).await?;
        let jobs = self.list_jobs().await?;
        let draft_name = draft.get("name").and_then(Value::as_str);
        let mut fallback = None;
        for job in &jobs {
            let parent = job.get("x_parentScheduleId").and_then(Value::as_str);
            let state = job.get("state").and_then(Value::as_str);
            if parent != Some(parent_schedule_id) || state != Some("pending") {
                continue;
            }
            let id = match job.get("id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => continue,
            };
            if draft_name.is_some() && job.get("name").and_then(Value::as_str) == draft_name {
                return Ok(Some(id));
            }
            fallback.get_or_insert(id);
        }
        Ok(fallback)
    }

    // ------------------------------------------------------------------
    // Problem tickets (service problems)
    // ------------------------------------------------------------------

    /// Discover pending Solution tickets. The runtime filters on category
    /// and status; the remediation-state characteristic is checked here.
    pub async fn discover_solutions(
        &self,
        category: &str,
        max_count: usize,
    ) -> Result<Vec<DiscoveredSolution>, ClientError> {
        let query = [
            ("category", category.to_string()),
            ("status", "pending".to_string()),
            ("limit", max_count.to_string()),
        ];
        let value = self
            .request(
                Method::GET,
                "/tmf-api/serviceProblemManagement/v5/serviceProblem",
                &query,
                None,
                SLOW_TIMEOUT,
            )
            .await?;
        let problems = Self::expect_list(value, "discover_solutions")?;

        let mut discovered = Vec::new();
        for problem in &problems {
            let chars = characteristics(problem);
            let state = characteristic_value(&chars, "remediationState");
            let solution_id = characteristic_value(&chars, "solutionId");
            if let (Some(solution_id), Some("DETECTED")) = (solution_id, state.as_deref()) {
                discovered.push(DiscoveredSolution {
                    solution_id,
                    ticket_id: problem
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        info!(
            count = discovered.len(),
            category, "discovered pending solutions"
        );
        Ok(discovered)
    }

    /// Discover pending OE tickets (category `PartialDataMissing`).
    pub async fn discover_services(
        &self,
        max_count: usize,
    ) -> Result<Vec<DiscoveredService>, ClientError> {
        let query = [
            ("category", "PartialDataMissing".to_string()),
            ("status", "pending".to_string()),
            ("limit", max_count.to_string()),
        ];
        let value = self
            .request(
                Method::GET,
                "/tmf-api/serviceProblemManagement/v5/serviceProblem",
                &query,
                None,
                SLOW_TIMEOUT,
            )
            .await?;
        let problems = Self::expect_list(value, "discover_services")?;

        let mut discovered = Vec::new();
        for problem in &problems {
            let chars = characteristics(problem);
            let state = characteristic_value(&chars, "remediationState");
            let service_id = characteristic_value(&chars, "serviceId");
            if let (Some(service_id), Some("DETECTED")) = (service_id, state.as_deref()) {
                discovered.push(DiscoveredService {
                    service_id,
                    ticket_id: problem
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    service_type: characteristic_value(&chars, "serviceType").unwrap_or_default(),
                });
            }
        }
        info!(count = discovered.len(), "discovered pending OE services");
        Ok(discovered)
    }

    /// Resolve solution ids to their owning ticket ids with a single bulk
    /// listing filtered client-side.
    pub async fn resolve_problem_tickets(
        &self,
        solution_ids: &[String],
    ) -> Result<HashMap<String, String>, ClientError> {
        if solution_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let targets: HashSet<&str> = solution_ids.iter().map(String::as_str).collect();
        let query = [("limit", RESOLVE_LISTING_LIMIT.to_string())];
        let value = self
            .request(
                Method::GET,
                "/tmf-api/serviceProblemManagement/v5/serviceProblem",
                &query,
                None,
                SLOW_TIMEOUT,
            )
            .await?;
        let problems = Self::expect_list(value, "resolve_problem_tickets")?;

        let mut mapping = HashMap::new();
        for problem in &problems {
            let chars = characteristics(problem);
            if let Some(solution_id) = characteristic_value(&chars, "solutionId") {
                if targets.contains(solution_id.as_str()) {
                    if let Some(ticket_id) = problem.get("id").and_then(Value::as_str) {
                        mapping.insert(solution_id, ticket_id.to_string());
                    }
                }
            }
        }
        info!(
            resolved = mapping.len(),
            requested = solution_ids.len(),
            "resolved solution ids to tickets"
        );
        Ok(mapping)
    }

    /// Update a ticket's status field and its remediation-state
    /// characteristic. The two live in distinct upstream fields: status is
    /// patched first, then the merged characteristic list. A failure of the
    /// characteristic patch is logged and swallowed.
    pub async fn update_ticket(
        &self,
        ticket_id: &str,
        status: &str,
        remediation_state: &str,
        reason: &str,
    ) -> Result<(), ClientError> {
        let path = format!("/tmf-api/serviceProblemManagement/v5/serviceProblem/{ticket_id}");
        let current = self
            .request(Method::GET, &path, &[], None, DEFAULT_TIMEOUT)
            .await?;

        let mut merged = characteristics(&current);
        let state_char = json!({
            "@type": "StringCharacteristic",
            "name": "remediationState",
            "value": remediation_state,
        });
        match merged
            .iter_mut()
            .find(|c| c.get("name").and_then(Value::as_str) == Some("remediationState"))
        {
            Some(existing) => *existing = state_char,
            None => merged.push(state_char),
        }

        let mut patch = json!({ "status": status });
        if !reason.is_empty() {
            patch["statusChangeReason"] = Value::String(reason.to_string());
        }
        self.request(Method::PATCH, &path, &[], Some(&patch), DEFAULT_TIMEOUT)
            .await?;

        let char_patch = json!({ "characteristic": merged });
        if let Err(err) = self
            .request(Method::PATCH, &path, &[], Some(&char_patch), DEFAULT_TIMEOUT)
            .await
        {
            warn!(?err, ticket_id, "failed to patch ticket characteristics");
        }
        Ok(())
    }

    /// Create an OE problem ticket for a detected service.
    pub async fn create_oe_ticket(
        &self,
        service_id: &str,
        service_type: &str,
        missing_fields: &[String],
    ) -> Result<Value, ClientError> {
        let payload = json!({
            "category": "PartialDataMissing",
            "status": "pending",
            "description": format!(
                "OE partial data missing for {service_type} service {service_id}"
            ),
            "priority": "medium",
            "characteristic": [
                { "@type": "StringCharacteristic", "name": "serviceId", "value": service_id },
                { "@type": "StringCharacteristic", "name": "serviceType", "value": service_type },
                { "@type": "StringCharacteristic", "name": "remediationState", "value": "DETECTED" },
                { "@type": "StringCharacteristic", "name": "missingFields", "value": missing_fields.join(",") },
            ],
        });
        self.request(
            Method::POST,
            "/tmf-api/serviceProblemManagement/v5/serviceProblem",
            &[],
            Some(&payload),
            DEFAULT_TIMEOUT,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Solution remediation primitives
    // ------------------------------------------------------------------

    pub async fn get_solution_info(&self, solution_id: &str) -> Result<Value, ClientError> {
        self.request(
            Method::GET,
            &format!("/tmf-api/solutionManagement/v5/solutionInfo/{solution_id}"),
            &[],
            None,
            SLOW_TIMEOUT,
        )
        .await
    }

    /// Delete upstream solution-management data. An empty 2xx body counts
    /// as success.
    pub async fn delete_solution(&self, solution_id: &str) -> Result<Value, ClientError> {
        let value = self
            .request(
                Method::DELETE,
                &format!("/tmf-api/solutionManagement/v5/solutionMigration/{solution_id}"),
                &[],
                None,
                SLOW_TIMEOUT,
            )
            .await?;
        if value.is_null() {
            return Ok(json!({ "success": true }));
        }
        Ok(value)
    }

    pub async fn migrate_solution(&self, solution_id: &str) -> Result<Value, ClientError> {
        self.request(
            Method::POST,
            "/tmf-api/solutionManagement/v5/solutionMigration",
            &[],
            Some(&json!({ "solutionId": solution_id })),
            TRIGGER_TIMEOUT,
        )
        .await
    }

    pub async fn poll_migration_status(&self, solution_id: &str) -> Result<Value, ClientError> {
        self.request(
            Method::GET,
            &format!("/tmf-api/solutionManagement/v5/migrationStatus/{solution_id}"),
            &[],
            None,
            POLL_TIMEOUT,
        )
        .await
    }

    pub async fn post_update_solution(
        &self,
        solution_id: &str,
        job_id: Option<&str>,
        sfdc_updates: Option<Value>,
    ) -> Result<Value, ClientError> {
        let mut payload = json!({
            "solutionId": solution_id,
            "migrationStatus": "COMPLETED",
            "sfdcUpdates": sfdc_updates.unwrap_or_else(default_sfdc_updates),
        });
        if let Some(job_id) = job_id {
            payload["jobId"] = Value::String(job_id.to_string());
        }
        self.request(
            Method::POST,
            "/tmf-api/solutionManagement/v5/solutionPostUpdate",
            &[],
            Some(&payload),
            SLOW_TIMEOUT,
        )
        .await
    }

    // ------------------------------------------------------------------
    // OE remediation primitives
    // ------------------------------------------------------------------

    pub async fn get_oe_service_info(&self, service_id: &str) -> Result<Value, ClientError> {
        self.request(
            Method::GET,
            &format!("/tmf-api/oeServiceManagement/v1/oeServiceInfo/{service_id}"),
            &[],
            None,
            SLOW_TIMEOUT,
        )
        .await
    }

    pub async fn update_oe_attachment(
        &self,
        service_id: &str,
        patched_content: &str,
    ) -> Result<Value, ClientError> {
        self.request(
            Method::POST,
            "/tmf-api/oeServiceManagement/v1/oeServiceAttachment",
            &[],
            Some(&json!({
                "serviceId": service_id,
                "attachmentContent": patched_content,
            })),
            SLOW_TIMEOUT,
        )
        .await
    }

    pub async fn trigger_oe_remediation(
        &self,
        service_id: &str,
        product_definition_name: &str,
    ) -> Result<Value, ClientError> {
        self.request(
            Method::POST,
            "/tmf-api/oeServiceManagement/v1/oeServiceRemediation",
            &[],
            Some(&json!({
                "serviceId": service_id,
                "productDefinitionName": product_definition_name,
            })),
            TRIGGER_TIMEOUT,
        )
        .await
    }

    /// List migrated services from the inventory, used by OE discovery to
    /// find candidates whose attachments still need analysis.
    pub async fn list_migrated_services(&self, limit: usize) -> Result<Vec<Value>, ClientError> {
        let query = [
            ("x_migratedData", "true".to_string()),
            ("limit", limit.to_string()),
        ];
        let value = self
            .request(
                Method::GET,
                "/tmf-api/serviceInventoryManagement/v5/service",
                &query,
                None,
                SLOW_TIMEOUT,
            )
            .await?;
        Self::expect_list(value, "list_migrated_services")
    }

    /// Resolve enrichment data with the 3-hop traversal
    /// service -> billing account -> individual. Each hop failing returns
    /// whatever was collected up to that point.
    pub async fn get_enrichment(&self, service_id: &str) -> Enrichment {
        let mut enrichment = Enrichment::default();

        let service = match self
            .request(
                Method::GET,
                &format!("/tmf-api/serviceInventoryManagement/v5/service/{service_id}"),
                &[],
                None,
                DEFAULT_TIMEOUT,
            )
            .await
        {
            Ok(service) => service,
            Err(err) => {
                warn!(?err, service_id, "enrichment: failed to fetch service");
                return enrichment;
            }
        };
        enrichment.reserved_number = nonempty_string(service.get("x_externalId"));
        enrichment.billing_account_id = nonempty_string(service.get("x_billingAccountId"));

        let ba_id = match enrichment.billing_account_id.clone() {
            Some(ba_id) => ba_id,
            None => return enrichment,
        };
        let account = match self
            .request(
                Method::GET,
                &format!("/tmf-api/accountManagement/v5/billingAccount/{ba_id}"),
                &[],
                None,
                DEFAULT_TIMEOUT,
            )
            .await
        {
            Ok(account) => account,
            Err(err) => {
                warn!(?err, %ba_id, "enrichment: failed to fetch billing account");
                return enrichment;
            }
        };
        enrichment.billing_account_name = nonempty_string(account.get("name"));

        let contact_id = account
            .get("relatedParty")
            .and_then(Value::as_array)
            .and_then(|parties| {
                parties
                    .iter()
                    .find(|party| party.get("role").and_then(Value::as_str) == Some("contact"))
            })
            .and_then(|party| party.get("id").and_then(Value::as_str))
            .map(str::to_string);
        let contact_id = match contact_id {
            Some(contact_id) => contact_id,
            None => return enrichment,
        };

        let individual = match self
            .request(
                Method::GET,
                &format!("/tmf-api/partyManagement/v5/individual/{contact_id}"),
                &[],
                None,
                DEFAULT_TIMEOUT,
            )
            .await
        {
            Ok(individual) => individual,
            Err(err) => {
                warn!(?err, %contact_id, "enrichment: failed to fetch individual");
                return enrichment;
            }
        };
        enrichment.pic_email = individual
            .get("contactMedium")
            .and_then(Value::as_array)
            .and_then(|media| {
                media.iter().find_map(|medium| {
                    let characteristic = medium.get("characteristic")?;
                    if characteristic.get("contactType").and_then(Value::as_str) == Some("email") {
                        nonempty_string(characteristic.get("emailAddress"))
                    } else {
                        None
                    }
                })
            });

        enrichment
    }
}

/// Default field writes applied during post-update when the caller
/// supplies none.
pub fn default_sfdc_updates() -> Value {
    json!({
        "isMigratedToHeroku": true,
        "isConfigurationUpdatedToHeroku": true,
        "externalIdentifier": "",
    })
}

/// Normalise the upstream `success` field, which arrives as a boolean, a
/// string in several spellings, or a number.
pub fn normalize_success(response: &Value) -> bool {
    match response.get("success") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => {
            let text = text.trim().to_ascii_lowercase();
            matches!(text.as_str(), "true" | "1" | "yes")
        }
        Some(Value::Number(number)) => number.as_i64().map(|n| n != 0).unwrap_or(false),
        _ => false,
    }
}

/// Extract a record's characteristic list, tolerating the runtime's
/// serialisation drift: the list may arrive as a JSON array or as a
/// JSON-encoded string.
pub fn characteristics(record: &Value) -> Vec<Value> {
    match record.get("characteristic") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded)
            .ok()
            .and_then(|parsed| parsed.as_array().cloned())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Extract an upstream error detail from a response body, falling back to
/// a caller-provided description.
pub fn failure_message(response: &Value, fallback: &str) -> String {
    response
        .get("error")
        .or_else(|| response.get("message"))
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

/// Normalise a boolean-ish flag that may arrive as a bool or a string.
pub fn truthy_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Look up a named characteristic's string value.
pub fn characteristic_value(chars: &[Value], name: &str) -> Option<String> {
    chars.iter().find_map(|c| {
        if c.get("name").and_then(Value::as_str) == Some(name) {
            c.get("value").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        }
    })
}

fn nonempty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
