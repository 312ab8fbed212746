use httpmock::prelude::*;
use httpmock::Method::PATCH;
use serde_json::json;

use orchestrator::runtime::RuntimeClient;

#[tokio::test]
async fn every_call_carries_the_api_key_header() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "secret-key");

    let list = server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/batchProcessing/v1/batchSchedule")
            .header("X-API-Key", "secret-key");
        then.status(200).json_body(json!([]));
    });

    let schedules = client.list_schedules(None).await.unwrap();
    assert!(schedules.is_empty());
    list.assert();
}

#[tokio::test]
async fn create_job_and_locate_prefers_an_exact_name_match() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(POST).path("/tmf-api/batchProcessing/v1/batchJob");
        then.status(201);
    });
    server.mock(|when, then| {
        when.method(GET).path("/tmf-api/batchProcessing/v1/batchJob");
        then.status(200).json_body(json!([
            { "id": "job-other", "x_parentScheduleId": "sched-9", "state": "pending",
              "name": "Sweep - Execution 3" },
            { "id": "job-done", "x_parentScheduleId": "sched-9", "state": "completed",
              "name": "Sweep - Execution 4" },
            { "id": "job-target", "x_parentScheduleId": "sched-9", "state": "pending",
              "name": "Sweep - Execution 4" },
        ]));
    });

    let draft = json!({
        "name": "Sweep - Execution 4",
        "x_parentScheduleId": "sched-9",
    });
    let located = client.create_job_and_locate(&draft, "sched-9").await.unwrap();
    assert_eq!(located.as_deref(), Some("job-target"));
}

#[tokio::test]
async fn create_job_and_locate_falls_back_to_any_pending_child() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(POST).path("/tmf-api/batchProcessing/v1/batchJob");
        then.status(201);
    });
    server.mock(|when, then| {
        when.method(GET).path("/tmf-api/batchProcessing/v1/batchJob");
        then.status(200).json_body(json!([
            { "id": "job-a", "x_parentScheduleId": "sched-1", "state": "pending",
              "name": "renamed by the runtime" },
        ]));
    });

    let draft = json!({ "name": "Original Name", "x_parentScheduleId": "sched-1" });
    let located = client.create_job_and_locate(&draft, "sched-1").await.unwrap();
    assert_eq!(located.as_deref(), Some("job-a"));
}

#[tokio::test]
async fn delete_job_issues_a_delete() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    let delete = server.mock(|when, then| {
        when.method(DELETE)
            .path("/tmf-api/batchProcessing/v1/batchJob/job-1");
        then.status(204);
    });

    client.delete_job("job-1").await.unwrap();
    delete.assert();
}

#[tokio::test]
async fn discover_solutions_accepts_encoded_characteristics_and_filters_state() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/serviceProblemManagement/v5/serviceProblem")
            .query_param("category", "SolutionEmpty")
            .query_param("status", "pending");
        then.status(200).json_body(json!([
            {
                "id": "SP1",
                "characteristic": [
                    { "name": "remediationState", "value": "DETECTED" },
                    { "name": "solutionId", "value": "S1" },
                ],
            },
            {
                "id": "SP2",
                // The runtime sometimes returns the list JSON-encoded.
                "characteristic":
                    "[{\"name\":\"remediationState\",\"value\":\"DETECTED\"},{\"name\":\"solutionId\",\"value\":\"S2\"}]",
            },
            {
                "id": "SP3",
                "characteristic": [
                    { "name": "remediationState", "value": "COMPLETED" },
                    { "name": "solutionId", "value": "S3" },
                ],
            },
            {
                "id": "SP4",
                "characteristic": [
                    { "name": "remediationState", "value": "DETECTED" },
                ],
            },
        ]));
    });

    let discovered = client.discover_solutions("SolutionEmpty", 10).await.unwrap();
    let ids: Vec<&str> = discovered
        .iter()
        .map(|entry| entry.solution_id.as_str())
        .collect();
    assert_eq!(ids, vec!["S1", "S2"]);
    assert_eq!(discovered[0].ticket_id, "SP1");
}

#[tokio::test]
async fn update_ticket_patches_status_then_merged_characteristics() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/serviceProblemManagement/v5/serviceProblem/SP7");
        then.status(200).json_body(json!({
            "id": "SP7",
            "characteristic": [
                { "name": "solutionId", "value": "S7" },
                { "name": "remediationState", "value": "DETECTED" },
            ],
        }));
    });
    let status_patch = server.mock(|when, then| {
        when.method(PATCH)
            .path("/tmf-api/serviceProblemManagement/v5/serviceProblem/SP7")
            .body_contains("statusChangeReason");
        then.status(200).json_body(json!({}));
    });
    let char_patch = server.mock(|when, then| {
        when.method(PATCH)
            .path("/tmf-api/serviceProblemManagement/v5/serviceProblem/SP7")
            .body_contains("COMPLETED");
        then.status(200).json_body(json!({}));
    });

    client
        .update_ticket("SP7", "resolved", "COMPLETED", "migration confirmed")
        .await
        .unwrap();

    status_patch.assert();
    char_patch.assert();
}

#[tokio::test]
async fn update_ticket_survives_a_characteristic_patch_failure() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/serviceProblemManagement/v5/serviceProblem/SP8");
        then.status(200).json_body(json!({ "id": "SP8", "characteristic": [] }));
    });
    // Disjoint matchers: the characteristic merge carries
    // `remediationState`, the status write carries `rejected`.
    server.mock(|when, then| {
        when.method(PATCH)
            .path("/tmf-api/serviceProblemManagement/v5/serviceProblem/SP8")
            .body_contains("remediationState");
        then.status(500).body("array fields not supported");
    });
    server.mock(|when, then| {
        when.method(PATCH)
            .path("/tmf-api/serviceProblemManagement/v5/serviceProblem/SP8")
            .body_contains("rejected");
        then.status(200).json_body(json!({}));
    });

    // The status patch succeeds; the characteristic failure is swallowed.
    client
        .update_ticket("SP8", "rejected", "FAILED", "")
        .await
        .unwrap();
}

#[tokio::test]
async fn resolve_problem_tickets_maps_only_requested_solutions() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/serviceProblemManagement/v5/serviceProblem")
            .query_param("limit", "200");
        then.status(200).json_body(json!([
            { "id": "SP1", "characteristic": [{ "name": "solutionId", "value": "S1" }] },
            { "id": "SP2", "characteristic": [{ "name": "solutionId", "value": "S2" }] },
            { "id": "SP9", "characteristic": [{ "name": "solutionId", "value": "S9" }] },
        ]));
    });

    let mapping = client
        .resolve_problem_tickets(&["S1".to_string(), "S9".to_string()])
        .await
        .unwrap();
    assert_eq!(mapping.len(), 2);
    assert_eq!(mapping.get("S1").map(String::as_str), Some("SP1"));
    assert_eq!(mapping.get("S9").map(String::as_str), Some("SP9"));
    assert!(!mapping.contains_key("S2"));
}

#[tokio::test]
async fn delete_solution_treats_an_empty_body_as_success() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(DELETE)
            .path("/tmf-api/solutionManagement/v5/solutionMigration/S1");
        then.status(204);
    });

    let response = client.delete_solution("S1").await.unwrap();
    assert_eq!(response["success"], true);
}
