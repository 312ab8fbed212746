use httpmock::prelude::*;
use httpmock::Method::PATCH;
use serde_json::{json, Value};

use orchestrator::batch::OeBatchExecutor;
use orchestrator::oe::{OeEngine, OeOptions};
use orchestrator::runtime::{DiscoveredService, Enrichment, RuntimeClient};
use orchestrator::state::OeState;

fn voice_attachment(attrs: Value) -> String {
    json!({
        "NonCommercialProduct": [
            { "Voice OE": { "attributes": attrs } },
        ],
    })
    .to_string()
}

fn service_info(service_id: &str, attachment: &str) -> Value {
    json!({
        "success": true,
        "serviceId": service_id,
        "productDefinitionName": "Enterprise Voice Plan",
        "replacementServiceExists": false,
        "attachmentContent": attachment,
    })
}

fn complete_voice_attrs() -> Value {
    json!([
        { "name": "ReservedNumber", "value": "0123456789" },
        { "name": "ResourceSystemGroupID", "value": "Migrated" },
        { "name": "NumberStatus", "value": "Reserved" },
        { "name": "PIC Email", "value": "pic@example.com" },
    ])
}

#[tokio::test]
async fn complete_attachment_is_not_impacted() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    let attachment = voice_attachment(complete_voice_attrs());
    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceInfo/V1");
        then.status(200).json_body(service_info("V1", &attachment));
    });
    let persist = server.mock(|when, then| {
        when.method(POST).path_contains("oeServiceAttachment");
        then.status(200).json_body(json!({ "success": true }));
    });
    let trigger = server.mock(|when, then| {
        when.method(POST).path_contains("oeServiceRemediation");
        then.status(200).json_body(json!({ "success": true }));
    });

    let engine = OeEngine::new(&client);
    let outcome = engine.remediate("V1", OeOptions::default()).await;

    assert!(outcome.success);
    assert_eq!(outcome.final_state, OeState::NotImpacted);
    assert!(outcome.missing_fields.is_empty());
    assert!(outcome.fields_patched.is_empty());
    assert_eq!(persist.hits(), 0);
    assert_eq!(trigger.hits(), 0);
}

#[tokio::test]
async fn dry_run_builds_the_patch_without_side_effects() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    let attachment = voice_attachment(json!([
        { "name": "ResourceSystemGroupID", "value": "Migrated" },
        { "name": "NumberStatus", "value": "Reserved" },
        { "name": "PIC Email", "value": "pic@example.com" },
    ]));
    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceInfo/V2");
        then.status(200).json_body(service_info("V2", &attachment));
    });
    let persist = server.mock(|when, then| {
        when.method(POST).path_contains("oeServiceAttachment");
        then.status(200).json_body(json!({ "success": true }));
    });
    let trigger = server.mock(|when, then| {
        when.method(POST).path_contains("oeServiceRemediation");
        then.status(200).json_body(json!({ "success": true }));
    });

    let engine = OeEngine::new(&client);
    let outcome = engine
        .remediate(
            "V2",
            OeOptions {
                dry_run: true,
                enrichment: Some(Enrichment {
                    reserved_number: Some("N1".to_string()),
                    ..Enrichment::default()
                }),
            },
        )
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.final_state, OeState::Validated);
    assert_eq!(outcome.fields_patched, vec!["ReservedNumber".to_string()]);
    assert_eq!(persist.hits(), 0);
    assert_eq!(trigger.hits(), 0);
}

#[tokio::test]
async fn full_remediation_persists_and_triggers_sync() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    let attachment = voice_attachment(json!([
        { "name": "ResourceSystemGroupID", "value": "Migrated" },
        { "name": "NumberStatus", "value": "Reserved" },
        { "name": "PIC Email", "value": "pic@example.com" },
    ]));
    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceInfo/V3");
        then.status(200).json_body(service_info("V3", &attachment));
    });
    let persist = server.mock(|when, then| {
        when.method(POST)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceAttachment")
            .body_contains("ReservedNumber");
        then.status(200).json_body(json!({ "success": true }));
    });
    let trigger = server.mock(|when, then| {
        when.method(POST)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceRemediation")
            .body_contains("Enterprise Voice Plan");
        then.status(200).json_body(json!({ "success": true }));
    });

    let engine = OeEngine::new(&client);
    let outcome = engine
        .remediate(
            "V3",
            OeOptions {
                dry_run: false,
                enrichment: Some(Enrichment {
                    reserved_number: Some("0199988877".to_string()),
                    ..Enrichment::default()
                }),
            },
        )
        .await;

    assert!(outcome.success, "outcome: {outcome:?}");
    assert_eq!(outcome.final_state, OeState::Remediated);
    assert_eq!(outcome.fields_patched, vec!["ReservedNumber".to_string()]);
    persist.assert();
    trigger.assert();
}

#[tokio::test]
async fn replacement_service_skips_the_item() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceInfo/V4");
        then.status(200).json_body(json!({
            "success": true,
            "replacementServiceExists": true,
            "attachmentContent": "{}",
            "productDefinitionName": "Enterprise Voice Plan",
        }));
    });

    let engine = OeEngine::new(&client);
    let outcome = engine.remediate("V4", OeOptions::default()).await;

    assert_eq!(outcome.final_state, OeState::Skipped);
    assert!(!outcome.success);
}

#[tokio::test]
async fn missing_attachment_fails_at_fetch() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceInfo/V5");
        then.status(200).json_body(json!({
            "success": true,
            "replacementServiceExists": false,
            "productDefinitionName": "Enterprise Voice Plan",
        }));
    });

    let engine = OeEngine::new(&client);
    let outcome = engine.remediate("V5", OeOptions::default()).await;

    assert_eq!(outcome.final_state, OeState::Failed);
    assert_eq!(outcome.failed_at, Some("FETCH"));
    assert!(outcome.error.unwrap().contains("attachment"));
}

#[tokio::test]
async fn unenrichable_missing_fields_fail_the_analysis() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    // ReservedNumber is missing and the enrichment has nothing to offer.
    let attachment = voice_attachment(json!([
        { "name": "ResourceSystemGroupID", "value": "Migrated" },
        { "name": "NumberStatus", "value": "Reserved" },
        { "name": "PIC Email", "value": "pic@example.com" },
    ]));
    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceInfo/V6");
        then.status(200).json_body(service_info("V6", &attachment));
    });

    let engine = OeEngine::new(&client);
    let outcome = engine
        .remediate(
            "V6",
            OeOptions {
                dry_run: false,
                enrichment: Some(Enrichment::default()),
            },
        )
        .await;

    assert_eq!(outcome.final_state, OeState::Failed);
    assert_eq!(outcome.failed_at, Some("ANALYZE"));
}

#[tokio::test]
async fn enrichment_traverses_service_billing_account_and_contact() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/serviceInventoryManagement/v5/service/V7");
        then.status(200).json_body(json!({
            "id": "V7",
            "x_externalId": "0312345678",
            "x_billingAccountId": "BA-7",
        }));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/accountManagement/v5/billingAccount/BA-7");
        then.status(200).json_body(json!({
            "id": "BA-7",
            "name": "Acme Sdn Bhd",
            "relatedParty": [
                { "id": "IND-1", "role": "owner" },
                { "id": "IND-2", "role": "contact" },
            ],
        }));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/partyManagement/v5/individual/IND-2");
        then.status(200).json_body(json!({
            "id": "IND-2",
            "contactMedium": [
                { "characteristic": { "contactType": "phone", "phoneNumber": "123" } },
                { "characteristic": { "contactType": "email", "emailAddress": "pic@acme.example" } },
            ],
        }));
    });

    let enrichment = client.get_enrichment("V7").await;
    assert_eq!(enrichment.reserved_number.as_deref(), Some("0312345678"));
    assert_eq!(enrichment.billing_account_id.as_deref(), Some("BA-7"));
    assert_eq!(enrichment.billing_account_name.as_deref(), Some("Acme Sdn Bhd"));
    assert_eq!(enrichment.pic_email.as_deref(), Some("pic@acme.example"));
}

#[tokio::test]
async fn enrichment_hop_failure_returns_partial_data() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/serviceInventoryManagement/v5/service/V8");
        then.status(200).json_body(json!({
            "id": "V8",
            "x_externalId": "0355554444",
            "x_billingAccountId": "BA-8",
        }));
    });
    // The billing-account hop returns a server error.

    let enrichment = client.get_enrichment("V8").await;
    assert_eq!(enrichment.reserved_number.as_deref(), Some("0355554444"));
    assert_eq!(enrichment.billing_account_id.as_deref(), Some("BA-8"));
    assert_eq!(enrichment.billing_account_name, None);
    assert_eq!(enrichment.pic_email, None);
}

#[tokio::test]
async fn oe_batch_tracks_counters_and_tickets() {
    let server = MockServer::start();
    let client = RuntimeClient::new(server.base_url(), "test-key");

    // V10 not impacted, V11 skipped (replacement exists).
    let attachment = voice_attachment(complete_voice_attrs());
    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceInfo/V10");
        then.status(200).json_body(service_info("V10", &attachment));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/tmf-api/oeServiceManagement/v1/oeServiceInfo/V11");
        then.status(200).json_body(json!({
            "success": true,
            "replacementServiceExists": true,
            "attachmentContent": "{}",
            "productDefinitionName": "Enterprise Voice Plan",
        }));
    });

    for ticket in ["SPV10", "SPV11"] {
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/tmf-api/serviceProblemManagement/v5/serviceProblem/{ticket}"));
            then.status(200)
                .json_body(json!({ "id": ticket, "characteristic": [] }));
        });
    }
    // The three ticket-patch mocks are disjoint by body content: the
    // in-progress status write, the characteristic merge, and the final
    // closed status write.
    let in_progress_patch = server.mock(|when, then| {
        when.method(PATCH)
            .path_contains("/serviceProblem/")
            .body_contains("inProgress");
        then.status(200).json_body(json!({}));
    });
    let characteristic_patch = server.mock(|when, then| {
        when.method(PATCH)
            .path_contains("/serviceProblem/")
            .body_contains("remediationState");
        then.status(200).json_body(json!({}));
    });
    let closed_patch = server.mock(|when, then| {
        when.method(PATCH)
            .path_contains("/serviceProblem/")
            .body_contains("closed");
        then.status(200).json_body(json!({}));
    });
    let job_patch = server.mock(|when, then| {
        when.method(PATCH).path("/tmf-api/batchProcessing/v1/batchJob/job-oe");
        then.status(200).json_body(json!({}));
    });

    let entries = vec![
        DiscoveredService {
            service_id: "V10".to_string(),
            ticket_id: "SPV10".to_string(),
            service_type: "Voice".to_string(),
        },
        DiscoveredService {
            service_id: "V11".to_string(),
            ticket_id: "SPV11".to_string(),
            service_type: "Voice".to_string(),
        },
    ];
    let mut executor = OeBatchExecutor::new(client, Some("job-oe".to_string()), false);
    let results = executor.execute(entries, None).await.to_vec();

    assert_eq!(results.len(), 2);
    assert_eq!(executor.summary.total, 2);
    assert_eq!(executor.summary.not_impacted, 1);
    assert_eq!(executor.summary.skipped, 1);
    assert_eq!(executor.summary.failed, 0);
    assert_eq!(executor.summary.pending, 0);
    assert!(job_patch.hits() >= 4);
    assert_eq!(in_progress_patch.hits(), 2);
    assert_eq!(closed_patch.hits(), 2);
    assert_eq!(characteristic_patch.hits(), 4);
}
