//! Submission queue tests: retry classification, folio reuse, priority
//! preemption and cancellation.

mod common;

use batch_invoicing_service::models::{BatchStatus, ItemStatus};
use batch_invoicing_service::services::{MockInvoicingProvider, ProviderFailure};
use common::{TestApp, TestHarness, items_with_status};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

async fn create_adhoc_invoice(app: &TestApp, customer_ref: &str) -> serde_json::Value {
    let response = app
        .client
        .post(format!("{}/invoices", app.address))
        .header("X-Owner-Id", app.owner_id.to_string())
        .json(&json!({
            "tenant_id": app.tenant_id,
            "customer_ref": customer_ref,
            "order_ref": "PO-1",
            "amount": "1160.00",
            "treatment": "no_withholding",
        }))
        .send()
        .await
        .expect("Failed to execute create invoice request");
    assert_eq!(response.status(), 202);
    response.json().await.unwrap()
}

#[tokio::test]
async fn retryable_failure_reuses_folio_and_creates_one_invoice() {
    let provider = Arc::new(MockInvoicingProvider::new());
    // First attempt for folio 1 fails retryably, second succeeds.
    provider.fail_folio(1, vec![ProviderFailure::Retryable("gateway timeout".into())]);

    let app = TestApp::spawn_with(TestHarness {
        provider: provider.clone(),
        ..Default::default()
    })
    .await;
    app.register_customer("ACME", false);

    let created = create_adhoc_invoice(&app, "ACME").await;
    let batch_id = created["batch_id"].as_str().unwrap().to_string();
    assert_eq!(created["folio"], 1);

    let snapshot = app.wait_for_status(&batch_id, BatchStatus::Completed).await;
    assert_eq!(items_with_status(&snapshot, ItemStatus::Submitted), 1);

    // Both attempts carried the folio allocated before the first enqueue;
    // the allocator was never consulted again.
    let calls = app.provider.submitted_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.folio == 1));
    assert_eq!(app.provider.successful_submissions(), 1);
    assert_eq!(app.allocator.last_issued(app.tenant_id, "A"), Some(1));
}

#[tokio::test]
async fn terminal_failure_fails_immediately_without_retry() {
    let provider = Arc::new(MockInvoicingProvider::new());
    provider.fail_folio(
        1,
        vec![ProviderFailure::Terminal("invalid tax id".into())],
    );

    let app = TestApp::spawn_with(TestHarness {
        provider: provider.clone(),
        ..Default::default()
    })
    .await;
    app.register_customer("ACME", false);

    let created = create_adhoc_invoice(&app, "ACME").await;
    let batch_id = created["batch_id"].as_str().unwrap().to_string();

    let snapshot = app.wait_for_status(&batch_id, BatchStatus::Failed).await;
    assert_eq!(items_with_status(&snapshot, ItemStatus::SubmitFailed), 1);

    // Exactly one call: terminal classification never retries.
    assert_eq!(app.provider.submitted_calls().len(), 1);

    let item = &snapshot["items"][0];
    assert!(item["error"].as_str().unwrap().contains("invalid tax id"));
    // The folio stays consumed even though the submission died.
    assert_eq!(app.allocator.last_issued(app.tenant_id, "A"), Some(1));
}

#[tokio::test]
async fn retry_attempts_are_capped() {
    let provider = Arc::new(MockInvoicingProvider::new());
    provider.fail_folio(
        1,
        vec![
            ProviderFailure::Retryable("503".into()),
            ProviderFailure::Retryable("503".into()),
            ProviderFailure::Retryable("503".into()),
            ProviderFailure::Retryable("503".into()),
        ],
    );

    let app = TestApp::spawn_with(TestHarness {
        provider: provider.clone(),
        ..Default::default()
    })
    .await;
    app.register_customer("ACME", false);

    let created = create_adhoc_invoice(&app, "ACME").await;
    let batch_id = created["batch_id"].as_str().unwrap().to_string();

    let snapshot = app.wait_for_status(&batch_id, BatchStatus::Failed).await;
    assert_eq!(items_with_status(&snapshot, ItemStatus::SubmitFailed), 1);

    // max_attempts is 3: the fourth scripted failure is never consumed.
    assert_eq!(app.provider.submitted_calls().len(), 3);
}

#[tokio::test]
async fn cancellation_blocks_undispatched_submissions() {
    let gate = Arc::new(Semaphore::new(0));
    let provider = Arc::new(MockInvoicingProvider::with_gate(gate.clone()));

    // One submission in flight at a time makes the stepping deterministic.
    let app = TestApp::spawn_with(TestHarness {
        provider: provider.clone(),
        max_in_flight: 1,
        ..Default::default()
    })
    .await;
    app.register_customer("ACME", false);

    for i in 1..=5 {
        app.seed_document(&format!("doc-{}", i), "ACME", "116.00", 90)
            .await;
    }
    let docs = (1..=5).map(|i| app.document_request(&format!("doc-{}", i))).collect();
    let response = app.create_batch(docs).await;
    let created: serde_json::Value = response.json().await.unwrap();
    let batch_id = created["batch_id"].as_str().unwrap().to_string();

    app.wait_for_status(&batch_id, BatchStatus::AwaitingConfirmation)
        .await;
    app.confirm_batch(&batch_id, "no_withholding").await;

    // Let two submissions through, then wait until the third has passed its
    // cancellation check and is blocked inside the provider.
    gate.add_permits(2);
    wait_until(|| app.provider.entered_count() == 3).await;

    let response = app.cancel_batch(&batch_id).await;
    assert_eq!(response.status(), 200);

    // Release everything: the in-flight submission completes, the two never
    // dispatched are dropped.
    gate.add_permits(5);

    app.wait_for_item_count(&batch_id, ItemStatus::Submitted, 3)
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = app.get_batch(&batch_id).await;
    assert_eq!(snapshot["status"], "canceled");
    assert_eq!(items_with_status(&snapshot, ItemStatus::Submitted), 3);
    assert_eq!(items_with_status(&snapshot, ItemStatus::Queued), 2);
    assert_eq!(app.provider.successful_submissions(), 3);
    assert_eq!(app.provider.entered_count(), 3);

    // The summary reports the blocked items as failed with a reason.
    let failed = snapshot["summary"]["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed[0]["reason"].as_str().unwrap().contains("canceled"));
}

#[tokio::test]
async fn interactive_submissions_preempt_batch_work() {
    let gate = Arc::new(Semaphore::new(0));
    let provider = Arc::new(MockInvoicingProvider::with_gate(gate.clone()));

    let app = TestApp::spawn_with(TestHarness {
        provider: provider.clone(),
        max_in_flight: 1,
        ..Default::default()
    })
    .await;
    app.register_customer("ACME", false);

    for i in 1..=3 {
        app.seed_document(&format!("doc-{}", i), "ACME", "116.00", 90)
            .await;
    }
    let docs = (1..=3).map(|i| app.document_request(&format!("doc-{}", i))).collect();
    let response = app.create_batch(docs).await;
    let created: serde_json::Value = response.json().await.unwrap();
    let batch_id = created["batch_id"].as_str().unwrap().to_string();

    app.wait_for_status(&batch_id, BatchStatus::AwaitingConfirmation)
        .await;
    // Batch items get folios 1..3 at confirmation.
    app.confirm_batch(&batch_id, "no_withholding").await;
    wait_until(|| app.provider.entered_count() >= 1).await;

    // Ad-hoc invoice lands while batch work is queued; it gets folio 4.
    let adhoc = create_adhoc_invoice(&app, "ACME").await;
    assert_eq!(adhoc["folio"], 4);
    let adhoc_batch = adhoc["batch_id"].as_str().unwrap().to_string();

    gate.add_permits(10);

    app.wait_for_status(&batch_id, BatchStatus::Completed).await;
    app.wait_for_status(&adhoc_batch, BatchStatus::Completed)
        .await;

    // The interactive submission jumped ahead of at least the tail of the
    // batch tier: folio 4 completes before the last batch folio.
    let order: Vec<i64> = app
        .provider
        .submitted_calls()
        .iter()
        .filter(|c| c.outcome.is_ok())
        .map(|c| c.folio)
        .collect();
    assert_eq!(order.len(), 4);
    let interactive_pos = order.iter().position(|&f| f == 4).unwrap();
    let last_batch_pos = order.iter().position(|&f| f == 3).unwrap();
    assert!(
        interactive_pos < last_batch_pos,
        "interactive submission (folio 4) should preempt queued batch work: {:?}",
        order
    );
}

async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("Condition not reached within deadline");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
