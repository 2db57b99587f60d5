mod common;

use futures::StreamExt;
use std::sync::Arc;

use common::{account, bucket, fast_policy, CountingBroker, Harness, ScriptedApi, ScriptedPage};
use fleetscan_engine::fleet_scan::discovery::EnumerationTarget;
use fleetscan_engine::fleet_scan::{CloudError, CloudResourceApi, ErrorClass, PageEnumerator, ScanError};

async fn enumerate(harness: &Harness, account_id: &str) -> PageEnumerator {
    let target = Arc::new(account(account_id, &["r1"]));
    let credential = harness.cache.get(&target).await.unwrap();
    PageEnumerator::new(
        harness.api.clone() as Arc<dyn CloudResourceApi>,
        harness.cache.clone(),
        credential,
        EnumerationTarget {
            account: target,
            service: "storage".to_string(),
            region: "r1".to_string(),
            resource_type: "bucket".to_string(),
        },
    )
    .with_policy(fast_policy())
}

#[tokio::test]
async fn test_follows_continuation_tokens() {
    let api = ScriptedApi::new().script(
        "x",
        "storage",
        "r1",
        "bucket",
        vec![
            ScriptedPage::of(vec![bucket("x", "r1", "b1", false), bucket("x", "r1", "b2", false)]),
            ScriptedPage::of(vec![]),
            ScriptedPage::of(vec![bucket("x", "r1", "b3", true)]),
        ],
    );
    let harness = Harness::new(CountingBroker::new(), api);

    let ids: Vec<String> = enumerate(&harness, "x")
        .await
        .into_stream()
        .map(|item| item.unwrap().resource_id)
        .collect()
        .await;

    assert_eq!(ids, vec!["b1", "b2", "b3"]);
    assert_eq!(
        harness.api.calls(),
        vec!["x/storage/r1/bucket#0", "x/storage/r1/bucket#1", "x/storage/r1/bucket#2"]
    );
}

#[tokio::test]
async fn test_empty_first_page_is_empty_sequence() {
    let api = ScriptedApi::new().script("x", "storage", "r1", "bucket", vec![ScriptedPage::of(vec![])]);
    let harness = Harness::new(CountingBroker::new(), api);

    let mut enumerator = enumerate(&harness, "x").await;
    assert!(enumerator.next().await.is_none());
}

#[tokio::test]
async fn test_first_page_client_error_aborts() {
    let api = ScriptedApi::new().script(
        "x",
        "storage",
        "r1",
        "bucket",
        vec![ScriptedPage::failing(CloudError::Forbidden("denied".to_string()))],
    );
    let harness = Harness::new(CountingBroker::new(), api);

    let mut enumerator = enumerate(&harness, "x").await;
    let err = enumerator.next().await.unwrap().unwrap_err();
    assert_eq!(err.class(), Some(ErrorClass::PermanentClientError));
    assert!(enumerator.next().await.is_none());
    // Client errors are not retried
    assert_eq!(harness.api.calls().len(), 1);
}

#[tokio::test]
async fn test_later_page_failure_keeps_yielded_records() {
    let api = ScriptedApi::new().script(
        "x",
        "storage",
        "r1",
        "bucket",
        vec![
            ScriptedPage::of(vec![bucket("x", "r1", "b1", false), bucket("x", "r1", "b2", false)]),
            ScriptedPage::failing(CloudError::BadRequest("bad token".to_string())),
        ],
    );
    let harness = Harness::new(CountingBroker::new(), api);

    let items: Vec<Result<_, ScanError>> = enumerate(&harness, "x").await.into_stream().collect().await;

    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok());
    assert!(items[1].is_ok());
    assert!(matches!(items[2], Err(ScanError::Enumeration { .. })));
}

#[tokio::test]
async fn test_throttling_is_retried_until_success() {
    let api = ScriptedApi::new().script(
        "x",
        "storage",
        "r1",
        "bucket",
        vec![ScriptedPage::of(vec![bucket("x", "r1", "b1", true)]).failing_first(vec![
            CloudError::ServerError("blip".to_string()),
            CloudError::Throttled("rate".to_string()),
            CloudError::Throttled("rate".to_string()),
        ])],
    );
    let harness = Harness::new(CountingBroker::new(), api);

    let mut enumerator = enumerate(&harness, "x").await;
    assert_eq!(enumerator.next().await.unwrap().unwrap().resource_id, "b1");
    assert!(enumerator.next().await.is_none());
    assert_eq!(harness.api.calls().len(), 4);
}

#[tokio::test]
async fn test_auth_expiry_refreshes_once_and_retries_page() {
    let api = ScriptedApi::new().script(
        "x",
        "storage",
        "r1",
        "bucket",
        vec![ScriptedPage::of(vec![bucket("x", "r1", "b1", true)])
            .failing_first(vec![CloudError::Unauthorized("expired".to_string())])],
    );
    let harness = Harness::new(CountingBroker::new(), api);

    let mut enumerator = enumerate(&harness, "x").await;
    assert_eq!(enumerator.next().await.unwrap().unwrap().resource_id, "b1");

    assert_eq!(harness.broker.calls(), 2);
    let keys = harness.api.keys_seen();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
}

#[tokio::test]
async fn test_repeated_auth_expiry_gives_up_after_one_refresh() {
    let api = ScriptedApi::new().script(
        "x",
        "storage",
        "r1",
        "bucket",
        vec![ScriptedPage::failing(CloudError::Unauthorized("expired".to_string()))],
    );
    let harness = Harness::new(CountingBroker::new(), api);

    let mut enumerator = enumerate(&harness, "x").await;
    let err = enumerator.next().await.unwrap().unwrap_err();

    assert!(matches!(
        err,
        ScanError::Enumeration {
            source: CloudError::Unauthorized(_),
            ..
        }
    ));
    assert_eq!(harness.broker.calls(), 2);
    assert_eq!(harness.api.calls().len(), 2);
}
