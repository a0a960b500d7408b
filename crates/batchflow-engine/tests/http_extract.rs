//! HTTP extraction against a mock API
//!
//! Covers pagination stop rules, record location, and which failures are
//! retried.

use batchflow_common::{ColumnType, Value};
use batchflow_engine::extract::{Extractor, HttpExtractor};
use batchflow_engine::jobs::HttpSourceParams;
use batchflow_engine::{EtlError, RetryPolicy};
use serde_json::json;
use std::collections::BTreeMap;
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn params(server: &MockServer, page_size: usize) -> HttpSourceParams {
    HttpSourceParams {
        endpoint: format!("{}/orders", server.uri()),
        query: BTreeMap::new(),
        page_size,
        page_param: "page".to_string(),
        size_param: "limit".to_string(),
        first_page: 1,
        data_key: None,
        max_pages: None,
        bearer_token_env: None,
        timeout_secs: 5,
    }
}

fn records(offset: usize, count: usize) -> serde_json::Value {
    json!((offset..offset + count)
        .map(|i| json!({"id": i, "amount": i as f64 + 0.5, "tags": ["a", "b"]}))
        .collect::<Vec<_>>())
}

async fn mount_page(server: &MockServer, page: u64, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("page", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_pages_concatenate_in_fetch_order() {
    let server = MockServer::start().await;
    mount_page(&server, 1, json!({"data": records(0, 100)})).await;
    mount_page(&server, 2, json!({"data": records(100, 100)})).await;
    mount_page(&server, 3, json!({"data": records(200, 37)})).await;

    let extractor = HttpExtractor::new(params(&server, 100), RetryPolicy::none()).unwrap();
    let batch = extractor.extract().await.unwrap();

    assert_eq!(batch.len(), 237);
    let ids: Vec<i64> = batch
        .column_values("id")
        .unwrap()
        .map(|v| match v {
            Value::Int(i) => *i,
            other => panic!("unexpected id {other:?}"),
        })
        .collect();
    assert_eq!(ids, (0..237).collect::<Vec<i64>>());
    assert_eq!(batch.schema().column("amount").unwrap().column_type, ColumnType::Float);
    assert_eq!(batch.rows()[0][2], Value::from("[\"a\",\"b\"]"));
}

#[tokio::test]
async fn test_size_param_and_query_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("limit", "50"))
        .and(query_param("status", "open"))
        .respond_with(ResponseTemplate::new(200).set_body_json(records(0, 3)))
        .expect(1)
        .mount(&server)
        .await;

    let mut params = params(&server, 50);
    params.query.insert("status".to_string(), "open".to_string());
    let batch = HttpExtractor::new(params, RetryPolicy::none())
        .unwrap()
        .extract()
        .await
        .unwrap();
    assert_eq!(batch.len(), 3);
}

#[tokio::test]
async fn test_explicit_end_signal_stops_paging() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        1,
        json!({"results": records(0, 10), "has_more": false}),
    )
    .await;

    let batch = HttpExtractor::new(params(&server, 10), RetryPolicy::none())
        .unwrap()
        .extract()
        .await
        .unwrap();
    assert_eq!(batch.len(), 10);
}

#[tokio::test]
async fn test_max_pages_caps_fetching() {
    let server = MockServer::start().await;
    for page in 1..=3 {
        mount_page(&server, page, json!({"items": records(0, 5)})).await;
    }

    let mut params = params(&server, 5);
    params.data_key = Some("items".to_string());
    params.max_pages = Some(2);
    let batch = HttpExtractor::new(params, RetryPolicy::none())
        .unwrap()
        .extract()
        .await
        .unwrap();
    assert_eq!(batch.len(), 10);
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .expect(1)
        .mount(&server)
        .await;

    let err = HttpExtractor::new(params(&server, 100), RetryPolicy::immediate(3))
        .unwrap()
        .extract()
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::Source { status: Some(401), .. }));
}

#[tokio::test]
async fn test_service_unavailable_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_page(&server, 1, records(0, 4)).await;

    let batch = HttpExtractor::new(params(&server, 100), RetryPolicy::immediate(3))
        .unwrap()
        .extract()
        .await
        .unwrap();
    assert_eq!(batch.len(), 4);
}

#[tokio::test]
async fn test_exhausted_retries_surface_network_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let err = HttpExtractor::new(params(&server, 100), RetryPolicy::immediate(3))
        .unwrap()
        .extract()
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::Network(_)));
}

#[tokio::test]
async fn test_non_json_body_is_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let mut params = params(&server, 100);
    params.endpoint = format!("{}/broken", server.uri());
    let err = HttpExtractor::new(params, RetryPolicy::immediate(3))
        .unwrap()
        .extract()
        .await
        .unwrap_err();
    assert!(matches!(err, EtlError::Parse { .. }));
}

#[tokio::test]
#[serial_test::serial]
async fn test_bearer_token_from_environment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(records(0, 1)))
        .expect(1)
        .mount(&server)
        .await;

    std::env::set_var("BATCHFLOW_TEST_API_TOKEN", "s3cret");
    let mut params = params(&server, 10);
    params.bearer_token_env = Some("BATCHFLOW_TEST_API_TOKEN".to_string());
    let extractor = HttpExtractor::new(params, RetryPolicy::none()).unwrap();
    std::env::remove_var("BATCHFLOW_TEST_API_TOKEN");

    assert_eq!(extractor.extract().await.unwrap().len(), 1);
}
