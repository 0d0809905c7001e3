use axum::http::HeaderMap;
use hugr_router::Configuration;
use hugr_router::service::GraphQlRequest;
use pretty_assertions::assert_eq;
use serde_json_bytes::Map;
use serde_json_bytes::json;

use crate::fixtures;
use crate::fixtures::row;

fn request(query: &str) -> GraphQlRequest {
    GraphQlRequest {
        query: query.to_owned(),
        variables: Map::new(),
        operation_name: None,
    }
}

#[tokio::test]
async fn query_flows_from_document_to_shaped_response() {
    let harness = fixtures::shop_gateway(Configuration::default()).await;
    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(3)),
        ("c1", json!(200.0)),
    ])]);

    let response = harness
        .gateway
        .handle(
            request(
                r#"{
                  orders(
                    filter: { status: { eq: "pending" } }
                    order_by: [{ field: "total", direction: DESC }]
                    limit: 1
                  ) { id total }
                }"#,
            ),
            &HeaderMap::new(),
        )
        .await;

    assert!(response.errors.is_empty(), "unexpected errors: {:?}", response.errors);
    let data = serde_json::to_value(&response.data).expect("serializable");
    assert_eq!(
        data,
        serde_json::json!({"orders": [{"id": 3, "total": 200.0}]})
    );

    let executed = harness.engine.executed.lock().expect("engine lock").clone();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("FROM \"shop\".\"orders\""));
    assert!(executed[0].contains("LIMIT 1"));
}

#[tokio::test]
async fn unknown_field_returns_a_graphql_error() {
    let harness = fixtures::shop_gateway(Configuration::default()).await;
    let response = harness
        .gateway
        .handle(request(r#"{ shipments { id } }"#), &HeaderMap::new())
        .await;
    assert!(response.data.is_none());
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].extensions.code, "INVALID_ARGUMENT_VALUE");
}

#[tokio::test]
async fn depth_limit_maps_to_the_depth_exceeded_code() {
    let config = Configuration {
        max_depth: 1,
        ..Configuration::default()
    };
    let harness = fixtures::shop_gateway(config).await;
    let response = harness
        .gateway
        .handle(request(r#"{ orders_aggregation { total { sum } } }"#), &HeaderMap::new())
        .await;
    assert!(
        response
            .errors
            .iter()
            .any(|e| e.extensions.code == "DEPTH_EXCEEDED"),
        "expected DEPTH_EXCEEDED, got: {:?}",
        response.errors
    );
}

#[tokio::test]
async fn version_query_does_not_touch_the_engine() {
    let harness = fixtures::shop_gateway(Configuration::default()).await;
    let before = harness
        .engine
        .calls
        .load(std::sync::atomic::Ordering::SeqCst);
    let response = harness
        .gateway
        .handle(request(r#"{ _version }"#), &HeaderMap::new())
        .await;
    assert!(response.errors.is_empty());
    let after = harness
        .engine
        .calls
        .load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(before, after);
}

#[tokio::test]
async fn mutation_executes_and_reports_affected_rows() {
    let harness = fixtures::shop_gateway(Configuration::default()).await;
    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(2)),
    ])]);

    let response = harness
        .gateway
        .handle(
            request(
                r#"mutation {
                  update_orders(
                    filter: { status: { eq: "pending" } }
                    data: { status: "done" }
                  ) { affected_rows }
                }"#,
            ),
            &HeaderMap::new(),
        )
        .await;
    assert!(response.errors.is_empty(), "unexpected errors: {:?}", response.errors);
    let data = serde_json::to_value(&response.data).expect("serializable");
    assert_eq!(
        data,
        serde_json::json!({"update_orders": {"affected_rows": 2}})
    );
}
