use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::http::HeaderMap;
use hugr_router::Configuration;
use hugr_router::service::GraphQlRequest;
use pretty_assertions::assert_eq;
use serde_json_bytes::Map;
use serde_json_bytes::json;

use crate::fixtures;
use crate::fixtures::row;

fn cached_config() -> Configuration {
    Configuration {
        cache_ttl: Duration::from_secs(60),
        ..Configuration::default()
    }
}

fn request(query: &str) -> GraphQlRequest {
    GraphQlRequest {
        query: query.to_owned(),
        variables: Map::new(),
        operation_name: None,
    }
}

const ORDERS_QUERY: &str = r#"{ orders { id total } }"#;

#[tokio::test]
async fn identical_requests_are_served_from_the_cache() {
    let harness = fixtures::shop_gateway(cached_config()).await;
    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(1)),
        ("c1", json!(10.0)),
    ])]);

    let baseline = harness.engine.calls.load(Ordering::SeqCst);
    let first = harness
        .gateway
        .handle(request(ORDERS_QUERY), &HeaderMap::new())
        .await;
    let second = harness
        .gateway
        .handle(request(ORDERS_QUERY), &HeaderMap::new())
        .await;
    assert!(first.errors.is_empty() && second.errors.is_empty());
    assert_eq!(
        serde_json::to_value(&first.data).expect("serializable"),
        serde_json::to_value(&second.data).expect("serializable"),
    );
    // One engine execution served both requests.
    assert_eq!(harness.engine.calls.load(Ordering::SeqCst) - baseline, 1);
}

#[tokio::test]
async fn whitespace_variants_share_one_cache_entry() {
    let harness = fixtures::shop_gateway(cached_config()).await;
    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(1)),
        ("c1", json!(10.0)),
    ])]);

    let baseline = harness.engine.calls.load(Ordering::SeqCst);
    harness
        .gateway
        .handle(request("{ orders { id total } }"), &HeaderMap::new())
        .await;
    harness
        .gateway
        .handle(request("{\n  orders {\n    id\n    total\n  }\n}"), &HeaderMap::new())
        .await;
    assert_eq!(harness.engine.calls.load(Ordering::SeqCst) - baseline, 1);
}

#[tokio::test]
async fn schema_reload_invalidates_cached_responses() {
    let harness = fixtures::shop_gateway(cached_config()).await;
    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(1)),
        ("c1", json!(10.0)),
    ])]);

    let baseline = harness.engine.calls.load(Ordering::SeqCst);
    harness
        .gateway
        .handle(request(ORDERS_QUERY), &HeaderMap::new())
        .await;

    // Reloading the source bumps the schema version; the old fingerprint can
    // never be served again even if the invalidation broadcast were missed.
    harness.gateway.registry().reload("shop").await.expect("reload");

    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(1)),
        ("c1", json!(10.0)),
    ])]);
    harness
        .gateway
        .handle(request(ORDERS_QUERY), &HeaderMap::new())
        .await;
    assert_eq!(harness.engine.calls.load(Ordering::SeqCst) - baseline, 2);
}

#[tokio::test]
async fn mutations_invalidate_the_tags_they_touch() {
    let harness = fixtures::shop_gateway(cached_config()).await;
    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(1)),
        ("c1", json!(10.0)),
    ])]);

    let baseline = harness.engine.calls.load(Ordering::SeqCst);
    harness
        .gateway
        .handle(request(ORDERS_QUERY), &HeaderMap::new())
        .await;

    // The mutation touches the same table and therefore the same tags.
    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(1)),
    ])]);
    harness
        .gateway
        .handle(
            request(
                r#"mutation { update_orders(filter: { id: { eq: 1 } }, data: { total: 0.0 }) { affected_rows } }"#,
            ),
            &HeaderMap::new(),
        )
        .await;

    harness.engine.responses.lock().expect("engine lock").push(vec![row(&[
        ("c0", json!(1)),
        ("c1", json!(0.0)),
    ])]);
    harness
        .gateway
        .handle(request(ORDERS_QUERY), &HeaderMap::new())
        .await;
    // select, mutation, select again after invalidation.
    assert_eq!(harness.engine.calls.load(Ordering::SeqCst) - baseline, 3);
}
