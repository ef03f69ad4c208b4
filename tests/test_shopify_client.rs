mod common;

use std::time::Duration;

use serde_json::json;
use shopetl::cli::config::StoreConfig;
use shopetl::error::PipelineError;
use shopetl::extract::shopify::{ShopifyClient, ShopifyConnector};
use shopetl::extract::{ApiConnector, PaginatedExtractor, RemoteApi};

use common::spawn_mock_server;

fn client(url: &str) -> ShopifyClient {
    ShopifyClient::new(
        format!("{}/admin/api/2025-10/graphql.json", url),
        "shpat_test".to_string(),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn posts_query_and_variables_with_token_header() {
    let body = json!({ "data": { "orders": { "edges": [], "pageInfo": { "hasNextPage": false } } } });
    let (url, handle, rx) = spawn_mock_server(vec![(200, body.to_string())]);

    let result = client(&url)
        .execute("query Orders { orders { edges { node { id } } } }", &json!({ "cursor": null }))
        .await
        .unwrap();
    handle.join().unwrap();

    assert_eq!(result, body);
    let request = rx.recv().unwrap();
    assert!(request.starts_with("POST /admin/api/2025-10/graphql.json"));
    assert!(request.to_lowercase().contains("x-shopify-access-token: shpat_test"));
    assert!(request.contains("\"query\":\"query Orders"));
    assert!(request.contains("\"variables\":{\"cursor\":null}"));
}

#[tokio::test]
async fn non_success_status_is_transport_error() {
    let (url, handle, _rx) = spawn_mock_server(vec![(429, r#"{"errors":"Throttled"}"#.to_string())]);

    let err = client(&url).execute("q", &json!({})).await.unwrap_err();
    handle.join().unwrap();

    match err {
        PipelineError::Transport(msg) => {
            assert!(msg.contains("429"));
            assert!(msg.contains("Throttled"));
        }
        other => panic!("expected transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn invalid_json_is_protocol_error() {
    let (url, handle, _rx) = spawn_mock_server(vec![(200, "<html>maintenance</html>".to_string())]);

    let err = client(&url).execute("q", &json!({})).await.unwrap_err();
    handle.join().unwrap();

    assert!(matches!(err, PipelineError::Protocol(_)));
}

#[tokio::test]
async fn connector_paginates_through_mock_shop() {
    let first = json!({ "data": { "customers": {
        "edges": [{ "node": { "id": "gid://shopify/Customer/1" } }],
        "pageInfo": { "hasNextPage": true, "endCursor": "abc" }
    } } });
    let second = json!({ "data": { "customers": {
        "edges": [{ "node": { "id": "gid://shopify/Customer/2" } }],
        "pageInfo": { "hasNextPage": false, "endCursor": null }
    } } });
    let (url, handle, rx) =
        spawn_mock_server(vec![(200, first.to_string()), (200, second.to_string())]);

    let connector = ShopifyConnector {
        base_url: Some(url),
        ..Default::default()
    };
    let store = StoreConfig {
        name: "retail".to_string(),
        shop_name: Some("acme-retail".to_string()),
        access_token: Some("shpat_test".to_string()),
        id_prefix: None,
    };
    let api = connector.connect(&store).unwrap();
    let mut extractor =
        PaginatedExtractor::new(api, "retail/customers").with_min_interval(Duration::ZERO);

    let records = extractor.fetch_all("q", "customers", None).await.unwrap();
    handle.join().unwrap();

    assert_eq!(records.len(), 2);
    let _first_request = rx.recv().unwrap();
    let second_request = rx.recv().unwrap();
    assert!(second_request.contains("\"cursor\":\"abc\""));
}

#[test]
fn connector_requires_credentials() {
    let connector = ShopifyConnector::default();
    let err = connector
        .connect(&StoreConfig::named("retail"))
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::Config(ref m) if m.contains("shop_name")));
}
