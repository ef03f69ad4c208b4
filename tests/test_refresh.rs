mod common;

use shopetl::error::PipelineError;
use shopetl::refresh::{DashboardConfig, DashboardRefresh, PowerBiRefresh};

use common::spawn_mock_server;

fn config(url: &str) -> DashboardConfig {
    DashboardConfig {
        dataset_id: Some("ds-42".to_string()),
        tenant_id: Some("tenant-1".to_string()),
        client_id: Some("client-1".to_string()),
        username: Some("bi@example.com".to_string()),
        password: Some("s3cret&more".to_string()),
        authority_url: Some(url.to_string()),
        api_url: Some(url.to_string()),
    }
}

#[tokio::test]
async fn accepted_refresh_succeeds() {
    let (url, handle, rx) = spawn_mock_server(vec![
        (200, r#"{"access_token":"tok-123","token_type":"Bearer"}"#.to_string()),
        (202, String::new()),
    ]);

    let refresher = PowerBiRefresh::new(&config(&url)).unwrap();
    refresher.trigger().await.unwrap();
    handle.join().unwrap();

    let token_request = rx.recv().unwrap();
    assert!(token_request.starts_with("POST /tenant-1/oauth2/v2.0/token"));
    assert!(token_request.contains("grant_type=password"));
    assert!(token_request.contains("username=bi%40example.com"));
    assert!(token_request.contains("password=s3cret%26more"));

    let refresh_request = rx.recv().unwrap();
    assert!(refresh_request.starts_with("POST /datasets/ds-42/refreshes"));
    assert!(
        refresh_request
            .to_lowercase()
            .contains("authorization: bearer tok-123")
    );
}

#[tokio::test]
async fn other_status_is_refresh_error() {
    let (url, handle, _rx) = spawn_mock_server(vec![
        (200, r#"{"access_token":"tok-123"}"#.to_string()),
        (403, r#"{"error":"forbidden"}"#.to_string()),
    ]);

    let refresher = PowerBiRefresh::new(&config(&url)).unwrap();
    let err = refresher.trigger().await.unwrap_err();
    handle.join().unwrap();

    match err {
        PipelineError::Refresh(msg) => assert!(msg.contains("403")),
        other => panic!("expected refresh error, got {:?}", other),
    }
}

#[tokio::test]
async fn rejected_token_request_is_refresh_error() {
    let (url, handle, _rx) = spawn_mock_server(vec![(
        400,
        r#"{"error":"invalid_grant","error_description":"AADSTS50126: bad password"}"#.to_string(),
    )]);

    let refresher = PowerBiRefresh::new(&config(&url)).unwrap();
    let err = refresher.trigger().await.unwrap_err();
    handle.join().unwrap();

    assert!(err.to_string().contains("AADSTS50126"));
}
