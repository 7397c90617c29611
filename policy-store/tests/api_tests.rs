//! Control API tests
//!
//! Exercise the router in-process with `oneshot` requests and check the
//! status mapping of every dataset route.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

use policy_common::{MemoryNetwork, PolicyError};
use policy_store::{
    create_router, MemoryStorageNode, PermissionTable, PolicyStore, StorageDirectory, StoreOptions,
};

fn setup() -> (Router, Arc<PolicyStore>, Arc<MemoryStorageNode>) {
    let node = Arc::new(MemoryStorageNode::new("N1"));
    let storage = StorageDirectory::new();
    storage.insert(node.clone());
    let store = Arc::new(PolicyStore::new(
        StoreOptions::default(),
        storage,
        PermissionTable::default(),
        MemoryNetwork::new().join("P1"),
    ));
    store.register_dataset("d1", "N1");
    (create_router(Arc::clone(&store)), store, node)
}

async fn send(app: Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, String) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_identifiers() {
    let (app, _, _) = setup();
    let (status, body) = send(app, Method::GET, "/dataset/identifiers", None).await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["Identifiers"], serde_json::json!(["d1"]));
}

#[tokio::test]
async fn test_get_policy() {
    let (app, _, _) = setup();
    let (status, body) = send(app.clone(), Method::GET, "/dataset/getpolicy/d1", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["Policy"], "false");

    let (status, body) = send(app, Method::GET, "/dataset/getpolicy/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("Dataset 'nope' was not found"));
}

#[tokio::test]
async fn test_blank_identifier_is_bad_request() {
    let (app, _, _) = setup();
    let (status, _) = send(app, Method::GET, "/dataset/getpolicy/%20", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_identifier_is_bad_request() {
    let (app, _, node) = setup();

    let (status, body) = send(app.clone(), Method::GET, "/dataset/getpolicy/", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Bad Request: Missing dataset identifier");

    let (status, _) = send(
        app.clone(),
        Method::PUT,
        "/dataset/setpolicy/",
        Some(r#"{"policy": true}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app, Method::GET, "/dataset/metadata/", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(node.store_calls(), 0);
}

#[tokio::test]
async fn test_metadata_not_implemented() {
    let (app, _, _) = setup();
    let (status, _) = send(app, Method::GET, "/dataset/metadata/d1", None).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_set_policy_commits() {
    let (app, store, node) = setup();
    let (status, body) = send(
        app,
        Method::PUT,
        "/dataset/setpolicy/d1",
        Some(r#"{"policy": true}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Successfully set a new policy for d1\n");
    assert!(store.get_object_policy("d1").unwrap().allows());
    assert_eq!(node.store_calls(), 1);
}

#[tokio::test]
async fn test_set_policy_accepts_rule_and_capitalized_field() {
    let (app, store, _) = setup();
    let (status, _) = send(
        app,
        Method::PUT,
        "/dataset/setpolicy/d1",
        Some(r#"{"Policy": "office hours"}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(store.get_object_policy("d1").unwrap().as_str(), "office hours");
}

#[tokio::test]
async fn test_set_policy_error_mapping() {
    let (app, _, node) = setup();

    let (status, _) = send(app.clone(), Method::PUT, "/dataset/setpolicy/d2", Some(r#"{"policy": true}"#)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(app.clone(), Method::PUT, "/dataset/setpolicy/d1", Some("{broken")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app.clone(), Method::PUT, "/dataset/setpolicy/d1", Some(r#"{"other": 1}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    node.set_failure(Some(PolicyError::Unavailable("offline".to_string())));
    let (status, body) = send(app, Method::PUT, "/dataset/setpolicy/d1", Some(r#"{"policy": true}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("offline"));
}

#[tokio::test]
async fn test_health_and_status() {
    let (app, _, _) = setup();

    let (status, body) = send(app.clone(), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["peer"], "P1");

    let (status, body) = send(app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["datasets"], 1);
}
