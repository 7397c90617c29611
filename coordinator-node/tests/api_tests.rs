//! Coordinator API tests, driven in-process with `oneshot`

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use coordinator_node::{create_router, AuthorityOptions, CoordinatingAuthority};
use policy_common::{DataUser, MemoryNetwork, Node, Subject};
use policy_store::{MemoryStorageNode, PermissionTable, PolicyStore, StorageDirectory, StoreOptions};

fn setup() -> (Router, Arc<PolicyStore>, Arc<CoordinatingAuthority>) {
    let network = MemoryNetwork::new();

    let storage = StorageDirectory::new();
    storage.insert(Arc::new(MemoryStorageNode::new("N1")));
    let store = Arc::new(PolicyStore::new(
        StoreOptions::default(),
        storage,
        PermissionTable::new([Node::new("N1")], [DataUser::new("alice")]),
        network.join("P1"),
    ));
    store.register_dataset("d1", "N1");
    store.attach();

    let authority = Arc::new(CoordinatingAuthority::new(
        AuthorityOptions {
            query_window: Duration::from_millis(100),
            expected_responders: Some(1),
            ..AuthorityOptions::default()
        },
        network.join("C1"),
    ));
    authority.attach();

    (create_router(Arc::clone(&authority)), store, authority)
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
async fn test_grant_to_storage_nodes() {
    let (app, store, _) = setup();
    let (status, body) = send(
        app.clone(),
        Method::POST,
        "/permissions/grant",
        Some(r#"{"subject": "d1", "permission": "read", "scope": {"storage_nodes": ["N1"]}}"#),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "published");
    assert_eq!(
        store.permissions().node_decision(&Subject::new("d1"), &Node::new("N1")),
        Some(true)
    );

    let (status, body) = send(app, Method::GET, "/permissions/storage-nodes?subject=d1", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["storage_nodes"], serde_json::json!(["N1"]));
}

#[tokio::test]
async fn test_grant_defaults_to_everyone_and_revoke() {
    let (app, store, _) = setup();
    let d1 = Subject::new("d1");

    let (status, _) = send(app.clone(), Method::POST, "/permissions/grant", Some(r#"{"subject": "d1"}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(store.is_access_allowed(&d1, &DataUser::new("alice")));

    let (_, body) = send(app.clone(), Method::GET, "/permissions/data-users?subject=d1", None).await;
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["data_users"], serde_json::json!(["alice"]));

    let (status, _) = send(
        app,
        Method::POST,
        "/permissions/revoke",
        Some(r#"{"subject": "d1", "scope": {"data_users": ["alice"]}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(!store.is_access_allowed(&d1, &DataUser::new("alice")));
}

#[tokio::test]
async fn test_bad_directive_requests() {
    let (app, _, authority) = setup();

    let (status, _) = send(app.clone(), Method::POST, "/permissions/grant", Some(r#"{"subject": "  "}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        app.clone(),
        Method::POST,
        "/permissions/revoke",
        Some(r#"{"subject": "d1", "scope": {"storage_nodes": []}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with("Bad Request"));

    let (status, _) = send(app, Method::POST, "/permissions/grant", Some("{broken")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(authority.stats().directives_issued, 0);
}

#[tokio::test]
async fn test_query_requires_subject() {
    let (app, _, _) = setup();

    let (status, _) = send(app.clone(), Method::GET, "/permissions/storage-nodes", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app, Method::GET, "/permissions/data-users?subject=", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_status() {
    let (app, _, _) = setup();

    let (status, body) = send(app.clone(), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["peer"], "C1");

    let (status, body) = send(app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["directives_issued"], 0);
}
