mod common;

use collabd::metadata::MemoryMetadataStore;
use collabd::sandbox::MockRuntime;
use common::TestServer;
use serde_json::json;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;

async fn server_with_members() -> TestServer {
    let metadata = Arc::new(MemoryMetadataStore::new());
    metadata.grant("p1", "alice");
    metadata.grant("p2", "mallory");
    TestServer::with_parts(MockRuntime::new(), metadata).await
}

#[tokio::test]
async fn project_routes_require_membership() {
    let server = server_with_members().await;

    for path in [
        "/projects/p1/tree",
        "/projects/p1/locks",
        "/projects/p1/presence",
        "/projects/p1/port",
        "/projects/p1/sandbox",
    ] {
        assert_eq!(server.get_status("mallory", path).await, 403, "{path}");
        assert_eq!(server.get_status("alice", path).await, 200, "{path}");
    }
    assert_eq!(server.get_status("alice", "/projects/nowhere/locks").await, 404);

    let status = reqwest::Client::new()
        .post(server.http("/projects/p1/sandbox"))
        .bearer_auth(server.token("mallory"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 403);
    assert_eq!(server.runtime.create_count(), 0);
}

#[tokio::test]
async fn terminal_refused_to_non_members() {
    let server = server_with_members().await;
    let url = server.ws(&format!(
        "/terminal?projectId=p1&token={}",
        server.token("mallory")
    ));
    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("terminal opened for a non-member"),
    }
    assert_eq!(server.runtime.create_count(), 0);
    assert_eq!(server.runtime.exec_count(), 0);
}

#[tokio::test]
async fn sandbox_listing_shows_only_own_projects() {
    let server = server_with_members().await;
    server.state.sandboxes.ensure_running("p1").await.unwrap();
    server.state.sandboxes.ensure_running("p2").await.unwrap();

    let listed = server.get_json("alice", "/sandboxes").await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["projectId"], "p1");
}

#[tokio::test]
async fn editor_refuses_non_member_joins() {
    let server = server_with_members().await;
    let mut mallory = server.editor("mallory").await;

    mallory.send("joinProjectRoom", json!({"projectId": "p1"})).await;
    let err = mallory.wait_for("error").await;
    assert_eq!(err["op"], "joinProjectRoom");

    mallory
        .send("writeFile", json!({"projectId": "p1", "filePath": "a.txt", "data": "x"}))
        .await;
    let err = mallory.wait_for("error").await;
    assert_eq!(err["op"], "writeFile");
    assert!(server.state.workspace.read("p1", "a.txt").await.is_err());

    let presence = server.get_json("alice", "/projects/p1/presence").await;
    assert_eq!(presence["users"], json!([]));
}
