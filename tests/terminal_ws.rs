mod common;

use collabd::sandbox::MockRuntime;
use common::{Socket, TestServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

async fn next_binary(socket: &mut Socket) -> Vec<u8> {
    timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Binary(bytes))) => return bytes,
                Some(Ok(_)) => continue,
                other => panic!("terminal ended early: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for terminal output")
}

#[tokio::test]
async fn port_appears_once_sandbox_runs() {
    let server = TestServer::start().await;

    let before = server.get_json("alice", "/projects/p1/port").await;
    assert_eq!(before, json!({"port": null}));
    let state = server.get_json("alice", "/projects/p1/sandbox").await;
    assert_eq!(state["state"], "Absent");

    let response = reqwest::Client::new()
        .post(server.http("/projects/p1/sandbox"))
        .bearer_auth(server.token("alice"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let running: Value = response.json().await.unwrap();
    assert_eq!(running["name"], "project-p1");

    let after = server.get_json("alice", "/projects/p1/port").await;
    assert!(after["port"].is_u64());
    assert_eq!(after["port"], running["port"]);

    let listed = server.get_json("alice", "/sandboxes").await;
    assert_eq!(listed[0]["projectId"], "p1");
    assert_eq!(listed[0]["state"], "Running");
}

#[tokio::test]
async fn terminal_relays_bytes_both_ways() {
    let server = TestServer::start().await;
    let mut term = server.terminal("alice", "p1").await;

    term.send(Message::Text("echo hi\n".into())).await.unwrap();
    assert_eq!(next_binary(&mut term).await, b"echo hi\n");

    term.send(Message::Binary(vec![0x03])).await.unwrap();
    assert_eq!(next_binary(&mut term).await, vec![0x03]);

    assert_eq!(server.runtime.exec_input().await, b"echo hi\n\x03");
    assert_eq!(server.runtime.exec_count(), 1);
}

#[tokio::test]
async fn concurrent_terminals_share_one_container() {
    let server = TestServer::with_runtime(MockRuntime::with_create_delay(200)).await;

    let (a, b, c) = tokio::join!(
        server.terminal("alice", "p1"),
        server.terminal("bob", "p1"),
        server.terminal("carol", "p1"),
    );

    assert_eq!(server.runtime.create_count(), 1);
    for mut term in [a, b, c] {
        term.send(Message::Text("pwd\n".into())).await.unwrap();
        assert_eq!(next_binary(&mut term).await, b"pwd\n");
    }
    assert_eq!(server.runtime.exec_count(), 3);
}

#[tokio::test]
async fn terminal_refused_when_sandbox_cannot_start() {
    let server = TestServer::with_runtime(MockRuntime::failing()).await;
    let url = server.ws(&format!(
        "/terminal?projectId=p1&token={}",
        server.token("alice")
    ));

    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 502),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("terminal accepted without a sandbox"),
    }
    assert_eq!(server.runtime.exec_count(), 0);

    // The failed attempt does not wedge later ones.
    let state = server.get_json("alice", "/projects/p1/sandbox").await;
    assert_eq!(state["state"], "Absent");
}

#[tokio::test]
async fn terminal_rejects_bad_project() {
    let server = TestServer::start().await;
    let url = server.ws(&format!(
        "/terminal?projectId=..%2Fetc&token={}",
        server.token("alice")
    ));
    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("terminal accepted for an invalid project"),
    }
    assert_eq!(server.runtime.create_count(), 0);
}
