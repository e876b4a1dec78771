//! Terminal bridge: relays bytes between a WebSocket and a shell inside a
//! project's sandbox.
//!
//! No framing is added in either direction. Container output goes to the
//! client as binary frames; the payload of every client text or binary frame
//! goes to the shell's stdin unchanged.

use crate::sandbox::{ExecSession, RunningSandbox, SandboxManager};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a bridge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    ClientClosed,
    ExecEnded,
    ExecFailed,
}

/// Serve one terminal connection against a sandbox already confirmed
/// running. Each connection gets its own shell process.
pub async fn serve(
    mut socket: WebSocket,
    sandboxes: Arc<SandboxManager>,
    sandbox: RunningSandbox,
    user_id: String,
) {
    let exec = match sandboxes.open_shell(&sandbox.container_id).await {
        Ok(exec) => exec,
        Err(e) => {
            warn!(container = %sandbox.name, user_id = %user_id, error = %e, "cannot open shell");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "cannot open shell".into(),
                })))
                .await;
            return;
        }
    };
    info!(container = %sandbox.name, user_id = %user_id, "terminal attached");

    // The shell needs a moment before it reads input reliably. Client
    // frames sent meanwhile stay queued on the socket.
    tokio::time::sleep(sandboxes.config().exec_warmup).await;

    let end = relay(socket, exec).await;
    info!(container = %sandbox.name, user_id = %user_id, ?end, "terminal detached");
}

/// Pump bytes both ways until either side ends. Dropping `exec` on return
/// tears the shell down.
pub async fn relay(socket: WebSocket, mut exec: ExecSession) -> BridgeEnd {
    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            out = exec.output.recv() => match out {
                Some(Ok(bytes)) => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        return BridgeEnd::ClientClosed;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "exec stream failed");
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::ERROR,
                            reason: "exec stream failed".into(),
                        })))
                        .await;
                    return BridgeEnd::ExecFailed;
                }
                None => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "shell exited".into(),
                        })))
                        .await;
                    return BridgeEnd::ExecEnded;
                }
            },
            msg = ws_rx.next() => {
                let bytes = match msg {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return BridgeEnd::ClientClosed,
                    Some(Err(e)) => {
                        debug!(error = %e, "terminal socket read failed");
                        return BridgeEnd::ClientClosed;
                    }
                };
                if exec.input.send(bytes).await.is_err() {
                    // stdin is gone; the output side reports how the shell ended.
                    debug!("exec stdin closed");
                }
            }
        }
    }
}
