//! `/shell`: one PTY-backed shell per connection.
//!
//! The connection's lifetime bounds the shell's. Geometry, working
//! directory, and an optional session id to reclaim all arrive in the
//! connect query; everything after that is envelope traffic.

use std::path::PathBuf;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use bosun_common::{ClientEnvelope, ServerEnvelope};
use bosun_process::{ProcessEvent, PtyGeometry};

use crate::connection::{send, WsStream};
use crate::router::ConnectionContext;
use crate::state::AppState;

pub async fn handle(ws: WsStream, ctx: ConnectionContext, state: AppState) {
    let (mut sink, mut source) = ws.split();

    let geometry = PtyGeometry {
        cols: parse_dim(&ctx, "cols", 80),
        rows: parse_dim(&ctx, "rows", 24),
    };
    let cwd = ctx.query_param("cwd").map(PathBuf::from);
    let requested = ctx.query_param("session").map(str::to_string);

    let session = match state.shell.open(requested, cwd, geometry).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(conn = %ctx.correlation, error = %e, "shell open failed");
            let _ = send(
                &mut sink,
                &ServerEnvelope::Error {
                    error: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    // The client persists this id to reclaim the scrollback-less session
    // on reconnect.
    if send(
        &mut sink,
        &ServerEnvelope::SessionId {
            session_id: session.id().to_string(),
            is_new_session: session.is_new_session(),
        },
    )
    .await
    .is_err()
    {
        session.close().await;
        return;
    }

    let mut rx = session.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(ProcessEvent::Output { data, .. }) => {
                    let envelope = ServerEnvelope::Output {
                        data: serde_json::Value::String(data),
                    };
                    if send(&mut sink, &envelope).await.is_err() {
                        break;
                    }
                }
                Ok(ProcessEvent::Exit { code, signal }) => {
                    let _ = send(&mut sink, &ServerEnvelope::Exit {
                        exit_code: code,
                        signal,
                        interrupted: false,
                    })
                    .await;
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(conn = %ctx.correlation, skipped = n, "shell output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEnvelope>(&text) {
                    Ok(ClientEnvelope::Input { data }) => {
                        if let Err(e) = session.input(&data).await {
                            tracing::warn!(conn = %ctx.correlation, error = %e, "shell input rejected");
                            let _ = send(&mut sink, &ServerEnvelope::Error {
                                error: e.to_string(),
                            })
                            .await;
                            break;
                        }
                    }
                    Ok(ClientEnvelope::Resize { cols, rows }) => {
                        // Resize failure leaves the old geometry; not fatal.
                        if let Err(e) = session.resize(cols, rows) {
                            tracing::warn!(conn = %ctx.correlation, error = %e, "resize failed");
                        }
                    }
                    Ok(_) => {
                        tracing::debug!(conn = %ctx.correlation, "ignoring non-shell envelope");
                    }
                    Err(e) => {
                        tracing::warn!(conn = %ctx.correlation, error = %e, "invalid frame");
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(conn = %ctx.correlation, error = %e, "ws error");
                    break;
                }
                _ => {}
            }
        }
    }

    session.close().await;
    tracing::info!(conn = %ctx.correlation, "shell connection closed");
}

fn parse_dim(ctx: &ConnectionContext, key: &str, default: u16) -> u16 {
    ctx.query_param(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
