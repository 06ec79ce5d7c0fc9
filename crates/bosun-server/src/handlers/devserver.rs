//! `/devserver`: dev-server control and log streaming.
//!
//! The whole request is in the connect query: `project` names the
//! target, `script` asks for a start, `stop` asks for a stop, neither
//! means watch-only. Every connection for the same project joins one
//! broadcast group and keeps receiving across server restarts, since
//! dev-servers outlive the connections that started them.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use bosun_common::ServerEnvelope;

use crate::connection::{send, WsStream};
use crate::router::ConnectionContext;
use crate::state::AppState;

pub async fn handle(ws: WsStream, ctx: ConnectionContext, state: AppState) {
    let (mut sink, mut source) = ws.split();

    let Some(project) = ctx.query_param("project").map(str::to_string) else {
        let _ = send(
            &mut sink,
            &ServerEnvelope::Error {
                error: "missing project parameter".to_string(),
            },
        )
        .await;
        return;
    };

    // Join the group before acting so the resulting status is not missed.
    let mut rx = match state.devserver.subscribe(&project).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(conn = %ctx.correlation, project = %project, error = %e, "subscribe failed");
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

    if ctx.query_param("stop").is_some() {
        match state.devserver.stop(&project).await {
            Ok(result) if !result.success => {
                let error = result.error.unwrap_or_else(|| "stop failed".to_string());
                let _ = send(&mut sink, &ServerEnvelope::Error { error }).await;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = send(
                    &mut sink,
                    &ServerEnvelope::Error {
                        error: e.to_string(),
                    },
                )
                .await;
            }
        }
    } else if let Some(script) = ctx.query_param("script") {
        match state.devserver.start(&project, script).await {
            Ok(result) if !result.success => {
                let error = result.error.unwrap_or_else(|| "start failed".to_string());
                let _ = send(&mut sink, &ServerEnvelope::Error { error }).await;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = send(
                    &mut sink,
                    &ServerEnvelope::Error {
                        error: e.to_string(),
                    },
                )
                .await;
            }
        }
    }

    // Watch-only joiners still get a snapshot of where things stand.
    if let Ok(Some(status)) = state.devserver.status(&project).await {
        if send(&mut sink, &ServerEnvelope::Status(status)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            envelope = rx.recv() => match envelope {
                Ok(envelope) => {
                    if send(&mut sink, &envelope).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(conn = %ctx.correlation, project = %project, skipped = n, "log stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            frame = source.next() => match frame {
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

    tracing::info!(conn = %ctx.correlation, project = %project, "devserver connection closed");
}
