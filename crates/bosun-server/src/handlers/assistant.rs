//! `/ws`: assistant CLI sessions.
//!
//! One connection can drive several runs in sequence; envelopes from all
//! of them share the connection's outbound channel. Whether a connection
//! drop interrupts the runs it started is a server-wide policy
//! (`--assistant-detach`).

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use bosun_common::{ClientEnvelope, ServerEnvelope};

use crate::connection::{send, WsStream};
use crate::router::ConnectionContext;
use crate::state::AppState;

const OUTBOUND_CAPACITY: usize = 256;

pub async fn handle(ws: WsStream, ctx: ConnectionContext, state: AppState) {
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::channel::<ServerEnvelope>(OUTBOUND_CAPACITY);
    // Keys of runs started on this connection, most recent last.
    let mut started: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            Some(envelope) = rx.recv() => {
                if send(&mut sink, &envelope).await.is_err() {
                    break;
                }
            }

            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEnvelope>(&text) {
                    Ok(ClientEnvelope::ClaudeCommand { command, options }) => {
                        // Failures already reached the client as an error
                        // envelope via tx.
                        match state.assistant.start(&command, options, tx.clone()).await {
                            Ok(key) => {
                                tracing::info!(conn = %ctx.correlation, session = %key, "run started");
                                started.push(key);
                            }
                            Err(e) => {
                                tracing::warn!(conn = %ctx.correlation, error = %e, "run not started");
                            }
                        }
                    }
                    Ok(ClientEnvelope::Interrupt { session_id }) => {
                        let key = session_id.or_else(|| started.last().cloned());
                        match key {
                            Some(key) => {
                                if let Err(e) = state.assistant.interrupt(&key).await {
                                    tracing::warn!(conn = %ctx.correlation, session = %key, error = %e, "interrupt failed");
                                    let _ = send(&mut sink, &ServerEnvelope::Error {
                                        error: e.to_string(),
                                    })
                                    .await;
                                }
                            }
                            None => {
                                tracing::debug!(conn = %ctx.correlation, "interrupt with nothing running");
                            }
                        }
                    }
                    Ok(_) => {
                        tracing::debug!(conn = %ctx.correlation, "ignoring non-assistant envelope");
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

    if !state.assistant_detach {
        for key in started {
            if state.assistant.can_interrupt(&key).await {
                tracing::info!(conn = %ctx.correlation, session = %key, "interrupting on disconnect");
                if let Err(e) = state.assistant.interrupt(&key).await {
                    tracing::warn!(session = %key, error = %e, "disconnect interrupt failed");
                }
            }
        }
    }
    tracing::info!(conn = %ctx.correlation, "assistant connection closed");
}
