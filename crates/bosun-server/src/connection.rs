//! WebSocket plumbing shared by the handlers.

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use bosun_common::ServerEnvelope;

pub type WsStream = WebSocketStream<tokio::net::TcpStream>;
pub type WsSink = SplitSink<WsStream, Message>;

/// Send one envelope as a JSON text frame.
pub async fn send(
    sink: &mut WsSink,
    envelope: &ServerEnvelope,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(envelope).expect("envelope serialization");
    sink.send(Message::Text(json.into())).await
}
