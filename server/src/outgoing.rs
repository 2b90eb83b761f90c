//! Serialized path for everything the server writes to a transport.

use gateway_core::UpdateSink;
use gateway_protocol::SESSION_UPDATE_METHOD;
use gateway_protocol::SessionUpdateParams;
use gateway_protocol::jsonrpc::JsonRpcMessage;
use gateway_protocol::jsonrpc::RequestId;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

/// Handle the request processors use to enqueue messages for the writer
/// task. Notifications emitted during a request go through the same queue as
/// the terminal response, so a response always trails its updates.
#[derive(Clone)]
pub struct OutgoingMessageSender {
    tx: mpsc::Sender<JsonRpcMessage>,
}

impl OutgoingMessageSender {
    pub fn new(tx: mpsc::Sender<JsonRpcMessage>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, message: JsonRpcMessage) {
        if self.tx.send(message).await.is_err() {
            error!("outgoing channel closed, dropping message");
        }
    }

    pub async fn send_response(&self, id: RequestId, result: Value) {
        self.send(JsonRpcMessage::response(id, result)).await;
    }
}

/// `session/update` notifications for one transport connection.
pub struct NotificationSink {
    outgoing: OutgoingMessageSender,
}

impl NotificationSink {
    pub fn new(outgoing: OutgoingMessageSender) -> Self {
        Self { outgoing }
    }
}

#[async_trait::async_trait]
impl UpdateSink for NotificationSink {
    async fn send_update(&self, update: SessionUpdateParams) {
        let params = match serde_json::to_value(&update) {
            Ok(params) => params,
            Err(e) => {
                error!("failed to serialize session update: {e}");
                return;
            }
        };
        self.outgoing
            .send(JsonRpcMessage::notification(
                SESSION_UPDATE_METHOD,
                Some(params),
            ))
            .await;
    }
}
