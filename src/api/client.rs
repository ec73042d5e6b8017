//! The API client: request/response matching over one WebSocket, plus a
//! typed proxy for session targets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::delta::{
    BodyDelta, CaretDelta, CaretSnapshot, Change, PropertyDelta, Snapshot,
};

use super::auth::challenge_response;
use super::codec::{decode, encode, Codable};
use super::message::{Message, Response};
use super::ApiError;

type Resolver = oneshot::Sender<Result<Value, ApiError>>;

enum LinkState {
    /// Transport not open yet; frames queue in order and flush on open.
    Opening { queue: Vec<String> },
    Open { out_tx: mpsc::Sender<WsMessage> },
    Closed,
}

struct ClientInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Resolver>>,
    link: Mutex<LinkState>,
}

impl ClientInner {
    /// Fail every outstanding request and refuse new ones.
    async fn shut(&self, error: ApiError) {
        *self.link.lock().await = LinkState::Closed;
        let pending = std::mem::take(&mut *self.pending.lock().await);
        for (_, resolver) in pending {
            let _ = resolver.send(Err(error.clone()));
        }
    }
}

/// One connection's client half. Cheap to clone; all clones share the
/// transport and the pending-request table.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiClient {
    /// A client whose transport is not open yet. Requests made now are
    /// queued in order and flushed by [`open`](Self::open).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                link: Mutex::new(LinkState::Opening { queue: Vec::new() }),
            }),
        }
    }

    /// Convenience: construct and open in one step.
    pub async fn connect(url: &str) -> Result<Self, ApiError> {
        let client = Self::new();
        client.open(url).await?;
        Ok(client)
    }

    /// Open the WebSocket and start the reader/writer tasks, flushing
    /// any queued requests.
    pub async fn open(&self, url: &str) -> Result<(), ApiError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ApiError::ConnectionError(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sender.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // Flush the pre-open queue in order, then switch states.
        {
            let mut link = self.inner.link.lock().await;
            match &mut *link {
                LinkState::Opening { queue } => {
                    for frame in queue.drain(..) {
                        out_tx
                            .send(WsMessage::Text(frame.into()))
                            .await
                            .map_err(|_| ApiError::ConnectionClosed)?;
                    }
                }
                LinkState::Open { .. } => {
                    return Err(ApiError::BadValue("connection already open".into()))
                }
                LinkState::Closed => return Err(ApiError::ConnectionClosed),
            }
            *link = LinkState::Open { out_tx };
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if let Err(e) = route_response(&inner, &text).await {
                            // Protocol violation: kill the connection.
                            log::error!("api client: {e}");
                            inner.shut(e).await;
                            return;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            inner.shut(ApiError::ConnectionClosed).await;
        });

        Ok(())
    }

    /// Issue one request and await its response.
    pub async fn call(
        &self,
        target_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ApiError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let frame = Message::new(id, target_id, method, args).to_frame();
        // Decide under the lock, send outside it.
        let to_send = {
            let mut link = self.inner.link.lock().await;
            match &mut *link {
                LinkState::Opening { queue } => {
                    queue.push(frame);
                    None
                }
                LinkState::Open { out_tx } => Some((out_tx.clone(), frame)),
                LinkState::Closed => {
                    drop(link);
                    self.inner.pending.lock().await.remove(&id);
                    return Err(ApiError::ConnectionClosed);
                }
            }
        };
        if let Some((out_tx, frame)) = to_send {
            if out_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                self.inner.pending.lock().await.remove(&id);
                return Err(ApiError::ConnectionClosed);
            }
        }

        rx.await.unwrap_or(Err(ApiError::ConnectionClosed))
    }

    /// Close locally: outstanding requests fail with `connectionClosing`,
    /// new ones with `connectionClosed`.
    pub async fn close(&self) {
        self.inner.shut(ApiError::ConnectionClosing).await;
    }

    // ── meta target ──────────────────────────────────────────────────

    pub async fn connection_id(&self) -> Result<String, ApiError> {
        let v = self.call("meta", "connectionId", vec![]).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadData("connectionId wants string".into()))
    }

    pub async fn ping(&self) -> Result<(), ApiError> {
        let v = self.call("meta", "ping", vec![]).await?;
        if v == Value::Bool(true) {
            Ok(())
        } else {
            Err(ApiError::BadData("ping wants true".into()))
        }
    }

    /// Run the challenge-response dance for `target_id`, proving
    /// possession of `secret` without transmitting it.
    pub async fn authorize(&self, target_id: &str, secret: &[u8]) -> Result<(), ApiError> {
        let challenge = self
            .call("meta", "makeChallenge", vec![Value::from(target_id)])
            .await?;
        let challenge = challenge
            .as_str()
            .ok_or_else(|| ApiError::BadData("challenge wants string".into()))?;
        let answer = challenge_response(secret, challenge);
        self.call(
            "meta",
            "authWithChallengeResponse",
            vec![Value::from(challenge), Value::from(answer)],
        )
        .await?;
        Ok(())
    }
}

async fn route_response(inner: &ClientInner, frame: &str) -> Result<(), ApiError> {
    let response = Response::from_frame(frame)?;
    let resolver = inner.pending.lock().await.remove(&response.id);
    let Some(resolver) = resolver else {
        return Err(ApiError::ConnectionNonsense(format!(
            "response for unknown request id {}",
            response.id
        )));
    };
    let outcome = if response.ok {
        Ok(response.result.unwrap_or(Value::Null))
    } else {
        let info = response.error.unwrap_or(super::message::ErrorInfo {
            name: "wtf".into(),
            detail: "failure response with no error info".into(),
        });
        Err(ApiError::from_error_info(&info))
    };
    let _ = resolver.send(outcome);
    Ok(())
}

/// Typed client-side view of one authorized session target.
#[derive(Clone)]
pub struct SessionProxy {
    client: ApiClient,
    target_id: String,
}

impl SessionProxy {
    pub fn new(client: ApiClient, target_id: impl Into<String>) -> Self {
        Self { client, target_id: target_id.into() }
    }

    /// Authorize `target_id` on `client` and wrap it.
    pub async fn authorize(
        client: ApiClient,
        target_id: &str,
        secret: &[u8],
    ) -> Result<Self, ApiError> {
        client.authorize(target_id, secret).await?;
        Ok(Self::new(client, target_id))
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    async fn call_decoded<T: Codable>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, ApiError> {
        let value = self.client.call(&self.target_id, method, args).await?;
        decode::<T>(&value).map_err(|e| ApiError::BadData(e.to_string()))
    }

    pub async fn get_log_info(&self) -> Result<String, ApiError> {
        let v = self.client.call(&self.target_id, "getLogInfo", vec![]).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadData("getLogInfo wants string".into()))
    }

    pub async fn get_session_id(&self) -> Result<String, ApiError> {
        let v = self.client.call(&self.target_id, "getSessionId", vec![]).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadData("getSessionId wants string".into()))
    }

    pub async fn body_snapshot(
        &self,
        rev_num: Option<u64>,
    ) -> Result<Snapshot<BodyDelta>, ApiError> {
        self.call_decoded("body_getSnapshot", optional_rev_args(rev_num)).await
    }

    pub async fn body_change(&self, rev_num: u64) -> Result<Change<BodyDelta>, ApiError> {
        self.call_decoded("body_getChange", vec![Value::from(rev_num)]).await
    }

    pub async fn body_change_after(
        &self,
        base_rev_num: u64,
    ) -> Result<Change<BodyDelta>, ApiError> {
        self.call_decoded("body_getChangeAfter", vec![Value::from(base_rev_num)])
            .await
    }

    pub async fn body_update(
        &self,
        base_rev_num: u64,
        delta: &BodyDelta,
    ) -> Result<Change<BodyDelta>, ApiError> {
        self.call_decoded(
            "body_update",
            vec![Value::from(base_rev_num), encode(delta)],
        )
        .await
    }

    pub async fn caret_snapshot(
        &self,
        rev_num: Option<u64>,
    ) -> Result<CaretSnapshot, ApiError> {
        self.call_decoded("caret_getSnapshot", optional_rev_args(rev_num)).await
    }

    pub async fn caret_change_after(
        &self,
        base_rev_num: u64,
    ) -> Result<Change<CaretDelta>, ApiError> {
        self.call_decoded("caret_getChangeAfter", vec![Value::from(base_rev_num)])
            .await
    }

    pub async fn caret_update(
        &self,
        doc_rev_num: u64,
        index: u64,
        length: u64,
    ) -> Result<Change<CaretDelta>, ApiError> {
        self.call_decoded(
            "caret_update",
            vec![Value::from(doc_rev_num), Value::from(index), Value::from(length)],
        )
        .await
    }

    pub async fn property_snapshot(
        &self,
        rev_num: Option<u64>,
    ) -> Result<Snapshot<PropertyDelta>, ApiError> {
        self.call_decoded("property_getSnapshot", optional_rev_args(rev_num))
            .await
    }

    pub async fn property_change(
        &self,
        rev_num: u64,
    ) -> Result<Change<PropertyDelta>, ApiError> {
        self.call_decoded("property_getChange", vec![Value::from(rev_num)])
            .await
    }

    pub async fn property_change_after(
        &self,
        base_rev_num: u64,
    ) -> Result<Change<PropertyDelta>, ApiError> {
        self.call_decoded("property_getChangeAfter", vec![Value::from(base_rev_num)])
            .await
    }

    pub async fn property_update(
        &self,
        base_rev_num: u64,
        delta: &PropertyDelta,
    ) -> Result<Change<PropertyDelta>, ApiError> {
        self.call_decoded(
            "property_update",
            vec![Value::from(base_rev_num), encode(delta)],
        )
        .await
    }
}

fn optional_rev_args(rev_num: Option<u64>) -> Vec<Value> {
    match rev_num {
        Some(n) => vec![Value::from(n)],
        None => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_queue_before_open() {
        let client = ApiClient::new();
        // No transport: the call parks in the queue and its future stays
        // pending.
        let pending_call = tokio::spawn({
            let client = client.clone();
            async move { client.ping().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending_call.is_finished());

        match &*client.inner.link.lock().await {
            LinkState::Opening { queue } => assert_eq!(queue.len(), 1),
            _ => panic!("Expected opening state"),
        }
        pending_call.abort();
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let client = ApiClient::new();
        client.close().await;
        let err = client.ping().await.unwrap_err();
        assert_eq!(err, ApiError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_with_closing() {
        let client = ApiClient::new();
        let pending_call = tokio::spawn({
            let client = client.clone();
            async move { client.call("meta", "ping", vec![]).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.close().await;
        let outcome = pending_call.await.unwrap();
        assert_eq!(outcome.unwrap_err(), ApiError::ConnectionClosing);
    }

    #[tokio::test]
    async fn test_request_ids_increase() {
        let client = ApiClient::new();
        let a = client.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let b = client.inner.next_id.fetch_add(1, Ordering::SeqCst);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_route_response_unknown_id_is_nonsense() {
        let client = ApiClient::new();
        let frame = Response::success(99, Value::Null).to_frame();
        let err = route_response(&client.inner, &frame).await.unwrap_err();
        assert!(matches!(err, ApiError::ConnectionNonsense(_)));
    }
}
