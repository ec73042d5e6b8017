//! The API server: WebSocket accept loop, per-connection target
//! routing, and the built-in `meta` target.
//!
//! ```text
//! Client A ──┐
//!            ├── connection: targets {meta, session…} ── Session ── DocComplex
//! Client B ──┘        │
//!                     └── calls run as tasks (long polls never block
//!                         pings); all aborted on disconnect
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::delta::{BodyDelta, PropertyDelta};
use crate::doc::DocError;
use crate::session::Session;

use super::auth::{ChallengeTable, TargetAuthority};
use super::codec::{decode, encode, Codec};
use super::message::{Message, Response};
use super::ApiError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Outgoing frame buffer per connection.
    pub outgoing_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:9190".to_string(), outgoing_capacity: 256 }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub auth_failures: u64,
}

/// The API server. Documents and sessions live behind the injected
/// [`TargetAuthority`]; the server only routes.
pub struct ApiServer {
    config: ServerConfig,
    codec: Arc<Codec>,
    authority: Arc<TargetAuthority>,
    stats: Arc<RwLock<ServerStats>>,
}

impl ApiServer {
    pub fn new(
        config: ServerConfig,
        codec: Arc<Codec>,
        authority: Arc<TargetAuthority>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            codec,
            authority,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    pub fn with_defaults(authority: Arc<TargetAuthority>) -> Arc<Self> {
        Self::new(ServerConfig::default(), Arc::new(Codec::standard()), authority)
    }

    pub fn authority(&self) -> &Arc<TargetAuthority> {
        &self.authority
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address. Split from [`serve`](Self::serve) so
    /// callers can learn the bound port first.
    pub async fn listen(&self) -> Result<TcpListener, ApiError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| ApiError::ConnectionError(e.to_string()))?;
        log::info!("api server listening on {}", self.config.bind_addr);
        Ok(listener)
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ApiError> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| ApiError::ConnectionError(e.to_string()))?;
            log::debug!("new tcp connection from {addr}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ApiError> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| ApiError::ConnectionError(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4().simple().to_string();
        log::info!("connection {connection_id} established from {addr}");

        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }

        // Writer task: single owner of the sink end.
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(self.config.outgoing_capacity);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sender.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let mut conn = Connection {
            server: self.clone(),
            connection_id: connection_id.clone(),
            out_tx,
            targets: std::collections::HashMap::new(),
            challenges: ChallengeTable::new(),
            calls: JoinSet::new(),
        };

        let outcome = loop {
            // Reap finished calls so the set stays small.
            while conn.calls.try_join_next().is_some() {}

            match ws_receiver.next().await {
                Some(Ok(WsMessage::Text(frame))) => {
                    {
                        let mut stats = self.stats.write().await;
                        stats.total_messages += 1;
                        stats.total_bytes += frame.len() as u64;
                    }
                    match Message::from_frame(&frame) {
                        Ok(msg) => conn.dispatch(msg).await,
                        Err(e) => {
                            log::warn!("connection {connection_id}: {e}; terminating");
                            break Err(e);
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = conn.out_tx.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                Some(Ok(WsMessage::Binary(_))) => {
                    let e = ApiError::ConnectionNonsense(
                        "binary frame on a text protocol".into(),
                    );
                    log::warn!("connection {connection_id}: {e}");
                    break Err(e);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(ApiError::ConnectionError(e.to_string())),
            }
        };

        // Disconnect cancels in-flight calls (including long polls), then
        // tears down every installed session.
        conn.calls.abort_all();
        while conn.calls.join_next().await.is_some() {}
        for session in conn.targets.values() {
            session.close().await;
        }
        writer.abort();

        let mut stats = self.stats.write().await;
        stats.active_connections -= 1;
        log::info!("connection {connection_id} from {addr} closed");
        outcome
    }
}

/// Per-connection routing state.
struct Connection {
    server: Arc<ApiServer>,
    connection_id: String,
    out_tx: mpsc::Sender<WsMessage>,
    /// Installed targets. `meta` is implicit; everything else arrives by
    /// authorization.
    targets: std::collections::HashMap<String, Arc<Session>>,
    challenges: ChallengeTable,
    calls: JoinSet<()>,
}

impl Connection {
    /// Dispatch one request in arrival order. Session calls run as tasks
    /// so a long poll cannot head-of-line-block the connection; `meta`
    /// calls are quick and handled inline.
    async fn dispatch(&mut self, msg: Message) {
        if msg.target_id == "meta" {
            let response = match self.handle_meta(&msg).await {
                Ok(result) => Response::success(msg.id, result),
                Err(e) => {
                    if matches!(e, ApiError::BadValue(_)) {
                        self.server.stats.write().await.auth_failures += 1;
                    }
                    Response::failure(msg.id, &e)
                }
            };
            self.send(response).await;
            return;
        }

        let Some(session) = self.targets.get(&msg.target_id).cloned() else {
            log::debug!(
                "connection {}: call to unknown target {}",
                self.connection_id,
                msg.target_id
            );
            self.send(Response::failure(
                msg.id,
                &ApiError::UnknownTarget(msg.target_id.clone()),
            ))
            .await;
            return;
        };

        let out_tx = self.out_tx.clone();
        self.calls.spawn(async move {
            let response = match dispatch_session(&session, &msg).await {
                Ok(result) => Response::success(msg.id, result),
                Err(info) => Response { id: msg.id, ok: false, result: None, error: Some(info) },
            };
            let _ = out_tx
                .send(WsMessage::Text(response.to_frame().into()))
                .await;
        });
    }

    async fn handle_meta(&mut self, msg: &Message) -> Result<Value, ApiError> {
        match msg.method.as_str() {
            "connectionId" => Ok(Value::from(self.connection_id.clone())),
            "ping" => Ok(Value::Bool(true)),
            "makeChallenge" => {
                let target_id = want_str(&msg.args, 0)?;
                let challenge = self
                    .challenges
                    .make_challenge(&self.server.authority, target_id)
                    .await?;
                Ok(Value::from(challenge))
            }
            "authWithChallengeResponse" => {
                let challenge = want_str(&msg.args, 0)?;
                let response = want_str(&msg.args, 1)?;
                let (target_id, session) = self
                    .challenges
                    .answer(&self.server.authority, challenge, response)
                    .await?;
                log::info!(
                    "connection {}: target {target_id} authorized",
                    self.connection_id
                );
                self.targets.insert(target_id, session);
                Ok(Value::Bool(true))
            }
            other => Err(ApiError::BadValue(format!("unknown meta method {other:?}"))),
        }
    }

    async fn send(&self, response: Response) {
        let _ = self
            .out_tx
            .send(WsMessage::Text(response.to_frame().into()))
            .await;
    }
}

/// Session-target method table. Only these names are reachable; nothing
/// underscore-prefixed or internal is exposed.
async fn dispatch_session(
    session: &Session,
    msg: &Message,
) -> Result<Value, super::message::ErrorInfo> {
    let args = &msg.args;
    let result: Result<Value, ErrorKind> = async {
        match msg.method.as_str() {
            "getLogInfo" => Ok(Value::from(session.log_info())),
            "getSessionId" => Ok(Value::from(session.session_id().to_string())),

            "body_getSnapshot" => run(session.body_snapshot(opt_rev(args, 0)?)).await,
            "body_getChange" => run(session.body_change(want_u64(args, 0)?)).await,
            "body_getChangeAfter" => run(session.body_change_after(want_u64(args, 0)?)).await,
            "body_update" => {
                let base = want_u64(args, 0)?;
                let delta = want_coded::<BodyDelta>(args, 1)?;
                run(session.body_update(base, delta)).await
            }

            "caret_getSnapshot" => run(session.caret_snapshot(opt_rev(args, 0)?)).await,
            "caret_getChangeAfter" => run(session.caret_change_after(want_u64(args, 0)?)).await,
            "caret_update" => {
                let doc_rev = want_u64(args, 0)?;
                let index = want_u64(args, 1)?;
                let length = opt_u64(args, 2)?.unwrap_or(0);
                run(session.caret_update(doc_rev, index, length)).await
            }

            "property_getSnapshot" => run(session.property_snapshot(opt_rev(args, 0)?)).await,
            "property_getChange" => run(session.property_change(want_u64(args, 0)?)).await,
            "property_getChangeAfter" => {
                run(session.property_change_after(want_u64(args, 0)?)).await
            }
            "property_update" => {
                let base = want_u64(args, 0)?;
                let delta = want_coded::<PropertyDelta>(args, 1)?;
                run(session.property_update(base, delta)).await
            }

            other => Err(ErrorKind::Api(ApiError::BadValue(format!(
                "unknown session method {other:?}"
            )))),
        }
    }
    .await;
    result.map_err(|e| match e {
        ErrorKind::Api(e) => e.to_error_info(),
        ErrorKind::Doc(e) => e.to_error_info(),
    })
}

enum ErrorKind {
    Api(ApiError),
    Doc(DocError),
}

impl From<ApiError> for ErrorKind {
    fn from(e: ApiError) -> Self {
        ErrorKind::Api(e)
    }
}

impl From<DocError> for ErrorKind {
    fn from(e: DocError) -> Self {
        ErrorKind::Doc(e)
    }
}

/// Await a session future and encode its registered result.
async fn run<T, F>(fut: F) -> Result<Value, ErrorKind>
where
    T: super::codec::Codable,
    F: std::future::Future<Output = Result<T, DocError>>,
{
    Ok(encode(&fut.await?))
}

fn want_u64(args: &[Value], i: usize) -> Result<u64, ApiError> {
    args.get(i)
        .and_then(Value::as_u64)
        .ok_or_else(|| ApiError::BadValue(format!("arg {i} wants a revision number")))
}

fn opt_u64(args: &[Value], i: usize) -> Result<Option<u64>, ApiError> {
    match args.get(i) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ApiError::BadValue(format!("arg {i} wants a number or null"))),
    }
}

fn opt_rev(args: &[Value], i: usize) -> Result<Option<u64>, ApiError> {
    opt_u64(args, i)
}

fn want_str<'a>(args: &'a [Value], i: usize) -> Result<&'a str, ApiError> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadValue(format!("arg {i} wants a string")))
}

/// Decode a registered argument, revalidating its shape at the boundary.
fn want_coded<T: super::codec::Codable>(args: &[Value], i: usize) -> Result<T, ApiError> {
    let value = args
        .get(i)
        .ok_or_else(|| ApiError::BadValue(format!("arg {i} missing")))?;
    decode::<T>(value).map_err(|e| ApiError::BadData(e.to_string()))
}
