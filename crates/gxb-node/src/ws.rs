//! Graphene JSON-RPC over WebSocket.
//!
//! Witness nodes expose their database API through the generic `call`
//! method: `call("database", <method>, [args])`. Object-change notifications
//! arrive as `notice` messages shaped `[callback_id, [[object, ...], ...]]`
//! after `set_subscribe_callback` has been issued. Notices are not JSON-RPC
//! subscriptions (they may lack a `jsonrpc` member and carry positional
//! params), so the socket is driven directly: one task writes frames, one
//! reads them and routes each to its pending request or to the notice
//! channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use gxb_core::error::{ConnectionError, GxbError};
use gxb_core::types::{Endpoint, SessionStatus, SignedBlock};

use crate::session::{StatusSink, WitnessConnector, WitnessSession};

/// Callback id registered with `set_subscribe_callback`.
const NOTICE_CALLBACK_ID: u64 = 1;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = Result<Value, String>;

/// Opens [`WsSession`]s.
#[derive(Clone, Debug)]
pub struct WsConnector {
    request_timeout: Duration,
    connection_timeout: Duration,
}

impl WsConnector {
    pub fn new(request_timeout: Duration, connection_timeout: Duration) -> Self {
        Self {
            request_timeout,
            connection_timeout,
        }
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<(Arc<Rpc>, SplitStream<Socket>), GxbError> {
        let failed = |reason: String| -> GxbError {
            ConnectionError::ConnectFailed {
                endpoint: endpoint.url.clone(),
                reason,
            }
            .into()
        };
        let (socket, _) = tokio::time::timeout(self.connection_timeout, connect_async(endpoint.url.as_str()))
            .await
            .map_err(|_| failed("handshake timed out".into()))?
            .map_err(|e| failed(e.to_string()))?;

        let (sink, stream) = socket.split();
        let (outgoing, frames) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(sink, frames));

        let rpc = Arc::new(Rpc {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            notices: Mutex::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            request_timeout: self.request_timeout,
        });
        Ok((rpc, stream))
    }
}

#[async_trait]
impl WitnessConnector for WsConnector {
    /// Time a fresh handshake plus one `get_chain_id` round trip.
    async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, GxbError> {
        let started = Instant::now();
        let (rpc, stream) = self.open(endpoint).await?;
        let _reader = ReaderTask(tokio::spawn(read_frames(
            stream,
            Arc::clone(&rpc),
            endpoint.clone(),
            None,
        )));
        rpc.call("get_chain_id", json!([])).await?;
        Ok(started.elapsed())
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        status: StatusSink,
    ) -> Result<Arc<dyn WitnessSession>, GxbError> {
        let (rpc, stream) = self.open(endpoint).await?;
        let reader = ReaderTask(tokio::spawn(read_frames(
            stream,
            Arc::clone(&rpc),
            endpoint.clone(),
            Some(status.clone()),
        )));

        status.emit(SessionStatus::Open);
        Ok(Arc::new(WsSession {
            endpoint: endpoint.clone(),
            rpc,
            _reader: reader,
        }))
    }
}

/// Aborts the reader when the owning session or probe goes away, so a
/// released session never reports `closed`.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Request/response matching and notice routing for one socket.
struct Rpc {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    notices: Mutex<Option<mpsc::UnboundedSender<Vec<Value>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl Rpc {
    /// `call("database", method, args)` and wait for the matching reply.
    async fn call(&self, method: &str, args: Value) -> Result<Value, GxbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::SessionClosed.into());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "call",
            "params": ["database", method, args],
        });
        if self.outgoing.send(Message::Text(frame.to_string())).is_err() {
            self.pending.lock().remove(&id);
            return Err(ConnectionError::SessionClosed.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(ConnectionError::Rpc(format!("{method}: {message}")).into()),
            Ok(Err(_)) => Err(ConnectionError::SessionClosed.into()),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ConnectionError::Rpc(format!("{method}: timed out")).into())
            }
        }
    }

    /// Route one inbound text frame.
    fn dispatch(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "unparseable frame");
                return;
            }
        };

        if frame.get("method").and_then(Value::as_str) == Some("notice") {
            let params = frame.get("params").unwrap_or(&Value::Null);
            let callback = params.get(0).and_then(Value::as_u64);
            if callback.is_some_and(|id| id != NOTICE_CALLBACK_ID) {
                return;
            }
            let objects = decode_notice(params);
            if objects.is_empty() {
                return;
            }
            let mut notices = self.notices.lock();
            if let Some(tx) = notices.as_ref() {
                if tx.send(objects).is_err() {
                    notices.take();
                }
            }
            return;
        }

        let Some(id) = frame.get("id").and_then(Value::as_u64) else {
            debug!("frame without id or method");
            return;
        };
        let Some(reply) = self.pending.lock().remove(&id) else {
            debug!(id, "reply to unknown request");
            return;
        };
        let outcome = match frame.get("error") {
            Some(error) if !error.is_null() => Err(error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string())),
            _ => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = reply.send(outcome);
    }

    /// Fail every in-flight request and end the notice stream.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        self.notices.lock().take();
    }
}

async fn write_frames(mut sink: SplitSink<Socket, Message>, mut frames: mpsc::UnboundedReceiver<Message>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "websocket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Read until the socket ends, then report `closed` if a session owns it.
async fn read_frames(
    mut stream: SplitStream<Socket>,
    rpc: Arc<Rpc>,
    endpoint: Endpoint,
    status: Option<StatusSink>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => rpc.dispatch(&text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => rpc.dispatch(text),
                Err(_) => debug!(endpoint = %endpoint, "non-utf8 binary frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "websocket read failed");
                break;
            }
        }
    }
    rpc.close();
    if let Some(status) = status {
        warn!(endpoint = %endpoint, "witness connection dropped");
        status.emit(SessionStatus::Closed);
    }
}

/// A live WebSocket session with one witness.
pub struct WsSession {
    endpoint: Endpoint,
    rpc: Arc<Rpc>,
    _reader: ReaderTask,
}

impl WsSession {
    async fn database_call<T>(&self, method: &str, args: Value) -> Result<T, GxbError>
    where
        T: serde::de::DeserializeOwned,
    {
        let raw = self.rpc.call(method, args).await?;
        serde_json::from_value(raw).map_err(|e| GxbError::Decode(format!("{method}: {e}")))
    }
}

#[async_trait]
impl WitnessSession for WsSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn get_objects(&self, ids: &[String]) -> Result<Vec<Option<Value>>, GxbError> {
        let objects: Vec<Value> = self.database_call("get_objects", json!([ids])).await?;
        Ok(objects
            .into_iter()
            .map(|v| if v.is_null() { None } else { Some(v) })
            .collect())
    }

    async fn get_block(&self, height: u64) -> Result<Option<SignedBlock>, GxbError> {
        let raw: Value = self.database_call("get_block", json!([height])).await?;
        if raw.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(raw)?))
    }

    /// Route notices to a fresh channel, then register the callback. A
    /// second call replaces the previous channel.
    async fn subscribe_objects(&self) -> Result<mpsc::UnboundedReceiver<Vec<Value>>, GxbError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.rpc.notices.lock() = Some(tx);

        if let Err(e) = self
            .rpc
            .call("set_subscribe_callback", json!([NOTICE_CALLBACK_ID, false]))
            .await
        {
            self.rpc.notices.lock().take();
            return Err(e);
        }
        Ok(rx)
    }
}

/// Extract the changed objects from `notice` params.
///
/// Params are `[callback_id, payload]` where the payload nests arrays of
/// objects. Bare ids (strings) announce removals and are skipped.
pub fn decode_notice(params: &Value) -> Vec<Value> {
    let payload = match params.as_array() {
        Some(items) if items.len() >= 2 => &items[1],
        _ => return Vec::new(),
    };
    let mut objects = Vec::new();
    collect_objects(payload, &mut objects);
    objects
}

fn collect_objects(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_objects(item, out);
            }
        }
        Value::Object(_) => out.push(value.clone()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn dgp(lib: u64) -> Value {
        json!({
            "id": "2.1.0",
            "head_block_number": lib + 2,
            "last_irreversible_block_num": lib
        })
    }

    /// Answer one Graphene request the way a witness node does.
    fn answer(request: &Value) -> Value {
        let id = request["id"].clone();
        let params = &request["params"];
        let result = match params[1].as_str() {
            Some("get_chain_id") => json!("4f7d07dfbe4ade4c4a8fb9f76e8b2e3e2e7c2ab6bd1dbd2b0b0b2d3d3f6a8c1e"),
            Some("get_objects") => Value::Array(
                params[2][0]
                    .as_array()
                    .map(|ids| {
                        ids.iter()
                            .map(|id| if id == "2.1.0" { dgp(10) } else { Value::Null })
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
            Some("get_block") if params[2][0] == 7 => json!({
                "previous": "00000006",
                "timestamp": "2018-06-01T00:00:21",
                "witness": "1.6.8",
                "transaction_merkle_root": "0000000000000000000000000000000000000007",
                "transactions": [{ "ref_block_num": 7 }],
                "transaction_ids": ["ab00000000000007"]
            }),
            Some("get_block") => Value::Null,
            Some("set_subscribe_callback") => Value::Null,
            _ => {
                return json!({
                    "id": id,
                    "jsonrpc": "2.0",
                    "error": { "code": 1, "message": "method not found" }
                });
            }
        };
        json!({ "id": id, "jsonrpc": "2.0", "result": result })
    }

    /// A local witness. After `set_subscribe_callback` it pushes `notices`
    /// as bare notice frames (no `jsonrpc` member), the way fc-based nodes
    /// do. With `hang_up_after` it closes the socket after that many replies.
    async fn witness(notices: Vec<Value>, hang_up_after: Option<usize>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let notices = notices.clone();
                tokio::spawn(async move {
                    let Ok(mut socket) = accept_async(tcp).await else { return };
                    let mut replies = 0;
                    while let Some(Ok(frame)) = socket.next().await {
                        let Message::Text(text) = frame else { continue };
                        let request: Value = serde_json::from_str(&text).unwrap();
                        let reply = answer(&request);
                        socket.send(Message::Text(reply.to_string())).await.unwrap();
                        replies += 1;

                        if request["params"][1] == "set_subscribe_callback" {
                            for notice in &notices {
                                let frame = json!({ "method": "notice", "params": notice });
                                socket.send(Message::Text(frame.to_string())).await.unwrap();
                            }
                        }
                        if hang_up_after == Some(replies) {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                });
            }
        });
        Endpoint::from(format!("ws://{addr}").as_str())
    }

    fn connector() -> WsConnector {
        WsConnector::new(Duration::from_secs(2), Duration::from_secs(2))
    }

    fn sink() -> (StatusSink, mpsc::UnboundedReceiver<(u64, SessionStatus)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StatusSink::new(7, tx), rx)
    }

    async fn next_batch(rx: &mut mpsc::UnboundedReceiver<Vec<Value>>) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn notice_flattens_nested_batches() {
        let params = json!([1, [[{ "id": "2.1.0", "head_block_number": 5 }, { "id": "1.2.7" }]]]);
        let objects = decode_notice(&params);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["id"], "2.1.0");
        assert_eq!(objects[1]["id"], "1.2.7");
    }

    #[test]
    fn notice_skips_removed_ids() {
        let params = json!([1, [["1.7.100", { "id": "2.1.0" }]]]);
        let objects = decode_notice(&params);
        assert_eq!(objects, vec![json!({ "id": "2.1.0" })]);
    }

    #[test]
    fn malformed_notice_is_empty() {
        assert!(decode_notice(&json!(null)).is_empty());
        assert!(decode_notice(&json!([1])).is_empty());
        assert!(decode_notice(&json!({ "id": "2.1.0" })).is_empty());
    }

    #[tokio::test]
    async fn probe_unreachable_endpoint_fails() {
        let connector = WsConnector::new(Duration::from_millis(200), Duration::from_millis(200));
        let err = connector
            .probe(&Endpoint::from("ws://127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn probe_times_chain_id_round_trip() {
        let endpoint = witness(vec![], None).await;
        let latency = connector().probe(&endpoint).await.unwrap();
        assert!(latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn session_queries_objects_and_blocks() {
        let endpoint = witness(vec![], None).await;
        let (status, mut reports) = sink();
        let session = connector().connect(&endpoint, status).await.unwrap();
        assert_eq!(reports.recv().await, Some((7, SessionStatus::Open)));

        let objects = session
            .get_objects(&["2.1.0".to_string(), "1.2.999".to_string()])
            .await
            .unwrap();
        assert_eq!(objects[0].as_ref().unwrap()["last_irreversible_block_num"], 10);
        assert_eq!(objects[1], None);

        let block = session.get_block(7).await.unwrap().unwrap();
        assert_eq!(block.transaction_ids, vec!["ab00000000000007".to_string()]);
        assert_eq!(session.get_block(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn notices_reach_the_subscriber() {
        let notices = vec![
            json!([1, [[dgp(11)]]]),
            json!([1, [["1.7.3", { "id": "1.2.5", "name": "alice" }]]]),
            // Another callback id is not ours.
            json!([2, [[dgp(99)]]]),
            json!([1, [[dgp(12)]]]),
        ];
        let endpoint = witness(notices, None).await;
        let (status, _reports) = sink();
        let session = connector().connect(&endpoint, status).await.unwrap();

        let mut rx = session.subscribe_objects().await.unwrap();
        assert_eq!(next_batch(&mut rx).await, vec![dgp(11)]);
        assert_eq!(next_batch(&mut rx).await, vec![json!({ "id": "1.2.5", "name": "alice" })]);
        assert_eq!(next_batch(&mut rx).await, vec![dgp(12)]);

        // Requests still work after notices were interleaved.
        assert_eq!(session.get_objects(&["2.1.0".to_string()]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn error_reply_is_an_rpc_error() {
        let endpoint = witness(vec![], None).await;
        let (status, _reports) = sink();
        let connector = connector();
        let (rpc, stream) = connector.open(&endpoint).await.unwrap();
        let _reader = ReaderTask(tokio::spawn(read_frames(stream, Arc::clone(&rpc), endpoint, Some(status))));

        let err = rpc.call("get_nothing", json!([])).await.unwrap_err();
        assert!(matches!(err, GxbError::Connection(ConnectionError::Rpc(m)) if m.contains("method not found")));
    }

    #[tokio::test]
    async fn hang_up_reports_closed_and_ends_notices() {
        let endpoint = witness(vec![json!([1, [[dgp(11)]]])], Some(1)).await;
        let (status, mut reports) = sink();
        let session = connector().connect(&endpoint, status).await.unwrap();
        assert_eq!(reports.recv().await, Some((7, SessionStatus::Open)));

        let mut rx = session.subscribe_objects().await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![dgp(11)]));
        assert_eq!(rx.recv().await, None);

        let closed = tokio::time::timeout(Duration::from_secs(2), reports.recv()).await.unwrap();
        assert_eq!(closed, Some((7, SessionStatus::Closed)));
        assert!(matches!(
            session.get_block(7).await,
            Err(GxbError::Connection(ConnectionError::SessionClosed))
        ));
    }

    #[tokio::test]
    async fn dropped_session_does_not_report_closed() {
        let endpoint = witness(vec![], None).await;
        let (status, mut reports) = sink();
        let session = connector().connect(&endpoint, status).await.unwrap();
        assert_eq!(reports.recv().await, Some((7, SessionStatus::Open)));

        drop(session);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reports.try_recv().is_err());
    }
}
