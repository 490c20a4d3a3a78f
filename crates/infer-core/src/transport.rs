use std::net::ToSocketAddrs;

use bytes::Bytes;
use http::header::HeaderValue;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::error::{ConfigError, ConnectionError};
use crate::schema::{InferReply, InferRequest};

/// What the completion path hands back to the control loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// A reply addressed to a sequence_id, in whatever order the server
    /// finished it.
    Reply {
        reply: InferReply,
        received_at: Instant,
    },
    /// The stream to the server broke. Fatal for the run.
    Down(String),
}

/// Rejection from a non-blocking send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    /// Every connection queue is full: backpressure on the generation side.
    Full,
    /// No connection can take requests anymore.
    Closed,
}

/// Contract the client depends on: hand a request to the wire without
/// waiting for the reply. Replies come back on the event channel returned
/// at connect time. Implementations may pipeline freely; ordering of
/// replies is not part of the contract.
pub trait Transport: Send {
    fn try_send(&mut self, req: InferRequest) -> Result<(), SendRejected>;
}

/// Parsed endpoint address: where to connect and which model path to post to.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub addr: String,
    host_header: HeaderValue,
    path: String,
}

impl Endpoint {
    pub fn parse(url: &str, model_name: &str, model_version: u32) -> Result<Self, ConfigError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(url.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            _ => {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "{url} (only http:// is supported)"
                )))
            }
        }
        let authority = uri
            .authority()
            .ok_or_else(|| ConfigError::InvalidEndpoint(format!("{url} (missing host:port)")))?;
        let host_header = HeaderValue::from_str(authority.as_str())
            .map_err(|_| ConfigError::InvalidEndpoint(url.to_string()))?;
        let addr = format!(
            "{}:{}",
            authority.host(),
            authority.port_u16().unwrap_or(80)
        );
        // quick resolve sanity
        addr.to_socket_addrs()
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{url} ({e})")))?
            .next()
            .ok_or_else(|| ConfigError::InvalidEndpoint(format!("{url} (no resolved address)")))?;

        Ok(Self {
            addr,
            host_header,
            path: format!("/v2/models/{model_name}/versions/{model_version}/infer"),
        })
    }
}

/// http1 transport: N connections, each with its own bounded request queue
/// and worker, all delivering replies into one shared event channel. With
/// several requests queued across connections the client keeps multiple
/// requests on the wire before the first reply arrives.
pub struct HttpTransport {
    conn_txs: Vec<mpsc::Sender<InferRequest>>,
    next_conn: usize,
}

impl HttpTransport {
    /// Establish every connection up front. This is one of the two places
    /// allowed to block the run (the other is the shutdown drain); a dead
    /// endpoint fails here before any load is generated.
    pub async fn connect(
        ep: &Endpoint,
        connections: usize,
        conn_queue: usize,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), ConnectionError> {
        let event_cap = (connections * (conn_queue + 1)).max(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(event_cap);

        let mut conn_txs = Vec::with_capacity(connections);
        for _ in 0..connections {
            let stream =
                TcpStream::connect(&ep.addr)
                    .await
                    .map_err(|e| ConnectionError::Connect {
                        addr: ep.addr.clone(),
                        source: e,
                    })?;
            stream.set_nodelay(true).ok();

            let io = TokioIo::new(stream);
            let (sender, conn) =
                http1::handshake(io)
                    .await
                    .map_err(|e| ConnectionError::Handshake {
                        addr: ep.addr.clone(),
                        detail: e.to_string(),
                    })?;

            let conn_event_tx = event_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    let _ = conn_event_tx
                        .send(TransportEvent::Down(format!("connection: {e}")))
                        .await;
                }
            });

            let (tx, rx) = mpsc::channel::<InferRequest>(conn_queue);
            conn_txs.push(tx);
            tokio::spawn(conn_worker(ep.clone(), sender, rx, event_tx.clone()));
        }

        Ok((
            Self {
                conn_txs,
                next_conn: 0,
            },
            event_rx,
        ))
    }
}

impl Transport for HttpTransport {
    fn try_send(&mut self, req: InferRequest) -> Result<(), SendRejected> {
        let n = self.conn_txs.len();
        if n == 0 {
            return Err(SendRejected::Closed);
        }
        let start = self.next_conn;
        self.next_conn = (self.next_conn + 1) % n;

        let mut msg = req;
        let mut saw_open = false;
        for i in 0..n {
            match self.conn_txs[(start + i) % n].try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(m)) => {
                    saw_open = true;
                    msg = m;
                }
                Err(TrySendError::Closed(m)) => {
                    msg = m;
                }
            }
        }
        if saw_open {
            Err(SendRejected::Full)
        } else {
            Err(SendRejected::Closed)
        }
    }
}

async fn conn_worker(
    ep: Endpoint,
    mut sender: http1::SendRequest<Full<Bytes>>,
    mut rx: mpsc::Receiver<InferRequest>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    while let Some(req) = rx.recv().await {
        let sequence_id = req.sequence_id;
        let body = match serde_json::to_vec(&req) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                let _ = event_tx
                    .send(TransportEvent::Down(format!(
                        "encode request {sequence_id}: {e}"
                    )))
                    .await;
                return;
            }
        };
        let http_req = match Request::builder()
            .method(Method::POST)
            .uri(&ep.path)
            .header(header::HOST, ep.host_header.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))
        {
            Ok(r) => r,
            Err(e) => {
                let _ = event_tx
                    .send(TransportEvent::Down(format!("build request: {e}")))
                    .await;
                return;
            }
        };

        if let Err(e) = sender.ready().await {
            let _ = event_tx
                .send(TransportEvent::Down(format!("connection not ready: {e}")))
                .await;
            return;
        }
        match send_and_read(&mut sender, http_req).await {
            Ok((status, bytes)) => {
                let received_at = Instant::now();
                let reply = decode_reply(sequence_id, status, &bytes);
                if event_tx
                    .send(TransportEvent::Reply { reply, received_at })
                    .await
                    .is_err()
                {
                    // run is over, nobody is listening
                    return;
                }
            }
            Err(detail) => {
                let _ = event_tx.send(TransportEvent::Down(detail)).await;
                return;
            }
        }
    }
}

async fn send_and_read(
    sender: &mut http1::SendRequest<Full<Bytes>>,
    req: Request<Full<Bytes>>,
) -> Result<(StatusCode, Bytes), String> {
    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| format!("send_request: {e}"))?;
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("collect body: {e}"))?
        .to_bytes();
    Ok((status, body))
}

// A reply we can still address to a known sequence_id stays a per-request
// failure rather than killing the stream.
fn decode_reply(sequence_id: u64, status: StatusCode, body: &[u8]) -> InferReply {
    if !status.is_success() {
        return InferReply {
            sequence_id,
            queue_us: 0,
            compute_us: 0,
            error: Some(format!("http {status}")),
        };
    }
    match serde_json::from_slice::<InferReply>(body) {
        Ok(reply) => reply,
        Err(e) => InferReply {
            sequence_id,
            queue_us: 0,
            compute_us: 0,
            error: Some(format!("malformed reply: {e}")),
        },
    }
}
