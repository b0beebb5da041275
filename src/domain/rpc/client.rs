use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::domain::config::RpcConfig;
use crate::domain::rpc::codec::{EnvelopeCodec, MessageSerializer};
use crate::domain::rpc::protocol::{Envelope, MessageKind, Payload};
use crate::domain::utils::id::Host;
use crate::error::RpcError;

type PendingTable = Arc<Mutex<HashMap<u64, PendingRequest>>>;

/// Cached connection of one host. Its lock is held while connecting, so only
/// senders to that host wait for a slow connect.
type ConnectionSlot = Arc<tokio::sync::Mutex<Option<Arc<Connection>>>>;

#[derive(Debug)]
struct PendingRequest {
    host: Host,
    tx: oneshot::Sender<Result<Payload, RpcError>>,
}

/// One persistent connection to a remote host.
#[derive(Debug)]
struct Connection {
    tx: mpsc::UnboundedSender<Envelope>,
    closed: CancellationToken,
}

/// Response of an in-flight request. Dropping it leaves the pending entry
/// in place until the connection closes or `wait` times out.
#[derive(Debug)]
pub struct ResponseFuture {
    opaque: u64,
    host: Host,
    rx: oneshot::Receiver<Result<Payload, RpcError>>,
    pending: PendingTable,
}

impl ResponseFuture {
    pub fn opaque(&self) -> u64 {
        self.opaque
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Waits for the response; on timeout the pending entry is removed.
    pub async fn wait(self, timeout: Duration) -> Result<Payload, RpcError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ConnectionUnavailable(self.host)),
            Err(_) => {
                self.pending.lock().expect("Mutex poisoned").remove(&self.opaque);
                Err(RpcError::Timeout { host: self.host, opaque: self.opaque })
            }
        }
    }
}

/// Multiplexing client: one connection per remote host, requests correlated
/// by opaque id. Failures are reported to the caller, nothing is retried here.
#[derive(Debug, Clone)]
pub struct RpcClient {
    connections: Arc<Mutex<HashMap<Host, ConnectionSlot>>>,
    pending: PendingTable,
    next_opaque: Arc<AtomicU64>,
    serializer: Arc<dyn MessageSerializer>,
    connect_timeout: Duration,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl RpcClient {
    pub fn new(config: &RpcConfig) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_opaque: Arc::new(AtomicU64::new(1)),
            serializer: config.serializer.build(),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().expect("Mutex poisoned").len()
    }

    /// Returns the live connection to `host`, connecting lazily.
    async fn connection(&self, host: &Host) -> Result<Arc<Connection>, RpcError> {
        let cached = self.slot(host);
        let mut slot = cached.lock().await;
        if let Some(conn) = slot.as_ref().filter(|conn| !conn.closed.is_cancelled()) {
            return Ok(conn.clone());
        }

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(host.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::debug!("Connecting to {} failed: {}", host, e);
                return Err(RpcError::ConnectionUnavailable(host.clone()));
            }
            Err(_) => {
                log::debug!("Connecting to {} timed out", host);
                return Err(RpcError::ConnectionUnavailable(host.clone()));
            }
        };
        let _ = stream.set_nodelay(true);

        let conn = Arc::new(self.spawn_connection(host.clone(), stream));
        *slot = Some(conn.clone());
        log::debug!("Connected to {}", host);
        Ok(conn)
    }

    fn slot(&self, host: &Host) -> ConnectionSlot {
        self.connections.lock().expect("Mutex poisoned").entry(host.clone()).or_default().clone()
    }

    fn spawn_connection(&self, host: Host, stream: TcpStream) -> Connection {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let closed = self.shutdown.child_token();

        let mut sink = FramedWrite::new(write_half, EnvelopeCodec::new(self.serializer.clone()));
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(envelope) => {
                            if let Err(e) = sink.send(envelope).await {
                                log::warn!("Write error on connection: {}", e);
                                writer_closed.cancel();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let mut stream = FramedRead::new(read_half, EnvelopeCodec::new(self.serializer.clone()));
        let reader_closed = closed.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = stream.next() => match frame {
                        Some(Ok(envelope)) => Self::resolve(&pending, &host, envelope),
                        Some(Err(e)) => {
                            log::warn!("Codec error on connection to {}: {}", host, e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            reader_closed.cancel();
            Self::fail_pending(&pending, &host);
            log::debug!("Connection to {} closed", host);
        });

        Connection { tx, closed }
    }

    fn resolve(pending: &PendingTable, host: &Host, envelope: Envelope) {
        let (MessageKind::Response, Some(opaque)) = (envelope.kind, envelope.opaque) else {
            log::warn!("Ignoring unsolicited {:?} from {}", envelope.payload.command_type(), host);
            return;
        };

        let entry = pending.lock().expect("Mutex poisoned").remove(&opaque);
        match entry {
            Some(request) => {
                let result = match envelope.payload {
                    Payload::Error { message } => Err(RpcError::Remote { host: host.clone(), message }),
                    payload => Ok(payload),
                };
                let _ = request.tx.send(result);
            }
            None => log::debug!("Late response {} from {} dropped", opaque, host),
        }
    }

    fn fail_pending(pending: &PendingTable, host: &Host) {
        let mut guard = pending.lock().expect("Mutex poisoned");
        let lost: Vec<u64> = guard.iter().filter(|(_, request)| &request.host == host).map(|(opaque, _)| *opaque).collect();
        for opaque in lost {
            if let Some(request) = guard.remove(&opaque) {
                let _ = request.tx.send(Err(RpcError::ConnectionUnavailable(host.clone())));
            }
        }
    }

    /// Sends a request and returns the future of its response.
    pub async fn send_async(&self, host: &Host, payload: Payload) -> Result<ResponseFuture, RpcError> {
        let conn = self.connection(host).await?;
        let opaque = self.next_opaque.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        self.pending.lock().expect("Mutex poisoned").insert(opaque, PendingRequest { host: host.clone(), tx });

        if conn.tx.send(Envelope::request(opaque, payload)).is_err() {
            self.pending.lock().expect("Mutex poisoned").remove(&opaque);
            conn.closed.cancel();
            return Err(RpcError::ConnectionUnavailable(host.clone()));
        }

        Ok(ResponseFuture { opaque, host: host.clone(), rx, pending: self.pending.clone() })
    }

    pub async fn send_sync(&self, host: &Host, payload: Payload, timeout: Duration) -> Result<Payload, RpcError> {
        self.send_async(host, payload).await?.wait(timeout).await
    }

    /// Fire-and-forget. Only reports failures to hand the frame to the connection.
    pub async fn send_oneway(&self, host: &Host, payload: Payload) -> Result<(), RpcError> {
        let conn = self.connection(host).await?;
        conn.tx.send(Envelope::one_way(payload)).map_err(|_| {
            conn.closed.cancel();
            RpcError::ConnectionUnavailable(host.clone())
        })
    }

    pub async fn ping(&self, host: &Host) -> Result<(), RpcError> {
        match self.send_sync(host, Payload::Heartbeat, self.request_timeout).await? {
            Payload::Pong => Ok(()),
            _ => Err(RpcError::UnexpectedResponse { host: host.clone(), expected: "PONG" }),
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rpc::server::RpcServer;

    #[tokio::test]
    async fn slow_connect_does_not_hold_up_other_hosts() {
        let config = RpcConfig::default();
        let mut server = RpcServer::bind("127.0.0.1:0", config.serializer.build()).await.unwrap();
        server.start();
        let live = server.local_host().clone();

        let client = RpcClient::new(&config);
        // Stands for a connect to an unresponsive host that is still in progress.
        let stalled = client.slot(&Host::new("10.255.255.1:9"));
        let _connecting = stalled.lock().await;

        let reply = tokio::time::timeout(Duration::from_secs(1), client.ping(&live)).await;
        assert!(matches!(reply, Ok(Ok(()))));

        client.close();
        server.shutdown().await;
    }
}
