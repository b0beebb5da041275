use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::domain::rpc::codec::{EnvelopeCodec, MessageSerializer};
use crate::domain::rpc::processor::{CommandProcessor, RequestContext};
use crate::domain::rpc::protocol::{CommandType, Envelope, MessageKind, Payload};
use crate::domain::utils::id::Host;
use crate::error::RpcError;

type ProcessorTable = Arc<HashMap<CommandType, Arc<dyn CommandProcessor>>>;

/// TCP server dispatching inbound frames to processors by command type.
///
/// Frames of one connection are processed in arrival order.
pub struct RpcServer {
    listener: Option<TcpListener>,
    local_host: Host,
    processors: HashMap<CommandType, Arc<dyn CommandProcessor>>,
    serializer: Arc<dyn MessageSerializer>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Binds the listener. Port 0 picks a free port, see `local_host`.
    pub async fn bind(addr: &str, serializer: Arc<dyn MessageSerializer>) -> Result<Self, RpcError> {
        let listener =
            TcpListener::bind(addr).await.map_err(|e| RpcError::Bind { addr: addr.to_string(), reason: e.to_string() })?;
        let local = listener.local_addr().map_err(|e| RpcError::Bind { addr: addr.to_string(), reason: e.to_string() })?;

        Ok(Self {
            listener: Some(listener),
            local_host: Host::new(local.to_string()),
            processors: HashMap::new(),
            serializer,
            shutdown: CancellationToken::new(),
            accept_task: None,
        })
    }

    pub fn local_host(&self) -> &Host {
        &self.local_host
    }

    pub fn register_processor(&mut self, processor: Arc<dyn CommandProcessor>) {
        let command = processor.command_type();
        if self.processors.insert(command, processor).is_some() {
            log::warn!("Processor for {:?} replaced", command);
        }
    }

    /// Starts accepting connections. Processors registered afterwards are ignored.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            log::warn!("Rpc server {} already started", self.local_host);
            return;
        };
        let processors: ProcessorTable = Arc::new(self.processors.clone());
        let serializer = self.serializer.clone();
        let shutdown = self.shutdown.clone();
        let local_host = self.local_host.clone();

        self.accept_task = Some(tokio::spawn(async move {
            log::info!("Rpc server listening on {}", local_host);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let _ = stream.set_nodelay(true);
                            tokio::spawn(Self::serve_connection(stream, remote, processors.clone(), serializer.clone(), shutdown.child_token()));
                        }
                        Err(e) => log::warn!("Accept failed on {}: {}", local_host, e),
                    }
                }
            }
            log::info!("Rpc server {} stopped", local_host);
        }));
    }

    async fn serve_connection(
        stream: TcpStream,
        remote: SocketAddr,
        processors: ProcessorTable,
        serializer: Arc<dyn MessageSerializer>,
        shutdown: CancellationToken,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let mut sink = FramedWrite::new(write_half, EnvelopeCodec::new(serializer.clone()));
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(envelope) => {
                            if sink.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let mut frames = FramedRead::new(read_half, EnvelopeCodec::new(serializer));
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(envelope)) => envelope,
                    Some(Err(e)) => {
                        log::warn!("Codec error from {}: {}", remote, e);
                        break;
                    }
                    None => break,
                }
            };

            let ctx = RequestContext { remote, opaque: envelope.opaque, kind: envelope.kind };
            if let Some(response) = Self::handle(&processors, &ctx, envelope.payload).await {
                if tx.send(response).is_err() {
                    break;
                }
            }
        }
        shutdown.cancel();
        log::debug!("Connection from {} closed", remote);
    }

    async fn handle(processors: &ProcessorTable, ctx: &RequestContext, payload: Payload) -> Option<Envelope> {
        let command = payload.command_type();

        let reply = match (command, processors.get(&command)) {
            (CommandType::Heartbeat, None) => Some(Payload::Pong),
            (_, Some(processor)) => processor.process(ctx, payload).await,
            (_, None) => {
                log::warn!("No processor for {:?} from {}", command, ctx.remote);
                Some(Payload::error(format!("unsupported command {:?}", command)))
            }
        };

        match (ctx.kind, ctx.opaque) {
            (MessageKind::Request, Some(opaque)) => {
                Some(Envelope::response(opaque, reply.unwrap_or_else(|| Payload::error(format!("no response for {:?}", command)))))
            }
            _ => None,
        }
    }

    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
