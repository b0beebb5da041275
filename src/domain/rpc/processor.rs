use std::net::SocketAddr;

use async_trait::async_trait;

use crate::domain::rpc::protocol::{CommandType, MessageKind, Payload};

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub remote: SocketAddr,
    pub opaque: Option<u64>,
    pub kind: MessageKind,
}

/// Server-side handler of one command type. For requests the returned
/// payload is sent back as the response, for one-way messages it is dropped.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    fn command_type(&self) -> CommandType;

    async fn process(&self, ctx: &RequestContext, payload: Payload) -> Option<Payload>;
}
