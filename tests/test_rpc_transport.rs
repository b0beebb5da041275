use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use dist_workflow_scheduler::domain::config::RpcConfig;
use dist_workflow_scheduler::domain::rpc::client::RpcClient;
use dist_workflow_scheduler::domain::rpc::codec::SerializerType;
use dist_workflow_scheduler::domain::rpc::processor::{CommandProcessor, RequestContext};
use dist_workflow_scheduler::domain::rpc::protocol::{CommandType, MessageKind, Payload};
use dist_workflow_scheduler::domain::rpc::server::RpcServer;
use dist_workflow_scheduler::domain::utils::id::{Host, TaskInstanceId};
use dist_workflow_scheduler::error::RpcError;

/// Acks every kill request with the same id and attempt, after an optional
/// delay taken from the attempt number (milliseconds).
struct EchoKill;

#[async_trait]
impl CommandProcessor for EchoKill {
    fn command_type(&self) -> CommandType {
        CommandType::TaskKill
    }

    async fn process(&self, ctx: &RequestContext, payload: Payload) -> Option<Payload> {
        let Payload::TaskKill { task_instance_id, attempt } = payload else {
            return None;
        };
        if ctx.kind == MessageKind::OneWay {
            return None;
        }
        if attempt >= 1_000 {
            tokio::time::sleep(Duration::from_millis(attempt as u64)).await;
        }
        Some(Payload::TaskExecuteResultAck { task_instance_id, attempt })
    }
}

fn rpc_config(serializer: SerializerType) -> RpcConfig {
    RpcConfig { connect_timeout: Duration::from_millis(500), request_timeout: Duration::from_secs(1), serializer }
}

async fn echo_server(serializer: SerializerType) -> RpcServer {
    let mut server = RpcServer::bind("127.0.0.1:0", serializer.build()).await.unwrap();
    server.register_processor(Arc::new(EchoKill));
    server.start();
    server
}

fn kill(id: &str, attempt: u32) -> Payload {
    Payload::TaskKill { task_instance_id: TaskInstanceId::new(id), attempt }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_correlated_by_opaque() {
    for serializer in [SerializerType::Bincode, SerializerType::Json] {
        let mut server = echo_server(serializer).await;
        let client = RpcClient::new(&rpc_config(serializer));
        let host = server.local_host().clone();

        let mut futures = Vec::new();
        for attempt in 0..50u32 {
            futures.push(client.send_async(&host, kill(&format!("t-{}", attempt), attempt)).await.unwrap());
        }
        let mut opaques: Vec<u64> = futures.iter().map(|f| f.opaque()).collect();
        opaques.dedup();
        assert_eq!(opaques.len(), 50);

        for (attempt, future) in futures.into_iter().enumerate() {
            let reply = future.wait(Duration::from_secs(2)).await.unwrap();
            let expected = TaskInstanceId::new(format!("t-{}", attempt));
            assert!(matches!(reply, Payload::TaskExecuteResultAck { task_instance_id, attempt: a } if task_instance_id == expected && a == attempt as u32));
        }
        assert_eq!(client.pending_requests(), 0);

        client.close();
        server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_request_is_removed_from_pending_table() {
    let mut server = echo_server(SerializerType::Bincode).await;
    let client = RpcClient::new(&rpc_config(SerializerType::Bincode));
    let host = server.local_host().clone();

    let slow = client.send_async(&host, kill("slow", 1_500)).await.unwrap();
    assert_eq!(client.pending_requests(), 1);
    let result = slow.wait(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(RpcError::Timeout { .. })));
    assert_eq!(client.pending_requests(), 0);

    client.close();
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_host_fails_fast() {
    let client = RpcClient::new(&rpc_config(SerializerType::Bincode));

    // Bind and drop to get a port nobody listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let host = Host::new(format!("127.0.0.1:{}", port));

    let result = client.send_sync(&host, kill("t", 1), Duration::from_secs(1)).await;
    assert!(matches!(result, Err(RpcError::ConnectionUnavailable(h)) if h == host));
    assert!(client.send_oneway(&host, kill("t", 1)).await.is_err());
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsupported_command_gets_error_and_heartbeat_gets_pong() {
    let mut server = echo_server(SerializerType::Bincode).await;
    let client = RpcClient::new(&rpc_config(SerializerType::Bincode));
    let host = server.local_host().clone();

    client.ping(&host).await.unwrap();

    let reply = client.send_sync(&host, Payload::WorkerFailover { worker: Host::new("w:1") }, Duration::from_secs(1)).await;
    assert!(matches!(reply, Err(RpcError::Remote { .. })));

    // One-way frames never produce a response, the connection stays usable.
    client.send_oneway(&host, kill("fire", 1)).await.unwrap();
    client.ping(&host).await.unwrap();

    client.close();
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_requests_fail_when_server_goes_away() {
    let mut server = echo_server(SerializerType::Bincode).await;
    let client = RpcClient::new(&rpc_config(SerializerType::Bincode));
    let host = server.local_host().clone();

    client.ping(&host).await.unwrap();
    let slow = client.send_async(&host, kill("slow", 3_000)).await.unwrap();
    server.shutdown().await;

    let result = slow.wait(Duration::from_secs(2)).await;
    assert!(matches!(result, Err(RpcError::ConnectionUnavailable(_))));

    // A later request reconnects lazily and fails fast.
    assert!(matches!(client.ping(&host).await, Err(RpcError::ConnectionUnavailable(_))));
    client.close();
}
