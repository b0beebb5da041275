pub mod failover;
pub mod heartbeat;
