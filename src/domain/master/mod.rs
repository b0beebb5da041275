pub mod failover_handlers;
pub mod master_server;
pub mod processors;
