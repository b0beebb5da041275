pub mod alert_channel;
pub mod alert_client;
pub mod alert_server;
