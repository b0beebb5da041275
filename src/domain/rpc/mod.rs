pub mod client;
pub mod codec;
pub mod processor;
pub mod protocol;
pub mod server;
