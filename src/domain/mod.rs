pub mod alert;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod dag;
pub mod dispatch;
pub mod engine;
pub mod master;
pub mod model;
pub mod registry;
pub mod rpc;
pub mod store;
pub mod utils;
pub mod worker;
