pub mod dispatcher;
pub mod host_selector;
