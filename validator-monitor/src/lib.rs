pub mod api;
pub mod config;
pub mod liveness;
pub mod poll;
pub mod status;
pub mod store;
