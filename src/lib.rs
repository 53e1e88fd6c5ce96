pub mod app;
pub mod config;
pub mod decoder;
pub mod error;
pub mod failover;
pub mod frontend;
pub mod handlers;
pub mod pool;
pub mod request;
pub mod restream;
pub mod upstream;
