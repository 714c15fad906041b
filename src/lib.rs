pub mod app;
pub mod chat;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod providers;
pub mod relay;
pub mod sse;
pub mod upstream;
