// Library exports for testing and reuse

pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod monitor;
pub mod security;
pub mod server;
pub mod source;

pub use server::{McpServer, ServerStatus};
