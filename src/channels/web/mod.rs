//! HTTP gateway: provider webhooks, token-bound debtor pages, dashboard API.

pub mod auth;
pub mod server;
pub mod types;

pub use server::{GatewayState, start_server};
