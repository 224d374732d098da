pub mod auth;
pub mod bridge;
pub mod broker;
pub mod chat_stream;
pub mod config;
pub mod error;
pub mod keyring;
pub mod retry;
pub mod session;
pub mod transport;
