//! localbridge keeps a working route to an Ollama-compatible model backend.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core::transport`] holds the three routes (direct local HTTP, the cloud
//!   relay's WebSocket bridge, a public ingress tunnel) and the adapter that
//!   owns each route's connect loop, retry state and status.
//! - [`core::broker`] runs the adapters in priority order and answers "which
//!   route is usable right now".
//! - [`core::session`] turns a prompt into a cancellable stream of chunk,
//!   completion and error events over the best route.
//! - [`core::bridge`] is the JSON message codec and request/response
//!   correlation used on the relay socket.
//! - [`api`] defines the backend's wire payloads.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod logging;
pub mod utils;
