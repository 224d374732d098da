//! Relay bridge protocol: a JSON envelope that multiplexes HTTP
//! request/response pairs and keep-alives over one WebSocket.

pub mod endpoint;
pub mod message;
pub mod pending;

pub use endpoint::{BridgeEndpoint, ExecutedResponse, LocalBackendExecutor, RequestExecutor};
pub use message::BridgeMessage;
pub use pending::PendingRequests;
