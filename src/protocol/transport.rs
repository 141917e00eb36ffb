//! The network boundary consumed by the sending state machine.

use async_trait::async_trait;

use super::response::StatusResponse;
use crate::error::TransportError;

/// One request to the collector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeaconRequest {
    /// Capture policy probe.
    Status { server_id: u32 },
    /// Policy probe that also announces a new session.
    NewSession { server_id: u32 },
    /// One chunk of serialized session data.
    Beacon {
        server_id: u32,
        client_ip: Option<String>,
        payload: String,
    },
}

impl BeaconRequest {
    pub fn server_id(&self) -> u32 {
        match self {
            BeaconRequest::Status { server_id }
            | BeaconRequest::NewSession { server_id }
            | BeaconRequest::Beacon { server_id, .. } => *server_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BeaconRequest::Status { .. } => "status",
            BeaconRequest::NewSession { .. } => "new-session",
            BeaconRequest::Beacon { .. } => "beacon",
        }
    }
}

/// Sends requests to the collector.
///
/// An `Err` means the request never got an answer (connection refused,
/// timeout, unreadable body). A server rejection is an `Ok` carrying a code
/// of 400 or above.
#[async_trait]
pub trait BeaconTransport: Send + Sync {
    async fn send(&self, request: BeaconRequest) -> Result<StatusResponse, TransportError>;
}
