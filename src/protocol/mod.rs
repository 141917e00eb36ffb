//! Collector protocol: responses, derived capture policy and the transport.

pub mod http;
pub mod response;
pub mod server_config;
pub mod transport;

pub use http::HttpTransport;
pub use response::{ResponseAttributes, StatusResponse};
pub use server_config::ServerConfiguration;
pub use transport::{BeaconRequest, BeaconTransport};

/// Version of the beacon wire format.
pub const PROTOCOL_VERSION: u32 = 3;
/// Agent version reported in every request and beacon prefix.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PLATFORM_TYPE: u32 = 1;
pub const AGENT_TECHNOLOGY_TYPE: &str = "okrust";
