//! # beaconkit - application monitoring SDK
//!
//! Applications report sessions, actions, events, values, errors and crashes
//! through [`SessionHandle`] and [`ActionHandle`]. Reports are serialized
//! into beacon records and buffered in an in-memory [`BeaconCache`]; a
//! background [`BeaconSender`] negotiates capture settings with the
//! collector and delivers the buffered data in size-limited chunks.
//!
//! Layout:
//! - [`caching`]: record cache and evictor
//! - [`protocol`]: collector responses, server configuration and transport
//! - [`sending`]: the sending state machine and its worker
//! - [`session`]: beacons, sessions, session splitting and the watchdog
//! - [`openkit`]: the facility tying everything together

pub mod caching;
pub mod config;
pub mod error;
pub mod openkit;
pub mod protocol;
pub mod sending;
pub mod session;
pub mod types;

pub use caching::{BeaconCache, CacheEvictor, CacheStats};
pub use config::{
    BeaconCacheConfig, CrashReportingLevel, DataCollectionLevel, OpenKitConfig, PrivacyConfig, SendingConfig,
    SessionConfig,
};
pub use error::{ConfigError, TransportError};
pub use openkit::OpenKit;
pub use protocol::{BeaconRequest, BeaconTransport, HttpTransport, ResponseAttributes, ServerConfiguration, StatusResponse};
pub use sending::{BeaconSender, StateKind};
pub use session::{ActionHandle, ReportedValue, SessionHandle};
pub use types::BeaconKey;
