//! Effective capture policy derived from merged collector responses.

use std::time::Duration;

use super::response::{
    ResponseAttributes, DEFAULT_MAX_BEACON_SIZE_BYTES, DEFAULT_MULTIPLICITY, DEFAULT_SERVER_ID,
    DEFAULT_TRAFFIC_CONTROL_PERCENTAGE, DEFAULT_VISIT_STORE_VERSION,
};

/// Capture policy as currently known by the client.
///
/// Built from the merged [`ResponseAttributes`]; every attribute the
/// collector never sent falls back to its protocol default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfiguration {
    capture: bool,
    capture_crashes: bool,
    capture_errors: bool,
    send_interval: Duration,
    server_id: u32,
    max_beacon_size_bytes: u32,
    max_session_duration: Option<Duration>,
    max_events_per_session: Option<u32>,
    session_timeout: Option<Duration>,
    visit_store_version: u32,
    multiplicity: u32,
    traffic_control_percentage: u8,
}

impl ServerConfiguration {
    pub fn from_attributes(attributes: &ResponseAttributes, default_send_interval: Duration) -> Self {
        Self {
            capture: attributes.capture.unwrap_or(true),
            capture_crashes: attributes.capture_crashes.unwrap_or(true),
            capture_errors: attributes.capture_errors.unwrap_or(true),
            send_interval: attributes.send_interval.unwrap_or(default_send_interval),
            server_id: attributes.server_id.unwrap_or(DEFAULT_SERVER_ID),
            max_beacon_size_bytes: attributes
                .max_beacon_size_bytes
                .unwrap_or(DEFAULT_MAX_BEACON_SIZE_BYTES),
            max_session_duration: attributes.max_session_duration.filter(|d| !d.is_zero()),
            max_events_per_session: attributes.max_events_per_session.filter(|n| *n > 0),
            session_timeout: attributes.session_timeout.filter(|d| !d.is_zero()),
            visit_store_version: attributes
                .visit_store_version
                .unwrap_or(DEFAULT_VISIT_STORE_VERSION),
            multiplicity: attributes.multiplicity.unwrap_or(DEFAULT_MULTIPLICITY),
            traffic_control_percentage: attributes
                .traffic_control_percentage
                .unwrap_or(DEFAULT_TRAFFIC_CONTROL_PERCENTAGE)
                .min(100),
        }
    }

    /// Configuration before the collector has answered anything.
    pub fn defaults(default_send_interval: Duration) -> Self {
        Self::from_attributes(&ResponseAttributes::undefined(), default_send_interval)
    }

    /// Copy of this configuration with capturing switched off.
    pub fn with_capture_disabled(&self) -> Self {
        Self {
            capture: false,
            ..self.clone()
        }
    }

    // ============================================================================================
    // POLICY
    // ============================================================================================

    #[inline]
    pub fn is_capture_enabled(&self) -> bool {
        self.capture
    }

    /// A multiplicity of zero means the collector wants no data at all.
    #[inline]
    pub fn is_sending_data_allowed(&self) -> bool {
        self.capture && self.multiplicity > 0
    }

    #[inline]
    pub fn is_sending_crashes_allowed(&self) -> bool {
        self.is_sending_data_allowed() && self.capture_crashes
    }

    #[inline]
    pub fn is_sending_errors_allowed(&self) -> bool {
        self.is_sending_data_allowed() && self.capture_errors
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn max_beacon_size_bytes(&self) -> u32 {
        self.max_beacon_size_bytes
    }

    pub fn max_session_duration(&self) -> Option<Duration> {
        self.max_session_duration
    }

    pub fn max_events_per_session(&self) -> Option<u32> {
        self.max_events_per_session
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout
    }

    pub fn visit_store_version(&self) -> u32 {
        self.visit_store_version
    }

    pub fn multiplicity(&self) -> u32 {
        self.multiplicity
    }

    pub fn traffic_control_percentage(&self) -> u8 {
        self.traffic_control_percentage
    }
}
