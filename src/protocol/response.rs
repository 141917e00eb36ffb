//! Collector responses: status codes and capture directives.
//!
//! The collector answers every request with a status code and a set of
//! attributes. Each attribute is optional; an attribute that is absent from a
//! response never overwrites a value learned from an earlier one
//! (see [`ResponseAttributes::merge`]).

use serde::Deserialize;
use std::time::Duration;

use crate::error::TransportError;

/// Retry delay assumed when a 429 response carries no `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10 * 60);

pub const DEFAULT_MAX_BEACON_SIZE_BYTES: u32 = 30 * 1024;
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_SERVER_ID: u32 = 1;
pub const DEFAULT_MULTIPLICITY: u32 = 1;
pub const DEFAULT_TRAFFIC_CONTROL_PERCENTAGE: u8 = 100;
pub const DEFAULT_VISIT_STORE_VERSION: u32 = 1;

// ================================================================================================
// RESPONSE ATTRIBUTES
// ================================================================================================

/// Capture directives sent by the collector. `None` means "not sent".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseAttributes {
    pub max_beacon_size_bytes: Option<u32>,
    pub max_session_duration: Option<Duration>,
    pub max_events_per_session: Option<u32>,
    pub session_timeout: Option<Duration>,
    pub send_interval: Option<Duration>,
    pub visit_store_version: Option<u32>,
    pub capture: Option<bool>,
    pub capture_crashes: Option<bool>,
    pub capture_errors: Option<bool>,
    pub traffic_control_percentage: Option<u8>,
    pub application_id: Option<String>,
    pub multiplicity: Option<u32>,
    pub server_id: Option<u32>,
    pub status: Option<String>,
    pub timestamp: Option<u64>,
}

impl ResponseAttributes {
    /// Attributes with nothing set.
    pub fn undefined() -> Self {
        Self::default()
    }

    /// Combines `self` with a newer response: every attribute explicitly set
    /// in `newer` wins, everything else keeps its current value.
    pub fn merge(&self, newer: &ResponseAttributes) -> ResponseAttributes {
        ResponseAttributes {
            max_beacon_size_bytes: newer.max_beacon_size_bytes.or(self.max_beacon_size_bytes),
            max_session_duration: newer.max_session_duration.or(self.max_session_duration),
            max_events_per_session: newer.max_events_per_session.or(self.max_events_per_session),
            session_timeout: newer.session_timeout.or(self.session_timeout),
            send_interval: newer.send_interval.or(self.send_interval),
            visit_store_version: newer.visit_store_version.or(self.visit_store_version),
            capture: newer.capture.or(self.capture),
            capture_crashes: newer.capture_crashes.or(self.capture_crashes),
            capture_errors: newer.capture_errors.or(self.capture_errors),
            traffic_control_percentage: newer
                .traffic_control_percentage
                .or(self.traffic_control_percentage),
            application_id: newer.application_id.clone().or_else(|| self.application_id.clone()),
            multiplicity: newer.multiplicity.or(self.multiplicity),
            server_id: newer.server_id.or(self.server_id),
            status: newer.status.clone().or_else(|| self.status.clone()),
            timestamp: newer.timestamp.or(self.timestamp),
        }
    }

    /// True when no attribute is set.
    pub fn is_undefined(&self) -> bool {
        *self == Self::undefined()
    }

    /// Parses a response body, JSON or the legacy `type=m&key=value` form.
    /// An empty body yields undefined attributes.
    pub fn parse(body: &str) -> Result<Self, TransportError> {
        let body = body.trim();
        if body.is_empty() {
            Ok(Self::undefined())
        } else if body.starts_with('{') {
            Self::parse_json(body)
        } else {
            Self::parse_key_value(body)
        }
    }

    pub fn parse_json(body: &str) -> Result<Self, TransportError> {
        let json: JsonBody = serde_json::from_str(body)
            .map_err(|e| TransportError::MalformedResponse(format!("invalid JSON body: {}", e)))?;

        let mut attributes = Self::undefined();
        if let Some(agent) = json.mobile_agent_config {
            attributes.max_beacon_size_bytes = agent.max_beacon_size_kb.map(|kb| kb.saturating_mul(1024));
            attributes.max_session_duration =
                agent.max_session_duration_mins.map(|m| Duration::from_secs(m * 60));
            attributes.max_events_per_session = agent.max_events_per_session;
            attributes.session_timeout = agent.session_timeout_sec.map(Duration::from_secs);
            attributes.send_interval = agent.send_interval_sec.map(Duration::from_secs);
            attributes.visit_store_version = agent.visit_store_version;
        }
        if let Some(app) = json.app_config {
            attributes.capture = app.capture.map(|v| v == 1);
            attributes.capture_crashes = app.report_crashes.map(|v| v != 0);
            attributes.capture_errors = app.report_errors.map(|v| v != 0);
            attributes.traffic_control_percentage = app.traffic_control_percentage;
            attributes.application_id = app.application_id;
        }
        if let Some(dynamic) = json.dynamic_config {
            attributes.multiplicity = dynamic.multiplicity;
            attributes.server_id = dynamic.server_id;
            attributes.status = dynamic.status;
        }
        attributes.timestamp = json.timestamp;
        Ok(attributes)
    }

    pub fn parse_key_value(body: &str) -> Result<Self, TransportError> {
        let mut pairs = body.split('&').filter(|p| !p.is_empty()).map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.trim(), value.trim())
        });

        match pairs.next() {
            Some(("type", "m")) => {}
            _ => {
                return Err(TransportError::MalformedResponse(format!(
                    "key-value body must start with type=m: {}",
                    body
                )))
            }
        }

        let mut attributes = Self::undefined();
        for (key, value) in pairs {
            match key {
                "cp" => attributes.capture = Some(parse_number::<u8>(key, value)? == 1),
                "si" => attributes.send_interval = Some(Duration::from_secs(parse_number(key, value)?)),
                "id" => attributes.server_id = Some(parse_number(key, value)?),
                "bl" => attributes.max_beacon_size_bytes = Some(parse_number::<u32>(key, value)?.saturating_mul(1024)),
                "er" => attributes.capture_errors = Some(parse_number::<u8>(key, value)? != 0),
                "cr" => attributes.capture_crashes = Some(parse_number::<u8>(key, value)? != 0),
                "mp" => attributes.multiplicity = Some(parse_number(key, value)?),
                "tc" => attributes.traffic_control_percentage = Some(parse_number(key, value)?),
                // monitor name and unknown keys carry nothing we act on
                _ => {}
            }
        }
        Ok(attributes)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, TransportError> {
    value
        .parse()
        .map_err(|_| TransportError::MalformedResponse(format!("invalid value for {}: {:?}", key, value)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonBody {
    mobile_agent_config: Option<MobileAgentConfig>,
    app_config: Option<AppConfig>,
    dynamic_config: Option<DynamicConfig>,
    timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MobileAgentConfig {
    max_beacon_size_kb: Option<u32>,
    max_session_duration_mins: Option<u64>,
    max_events_per_session: Option<u32>,
    session_timeout_sec: Option<u64>,
    send_interval_sec: Option<u64>,
    visit_store_version: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppConfig {
    capture: Option<u8>,
    report_crashes: Option<u8>,
    report_errors: Option<u8>,
    traffic_control_percentage: Option<u8>,
    application_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DynamicConfig {
    multiplicity: Option<u32>,
    server_id: Option<u32>,
    status: Option<String>,
}

// ================================================================================================
// STATUS RESPONSE
// ================================================================================================

/// Outcome of one request to the collector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusResponse {
    pub code: u16,
    pub attributes: ResponseAttributes,
    /// Value of the `Retry-After` header, if any
    pub retry_after: Option<Duration>,
}

impl StatusResponse {
    pub fn new(code: u16, attributes: ResponseAttributes) -> Self {
        Self {
            code,
            attributes,
            retry_after: None,
        }
    }

    /// Successful response without attributes.
    pub fn ok() -> Self {
        Self::new(200, ResponseAttributes::undefined())
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Codes of 400 and above mean the collector refused the request.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    #[inline]
    pub fn is_too_many_requests(&self) -> bool {
        self.code == 429
    }

    /// How long to back off after a 429.
    pub fn retry_after(&self) -> Duration {
        self.retry_after.unwrap_or(DEFAULT_RETRY_AFTER)
    }
}
