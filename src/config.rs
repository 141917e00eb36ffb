//! SDK configuration.
//!
//! Plain structs with production defaults. Every struct deserializes from
//! JSON with missing fields falling back to [`Default`]; durations are given
//! in milliseconds.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Milliseconds <-> [`Duration`] for serde.
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }

    pub mod vec {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Vec::<u64>::deserialize(deserializer)
                .map(|v| v.into_iter().map(Duration::from_millis).collect())
        }
    }
}

// ================================================================================================
// TOP-LEVEL CONFIGURATION
// ================================================================================================

/// Application and device identity plus the nested subsystem configs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenKitConfig {
    /// Collector endpoint, e.g. `https://collector.example.com/mbeacon`
    pub endpoint_url: String,
    pub application_id: String,
    pub application_name: String,
    pub application_version: String,
    pub device_id: i64,
    pub operating_system: String,
    pub manufacturer: String,
    pub model_id: String,
    pub cache: BeaconCacheConfig,
    pub sending: SendingConfig,
    pub session: SessionConfig,
    pub privacy: PrivacyConfig,
}

impl Default for OpenKitConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            application_id: String::new(),
            application_name: String::new(),
            application_version: String::new(),
            device_id: 1,
            operating_system: std::env::consts::OS.to_string(),
            manufacturer: String::new(),
            model_id: String::new(),
            cache: BeaconCacheConfig::default(),
            sending: SendingConfig::default(),
            session: SessionConfig::default(),
            privacy: PrivacyConfig::default(),
        }
    }
}

impl OpenKitConfig {
    /// Minimal configuration for an endpoint and application.
    pub fn new(endpoint_url: impl Into<String>, application_id: impl Into<String>, device_id: i64) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            application_id: application_id.into(),
            device_id,
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint_url.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint_url must not be empty".into()));
        }
        if self.application_id.trim().is_empty() {
            return Err(ConfigError::Invalid("application_id must not be empty".into()));
        }
        self.cache.validate()?;
        self.sending.validate()
    }
}

// ================================================================================================
// BEACON CACHE
// ================================================================================================

/// Bounds enforced by the cache evictor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BeaconCacheConfig {
    /// Records older than this are dropped. Zero disables age eviction.
    #[serde(rename = "max_record_age_ms", deserialize_with = "millis::deserialize")]
    pub max_record_age: Duration,
    /// Space eviction stops once the cache is at or below this many bytes
    pub lower_memory_boundary_bytes: u64,
    /// Space eviction starts once the cache exceeds this many bytes
    pub upper_memory_boundary_bytes: u64,
}

impl Default for BeaconCacheConfig {
    fn default() -> Self {
        Self {
            max_record_age: Duration::from_secs(105 * 60),
            lower_memory_boundary_bytes: 80 * 1024 * 1024,
            upper_memory_boundary_bytes: 100 * 1024 * 1024,
        }
    }
}

impl BeaconCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lower_memory_boundary_bytes > self.upper_memory_boundary_bytes {
            return Err(ConfigError::Invalid(format!(
                "lower memory boundary ({}) exceeds upper memory boundary ({})",
                self.lower_memory_boundary_bytes, self.upper_memory_boundary_bytes
            )));
        }
        Ok(())
    }
}

// ================================================================================================
// SENDING
// ================================================================================================

/// Timing of the sending state machine and the HTTP client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SendingConfig {
    /// Send interval used until the server sends one
    #[serde(rename = "default_send_interval_ms", deserialize_with = "millis::deserialize")]
    pub default_send_interval: Duration,
    /// Retries of a single status probe after the first attempt
    pub status_request_retries: u32,
    /// Delay before the first probe retry; doubles on each retry
    #[serde(rename = "initial_retry_delay_ms", deserialize_with = "millis::deserialize")]
    pub initial_retry_delay: Duration,
    /// Delays between failed initialization rounds. Exhausting the schedule
    /// gives up initialization.
    #[serde(rename = "reinit_delays_ms", deserialize_with = "millis::vec::deserialize")]
    pub reinit_delays: Vec<Duration>,
    /// Status probe period while capturing is off
    #[serde(rename = "status_check_interval_ms", deserialize_with = "millis::deserialize")]
    pub status_check_interval: Duration,
    /// Upper bound of one capture-on sleep so new and finished sessions are
    /// served without waiting for the full send interval
    #[serde(rename = "capture_on_tick_ms", deserialize_with = "millis::deserialize")]
    pub capture_on_tick: Duration,
    /// Failed new-session requests before a session is configured with capture off
    pub max_new_session_requests: u32,
    #[serde(rename = "http_timeout_ms", deserialize_with = "millis::deserialize")]
    pub http_timeout: Duration,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            default_send_interval: Duration::from_secs(120),
            status_request_retries: 5,
            initial_retry_delay: Duration::from_secs(1),
            reinit_delays: vec![
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(60 * 60),
                Duration::from_secs(2 * 60 * 60),
            ],
            status_check_interval: Duration::from_secs(2 * 60 * 60),
            capture_on_tick: Duration::from_secs(1),
            max_new_session_requests: 4,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl SendingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_on_tick.is_zero() {
            return Err(ConfigError::Invalid("capture_on_tick must be positive".into()));
        }
        if self.default_send_interval.is_zero() {
            return Err(ConfigError::Invalid("default_send_interval must be positive".into()));
        }
        Ok(())
    }
}

// ================================================================================================
// SESSIONS
// ================================================================================================

/// Local session limits, used whenever the server does not send its own.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "max_session_duration_ms", deserialize_with = "millis::option::deserialize")]
    pub max_session_duration: Option<Duration>,
    pub max_events_per_session: Option<u32>,
    #[serde(rename = "session_timeout_ms", deserialize_with = "millis::option::deserialize")]
    pub session_timeout: Option<Duration>,
    /// Period of the session watchdog scan
    #[serde(rename = "watchdog_interval_ms", deserialize_with = "millis::deserialize")]
    pub watchdog_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_duration: None,
            max_events_per_session: None,
            session_timeout: None,
            watchdog_interval: Duration::from_secs(5),
        }
    }
}

// ================================================================================================
// PRIVACY
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum DataCollectionLevel {
    /// Nothing is captured
    Off,
    /// Actions and session start/end only
    Performance,
    /// Everything, including events, values and user tags
    UserBehavior,
}

impl DataCollectionLevel {
    pub fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Performance => 1,
            Self::UserBehavior => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CrashReportingLevel {
    Off,
    OptOutCrashes,
    OptInCrashes,
}

impl CrashReportingLevel {
    pub fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::OptOutCrashes => 1,
            Self::OptInCrashes => 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub data_collection_level: DataCollectionLevel,
    pub crash_reporting_level: CrashReportingLevel,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            data_collection_level: DataCollectionLevel::UserBehavior,
            crash_reporting_level: CrashReportingLevel::OptInCrashes,
        }
    }
}

impl PrivacyConfig {
    pub fn is_action_reporting_allowed(&self) -> bool {
        self.data_collection_level != DataCollectionLevel::Off
    }

    pub fn is_session_reporting_allowed(&self) -> bool {
        self.data_collection_level != DataCollectionLevel::Off
    }

    pub fn is_event_reporting_allowed(&self) -> bool {
        self.data_collection_level == DataCollectionLevel::UserBehavior
    }

    pub fn is_value_reporting_allowed(&self) -> bool {
        self.data_collection_level == DataCollectionLevel::UserBehavior
    }

    pub fn is_error_reporting_allowed(&self) -> bool {
        self.data_collection_level != DataCollectionLevel::Off
    }

    pub fn is_user_identification_allowed(&self) -> bool {
        self.data_collection_level == DataCollectionLevel::UserBehavior
    }

    pub fn is_crash_reporting_allowed(&self) -> bool {
        self.crash_reporting_level == CrashReportingLevel::OptInCrashes
    }

    /// Device ids are only stable when the user opted into behavior tracking.
    pub fn is_device_id_sending_allowed(&self) -> bool {
        self.data_collection_level == DataCollectionLevel::UserBehavior
    }
}
