//! Serialization of one session's reports into beacon records.
//!
//! Every report becomes one `key=value&key=value` record in the beacon cache
//! under the session's [`BeaconKey`]. Actions go to the action list, all other
//! reports to the event list. At send time the records are prefixed with the
//! application/device description and chunked to the collector's maximum
//! beacon size.

use log::debug;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::action::Action;
use super::ReportedValue;
use crate::caching::BeaconCache;
use crate::config::OpenKitConfig;
use crate::error::TransportError;
use crate::protocol::{
    BeaconRequest, BeaconTransport, ServerConfiguration, StatusResponse, AGENT_TECHNOLOGY_TYPE, AGENT_VERSION,
    PLATFORM_TYPE, PROTOCOL_VERSION,
};
use crate::types::{now_ms, BeaconKey};

/// Longest name written to a record, in characters.
pub const MAX_NAME_LEN: usize = 250;

/// Room left in every chunk for the transport's own overhead.
const CHUNK_RESERVE_BYTES: u32 = 1024;

const RECORD_DELIMITER: char = '&';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Action = 1,
    NamedEvent = 10,
    ValueString = 11,
    ValueInt = 12,
    ValueDouble = 13,
    SessionStart = 18,
    SessionEnd = 19,
    Error = 40,
    Crash = 50,
    IdentifyUser = 60,
}

/// Per-thread id written as `it`.
fn thread_id() -> u32 {
    static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_ID.with(|id| *id)
}

fn truncate(name: &str) -> &str {
    match name.char_indices().nth(MAX_NAME_LEN) {
        Some((index, _)) => &name[..index],
        None => name,
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Builds one `key=value&...` record.
struct RecordBuilder(String);

impl RecordBuilder {
    fn new() -> Self {
        Self(String::with_capacity(128))
    }

    fn event(event_type: EventType) -> Self {
        Self::new().pair("et", event_type as u8)
    }

    fn pair(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        if !self.0.is_empty() {
            self.0.push(RECORD_DELIMITER);
        }
        self.0.push_str(key);
        self.0.push('=');
        self.0.push_str(&value.to_string());
        self
    }

    fn text(self, key: &str, value: &str) -> Self {
        self.pair(key, encode(value))
    }

    fn name(self, name: &str) -> Self {
        self.text("na", truncate(name))
    }

    fn build(self) -> String {
        self.0
    }
}

// ================================================================================================
// BEACON
// ================================================================================================

pub struct Beacon {
    key: BeaconKey,
    cache: Arc<BeaconCache>,
    config: Arc<OpenKitConfig>,
    device_id: i64,
    client_ip: Option<String>,
    session_start_ms: u64,
    /// Sampled once per beacon; capture needs it below the traffic-control percentage
    traffic_control_value: u8,
    server_config: RwLock<Option<ServerConfiguration>>,
    next_id: AtomicU32,
    next_sequence: AtomicU32,
}

impl Beacon {
    pub fn new(
        key: BeaconKey,
        cache: Arc<BeaconCache>,
        config: Arc<OpenKitConfig>,
        client_ip: Option<String>,
        session_start_ms: u64,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let device_id = if config.privacy.is_device_id_sending_allowed() {
            config.device_id
        } else {
            rng.gen_range(0..i64::MAX)
        };
        Self {
            key,
            cache,
            device_id,
            client_ip,
            session_start_ms,
            traffic_control_value: rng.gen_range(0..100),
            server_config: RwLock::new(None),
            next_id: AtomicU32::new(0),
            next_sequence: AtomicU32::new(0),
            config,
        }
    }

    /// Overrides the configured device id (still subject to privacy settings).
    pub fn with_device_id(mut self, device_id: i64) -> Self {
        if self.config.privacy.is_device_id_sending_allowed() {
            self.device_id = device_id;
        }
        self
    }

    pub fn key(&self) -> BeaconKey {
        self.key
    }

    pub fn cache(&self) -> &Arc<BeaconCache> {
        &self.cache
    }

    pub fn session_start_time(&self) -> u64 {
        self.session_start_ms
    }

    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    pub fn create_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn create_sequence_number(&self) -> u32 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ============================================================================================
    // CAPTURE POLICY
    // ============================================================================================

    /// Applies the configuration the session was configured with. Data
    /// collected so far is dropped if it forbids capturing.
    pub fn set_server_configuration(&self, config: ServerConfiguration) {
        *self.server_config.write() = Some(config);
        if !self.is_capturing() {
            debug!("Capturing disabled for {}, dropping its data", self.key);
            self.clear_data();
        }
    }

    pub fn server_configuration(&self) -> Option<ServerConfiguration> {
        self.server_config.read().clone()
    }

    /// Configured, and the configuration lets this beacon send.
    pub fn is_data_capturing_enabled(&self) -> bool {
        self.server_config.read().is_some() && self.is_capturing()
    }

    /// Records are collected until a configuration says otherwise.
    fn is_capturing(&self) -> bool {
        match &*self.server_config.read() {
            None => true,
            Some(config) => {
                config.is_sending_data_allowed()
                    && self.traffic_control_value < config.traffic_control_percentage()
            }
        }
    }

    fn is_error_capturing(&self) -> bool {
        self.is_capturing()
            && self
                .server_config
                .read()
                .as_ref()
                .map_or(true, ServerConfiguration::is_sending_errors_allowed)
    }

    fn is_crash_capturing(&self) -> bool {
        self.is_capturing()
            && self
                .server_config
                .read()
                .as_ref()
                .map_or(true, ServerConfiguration::is_sending_crashes_allowed)
    }

    // ============================================================================================
    // RECORDS
    // ============================================================================================

    fn offset(&self, timestamp: u64) -> u64 {
        timestamp.saturating_sub(self.session_start_ms)
    }

    /// Common head of every non-action record.
    fn basic_record(&self, event_type: EventType, name: Option<&str>, parent_id: u32, timestamp: u64) -> RecordBuilder {
        let mut builder = RecordBuilder::event(event_type);
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder
            .pair("it", thread_id())
            .pair("pa", parent_id)
            .pair("s0", self.create_sequence_number())
            .pair("t0", self.offset(timestamp))
    }

    fn add_event(&self, timestamp: u64, record: String) {
        self.cache.add_event_data(self.key, timestamp, record);
    }

    pub fn start_session(&self) {
        if !self.config.privacy.is_session_reporting_allowed() || !self.is_capturing() {
            return;
        }
        let now = self.session_start_ms;
        let record = self.basic_record(EventType::SessionStart, None, 0, now).build();
        self.add_event(now, record);
    }

    pub fn end_session(&self) {
        if !self.config.privacy.is_session_reporting_allowed() || !self.is_capturing() {
            return;
        }
        let now = now_ms();
        let record = self.basic_record(EventType::SessionEnd, None, 0, now).build();
        self.add_event(now, record);
    }

    pub fn add_action(&self, action: &Action) {
        if !self.config.privacy.is_action_reporting_allowed() || !self.is_capturing() {
            return;
        }
        let record = RecordBuilder::event(EventType::Action)
            .name(action.name())
            .pair("it", thread_id())
            .pair("ca", action.id())
            .pair("pa", action.parent_id())
            .pair("s0", action.start_sequence())
            .pair("t0", self.offset(action.start_time()))
            .pair("s1", action.end_sequence())
            .pair("t1", action.end_time().saturating_sub(action.start_time()))
            .build();
        self.cache.add_action_data(self.key, action.start_time(), record);
    }

    pub fn report_event(&self, parent_id: u32, name: &str) {
        if !self.config.privacy.is_event_reporting_allowed() || !self.is_capturing() {
            return;
        }
        let now = now_ms();
        let record = self.basic_record(EventType::NamedEvent, Some(name), parent_id, now).build();
        self.add_event(now, record);
    }

    pub fn report_value(&self, parent_id: u32, name: &str, value: &ReportedValue) {
        if !self.config.privacy.is_value_reporting_allowed() || !self.is_capturing() {
            return;
        }
        let now = now_ms();
        let (event_type, rendered) = match value {
            ReportedValue::Int(v) => (EventType::ValueInt, v.to_string()),
            ReportedValue::Double(v) => (EventType::ValueDouble, v.to_string()),
            ReportedValue::Text(v) => (EventType::ValueString, encode(truncate(v))),
        };
        let record = self
            .basic_record(event_type, Some(name), parent_id, now)
            .pair("vl", rendered)
            .build();
        self.add_event(now, record);
    }

    pub fn report_error(&self, parent_id: u32, name: &str, code: i32, reason: &str) {
        if !self.config.privacy.is_error_reporting_allowed() || !self.is_error_capturing() {
            return;
        }
        let now = now_ms();
        let record = self
            .basic_record(EventType::Error, Some(name), parent_id, now)
            .pair("ev", code)
            .text("rs", reason)
            .build();
        self.add_event(now, record);
    }

    pub fn report_crash(&self, name: &str, reason: &str, stacktrace: &str) {
        if !self.config.privacy.is_crash_reporting_allowed() || !self.is_crash_capturing() {
            return;
        }
        let now = now_ms();
        let record = self
            .basic_record(EventType::Crash, Some(name), 0, now)
            .text("rs", reason)
            .text("st", stacktrace)
            .build();
        self.add_event(now, record);
    }

    pub fn identify_user(&self, user_tag: &str) {
        if !self.config.privacy.is_user_identification_allowed() || !self.is_capturing() {
            return;
        }
        let now = now_ms();
        let record = self
            .basic_record(EventType::IdentifyUser, Some(user_tag), 0, now)
            .build();
        self.add_event(now, record);
    }

    // ============================================================================================
    // SENDING
    // ============================================================================================

    /// Description of application, device and session put in front of every chunk.
    pub fn build_prefix(&self, multiplicity: u32, visit_store_version: u32) -> String {
        let session_number = if self.config.privacy.is_device_id_sending_allowed() {
            self.key.session_number
        } else {
            1
        };
        let mut builder = RecordBuilder::new()
            .pair("vv", PROTOCOL_VERSION)
            .text("va", AGENT_VERSION)
            .text("ap", &self.config.application_id)
            .text("an", &self.config.application_name)
            .text("vn", &self.config.application_version)
            .pair("pt", PLATFORM_TYPE)
            .text("tt", AGENT_TECHNOLOGY_TYPE)
            .pair("vi", self.device_id)
            .pair("sn", session_number)
            .pair("ss", self.key.session_sequence);
        if let Some(ip) = &self.client_ip {
            builder = builder.text("ip", ip);
        }
        builder
            .text("os", &self.config.operating_system)
            .text("mf", &self.config.manufacturer)
            .text("md", &self.config.model_id)
            .pair("dl", self.config.privacy.data_collection_level.code())
            .pair("cl", self.config.privacy.crash_reporting_level.code())
            .pair("vs", visit_store_version)
            .pair("tx", now_ms())
            .pair("tv", self.session_start_ms)
            .pair("mp", multiplicity)
            .build()
    }

    /// Sends everything cached for this beacon, chunk by chunk.
    ///
    /// A chunk the collector answered is removed from the cache whatever the
    /// code; a rejection stops sending. A transport failure leaves the chunk
    /// staged for the next attempt and is returned as `Err`. `Ok(None)` means
    /// there was nothing to send.
    pub async fn send(
        &self,
        transport: &dyn BeaconTransport,
        server_id: u32,
    ) -> Result<Option<StatusResponse>, TransportError> {
        let config = self
            .server_configuration()
            .unwrap_or_else(|| ServerConfiguration::defaults(self.config.sending.default_send_interval));
        let max_size = config.max_beacon_size_bytes().saturating_sub(CHUNK_RESERVE_BYTES).max(1) as usize;

        let mut last_response = None;
        loop {
            let prefix = self.build_prefix(config.multiplicity(), config.visit_store_version());
            let chunk = self.cache.get_next_chunk(self.key, &prefix, max_size, RECORD_DELIMITER);
            if chunk.is_empty() {
                return Ok(last_response);
            }

            let request = BeaconRequest::Beacon {
                server_id,
                client_ip: self.client_ip.clone(),
                payload: chunk,
            };
            match transport.send(request).await {
                Ok(response) => {
                    self.cache.remove_chunked_data(self.key);
                    let rejected = response.is_error();
                    last_response = Some(response);
                    if rejected {
                        return Ok(last_response);
                    }
                }
                Err(e) => {
                    self.cache.reset_chunked_data(self.key);
                    return Err(e);
                }
            }
        }
    }

    /// Drops everything cached for this beacon.
    pub fn clear_data(&self) {
        self.cache.delete_cache_entry(self.key);
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty(self.key)
    }
}
