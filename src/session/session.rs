//! A single monitored session and its lifecycle.
//!
//! ```text
//! OpenUnconfigured ──configure──▶ OpenConfigured ──end──▶ FinishedConfigured
//!        │                                                        ▲
//!        └── end (remembered) ──────── configure ─────────────────┘
//! ```
//!
//! The sending state machine configures a session once the collector
//! answered its new-session request, flushes it, and unregisters it after
//! the final flush of a finished session.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::action::Action;
use super::beacon::Beacon;
use super::null::NullAction;
use super::{ActionHandle, ReportedValue};
use crate::caching::BeaconCache;
use crate::error::TransportError;
use crate::protocol::{BeaconTransport, ServerConfiguration, StatusResponse};
use crate::sending::BeaconSender;
use crate::types::{now_ms, BeaconKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    OpenUnconfigured,
    OpenConfigured,
    FinishedConfigured,
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    end_requested: bool,
}

pub struct Session {
    beacon: Beacon,
    lifecycle: Mutex<Lifecycle>,
    remaining_new_session_requests: AtomicU32,
    open_actions: AtomicUsize,
    last_activity_ms: AtomicU64,
}

impl Session {
    /// Creates the session and writes its start record.
    pub fn new(beacon: Beacon, max_new_session_requests: u32) -> Self {
        beacon.start_session();
        let start = beacon.session_start_time();
        Self {
            beacon,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::OpenUnconfigured,
                end_requested: false,
            }),
            remaining_new_session_requests: AtomicU32::new(max_new_session_requests),
            open_actions: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(start),
        }
    }

    /// Creates the session and registers it with `sender`.
    pub fn create(beacon: Beacon, sender: &BeaconSender) -> Arc<Self> {
        let max_requests = sender.context().config().max_new_session_requests;
        let session = Arc::new(Self::new(beacon, max_requests));
        sender.add_session(Arc::clone(&session));
        session
    }

    // ============================================================================================
    // LIFECYCLE
    // ============================================================================================

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn is_configured(&self) -> bool {
        self.state() != SessionState::OpenUnconfigured
    }

    /// `true` once `end` was called, configured or not.
    pub fn is_finished(&self) -> bool {
        self.lifecycle.lock().end_requested
    }

    /// Applies the collector's configuration. Only the first call has an
    /// effect; an end requested earlier takes effect now.
    pub fn configure(&self, config: ServerConfiguration) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::OpenUnconfigured {
            return false;
        }
        self.beacon.set_server_configuration(config);
        lifecycle.state = if lifecycle.end_requested {
            SessionState::FinishedConfigured
        } else {
            SessionState::OpenConfigured
        };
        true
    }

    /// Ends the session. Returns `true` for exactly one caller.
    pub fn end(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.end_requested {
            return false;
        }
        lifecycle.end_requested = true;
        self.beacon.end_session();
        if lifecycle.state == SessionState::OpenConfigured {
            lifecycle.state = SessionState::FinishedConfigured;
        }
        true
    }

    pub fn can_send_new_session_request(&self) -> bool {
        self.remaining_new_session_requests.load(Ordering::Acquire) > 0
    }

    pub fn decrease_remaining_new_session_requests(&self) {
        let _ = self
            .remaining_new_session_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    // ============================================================================================
    // REPORTING
    // ============================================================================================

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Release);
    }

    /// Runs `write` against the beacon unless the session has ended.
    ///
    /// The lifecycle lock is held across the check and the write, so a
    /// record can never land after the end-session record.
    pub(crate) fn record_if_open(&self, write: impl FnOnce(&Beacon)) -> bool {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.end_requested {
            return false;
        }
        self.touch();
        write(&self.beacon);
        true
    }

    pub fn enter_action(self: &Arc<Self>, name: &str) -> Arc<dyn ActionHandle> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.end_requested {
            return Arc::new(NullAction);
        }
        self.touch();
        self.open_actions.fetch_add(1, Ordering::AcqRel);
        drop(lifecycle);
        Arc::new(Action::new(Arc::clone(self), name))
    }

    pub(crate) fn on_action_closed(&self) {
        let _ = self
            .open_actions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn report_event(&self, name: &str) {
        self.record_if_open(|beacon| beacon.report_event(0, name));
    }

    pub fn report_value(&self, name: &str, value: &ReportedValue) {
        self.record_if_open(|beacon| beacon.report_value(0, name, value));
    }

    pub fn report_error(&self, name: &str, code: i32, reason: &str) {
        self.record_if_open(|beacon| beacon.report_error(0, name, code, reason));
    }

    pub fn report_crash(&self, name: &str, reason: &str, stacktrace: &str) {
        self.record_if_open(|beacon| beacon.report_crash(name, reason, stacktrace));
    }

    pub fn identify_user(&self, user_tag: &str) {
        self.record_if_open(|beacon| beacon.identify_user(user_tag));
    }

    // ============================================================================================
    // SENDING
    // ============================================================================================

    /// Configured, and the configuration allows this session to send.
    pub fn is_data_sending_allowed(&self) -> bool {
        self.is_configured() && self.beacon.is_data_capturing_enabled()
    }

    pub async fn send_beacon(
        &self,
        transport: &dyn BeaconTransport,
        server_id: u32,
    ) -> Result<Option<StatusResponse>, TransportError> {
        self.beacon.send(transport, server_id).await
    }

    pub fn clear_captured_data(&self) {
        self.beacon.clear_data();
    }

    pub fn is_empty(&self) -> bool {
        self.beacon.is_empty()
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn key(&self) -> BeaconKey {
        self.beacon.key()
    }

    pub fn beacon(&self) -> &Beacon {
        &self.beacon
    }

    pub fn beacon_cache(&self) -> &Arc<BeaconCache> {
        self.beacon.cache()
    }

    pub fn server_configuration(&self) -> Option<ServerConfiguration> {
        self.beacon.server_configuration()
    }

    pub fn creation_time(&self) -> u64 {
        self.beacon.session_start_time()
    }

    pub fn last_activity_time(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    pub fn open_action_count(&self) -> usize {
        self.open_actions.load(Ordering::Acquire)
    }
}
