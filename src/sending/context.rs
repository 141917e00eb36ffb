//! State shared between the sending state machine and the rest of the SDK.
//!
//! The context owns everything the states read and write: the learned
//! server configuration, the session registry, the current/next state, the
//! shutdown signal, the init latch and the termination latch. The current state is only ever
//! replaced from [`SendingContext::execute_current_state`], which only the
//! sender's worker calls.
//!
//! No lock in here is held across an `.await`.

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::state::{SendingState, StateKind};
use crate::config::SendingConfig;
use crate::protocol::{BeaconTransport, ResponseAttributes, ServerConfiguration, StatusResponse};
use crate::session::{Session, SessionState};
use crate::types::{now_ms, CompletionLatch, ShutdownSignal};

struct ContextInner {
    server_config: ServerConfiguration,
    last_attributes: ResponseAttributes,
    sessions: Vec<Arc<Session>>,
    last_open_session_send_ms: u64,
    last_status_check_ms: u64,
}

pub struct SendingContext {
    transport: Arc<dyn BeaconTransport>,
    config: SendingConfig,
    inner: RwLock<ContextInner>,
    current_state: Mutex<SendingState>,
    next_state: Mutex<Option<SendingState>>,
    shutdown: ShutdownSignal,
    init_result: watch::Sender<Option<bool>>,
    terminated: CompletionLatch,
}

impl SendingContext {
    pub fn new(transport: Arc<dyn BeaconTransport>, config: SendingConfig) -> Self {
        let now = now_ms();
        let (init_result, _) = watch::channel(None);
        Self {
            transport,
            inner: RwLock::new(ContextInner {
                server_config: ServerConfiguration::defaults(config.default_send_interval),
                last_attributes: ResponseAttributes::undefined(),
                sessions: Vec::new(),
                last_open_session_send_ms: now,
                last_status_check_ms: now,
            }),
            config,
            current_state: Mutex::new(SendingState::initial()),
            next_state: Mutex::new(None),
            shutdown: ShutdownSignal::new(),
            init_result,
            terminated: CompletionLatch::new(),
        }
    }

    pub fn transport(&self) -> &dyn BeaconTransport {
        self.transport.as_ref()
    }

    pub fn config(&self) -> &SendingConfig {
        &self.config
    }

    // ============================================================================================
    // STATE DRIVER
    // ============================================================================================

    /// Runs one cycle of the current state.
    ///
    /// The next state is cleared, the current one executed, and replaced only
    /// when the execution set a next state of a different kind. A state that
    /// sets nothing, or sets its own kind, keeps control (with whatever it
    /// updated about itself).
    pub async fn execute_current_state(&self) {
        *self.next_state.lock() = None;

        let mut state = self.current_state.lock().clone();
        state.execute(self).await;

        let next = self.next_state.lock().take();
        let mut current = self.current_state.lock();
        match next {
            Some(next) if next.kind() != state.kind() => {
                info!("Sending state {:?} -> {:?}", state.kind(), next.kind());
                *current = next;
            }
            _ => *current = state,
        }
    }

    pub fn set_next_state(&self, state: SendingState) {
        *self.next_state.lock() = Some(state);
    }

    pub fn current_state_kind(&self) -> StateKind {
        self.current_state.lock().kind()
    }

    pub fn is_in_terminal_state(&self) -> bool {
        self.current_state.lock().is_terminal()
    }

    // ============================================================================================
    // SERVER RESPONSES
    // ============================================================================================

    /// Applies a collector answer.
    ///
    /// Any code of 400 or above disables capturing and drops all buffered
    /// session data. Otherwise the attributes are merged, and data is dropped
    /// if the merged policy turned capturing off.
    pub fn handle_status_response(&self, response: &StatusResponse) {
        if response.is_error() {
            warn!("Collector rejected request with code {}, disabling capture", response.code);
            self.disable_capture_and_clear();
            return;
        }

        self.update_from(response);
        if !self.is_capture_on() {
            debug!("Capturing switched off by collector, clearing session data");
            self.clear_all_session_data();
        }
    }

    /// Merges the attributes of a successful response into the known ones
    /// and recomputes the server configuration. Error responses leave
    /// everything as is. Returns the merged attributes.
    pub fn update_from(&self, response: &StatusResponse) -> ResponseAttributes {
        let mut inner = self.inner.write();
        if response.is_error() {
            return inner.last_attributes.clone();
        }
        let merged = inner.last_attributes.merge(&response.attributes);
        inner.server_config = ServerConfiguration::from_attributes(&merged, self.config.default_send_interval);
        inner.last_attributes = merged.clone();
        merged
    }

    pub fn disable_capture(&self) {
        let mut inner = self.inner.write();
        inner.server_config = inner.server_config.with_capture_disabled();
    }

    pub fn disable_capture_and_clear(&self) {
        self.disable_capture();
        self.clear_all_session_data();
    }

    pub fn is_capture_on(&self) -> bool {
        self.inner.read().server_config.is_capture_enabled()
    }

    pub fn send_interval(&self) -> Duration {
        self.inner.read().server_config.send_interval()
    }

    pub fn last_server_configuration(&self) -> ServerConfiguration {
        self.inner.read().server_config.clone()
    }

    pub fn last_response_attributes(&self) -> ResponseAttributes {
        self.inner.read().last_attributes.clone()
    }

    pub fn current_server_id(&self) -> u32 {
        self.inner.read().server_config.server_id()
    }

    /// Collector timestamp of the last merged response, if it sent one.
    pub fn configuration_timestamp(&self) -> Option<u64> {
        self.inner.read().last_attributes.timestamp
    }

    pub fn last_open_session_send_time(&self) -> u64 {
        self.inner.read().last_open_session_send_ms
    }

    pub fn set_last_open_session_send_time(&self, timestamp: u64) {
        self.inner.write().last_open_session_send_ms = timestamp;
    }

    pub fn last_status_check_time(&self) -> u64 {
        self.inner.read().last_status_check_ms
    }

    pub fn set_last_status_check_time(&self, timestamp: u64) {
        self.inner.write().last_status_check_ms = timestamp;
    }

    // ============================================================================================
    // SESSION REGISTRY
    // ============================================================================================

    pub fn add_session(&self, session: Arc<Session>) {
        self.inner.write().sessions.push(session);
    }

    /// Returns `true` if the session was registered.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut inner = self.inner.write();
        let before = inner.sessions.len();
        inner.sessions.retain(|s| !Arc::ptr_eq(s, session));
        inner.sessions.len() != before
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.inner.read().sessions.clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn not_configured_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_in(SessionState::OpenUnconfigured)
    }

    pub fn open_and_configured_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_in(SessionState::OpenConfigured)
    }

    pub fn finished_and_configured_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_in(SessionState::FinishedConfigured)
    }

    fn sessions_in(&self, state: SessionState) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .sessions
            .iter()
            .filter(|s| s.state() == state)
            .cloned()
            .collect()
    }

    /// Drops the buffered data of every session and unregisters the
    /// finished ones.
    pub fn clear_all_session_data(&self) {
        let mut inner = self.inner.write();
        for session in &inner.sessions {
            session.clear_captured_data();
        }
        inner
            .sessions
            .retain(|s| s.state() != SessionState::FinishedConfigured);
    }

    // ============================================================================================
    // SHUTDOWN AND INIT
    // ============================================================================================

    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    /// Returns `true` when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.shutdown.sleep(duration).await
    }

    /// Resolves the init latch. Only the first call has an effect.
    pub fn init_completed(&self, success: bool) {
        let resolved = self.init_result.send_if_modified(|result| {
            if result.is_none() {
                *result = Some(success);
                true
            } else {
                false
            }
        });
        if resolved {
            info!("Beacon sender initialization {}", if success { "succeeded" } else { "failed" });
        }
    }

    /// `true` once init resolved successfully.
    pub fn is_initialized(&self) -> bool {
        *self.init_result.borrow() == Some(true)
    }

    /// Waits until init resolves and returns its outcome.
    pub async fn wait_for_init(&self) -> bool {
        let mut receiver = self.init_result.subscribe();
        let result = match receiver.wait_for(Option::is_some).await {
            Ok(result) => (*result).unwrap_or(false),
            Err(_) => false,
        };
        result
    }

    /// Like [`wait_for_init`](Self::wait_for_init), giving up with `false`
    /// after `timeout`.
    pub async fn wait_for_init_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_init())
            .await
            .unwrap_or(false)
    }

    /// Marks the worker as gone for good: terminal state reached, or the
    /// worker never started and never will.
    pub fn mark_terminated(&self) {
        if !self.terminated.is_complete() {
            debug!("Beacon sender terminated");
        }
        self.terminated.complete();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_complete()
    }

    /// Waits until [`mark_terminated`](Self::mark_terminated) was called.
    pub async fn wait_for_termination(&self) {
        self.terminated.wait().await
    }
}
