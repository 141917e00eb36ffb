//! The sending state machine.
//!
//! ```text
//!            success / capture on              429 or capture off
//!   Init ───────────────────────────▶ CaptureOn ◀──────────────▶ CaptureOff
//!    │  \_ capture off / rejected __________________________________▲   │
//!    │                                    │ shutdown                    │ shutdown
//!    │ init failed / shutdown             ▼                             │
//!    └──────────────────────────▶ Terminal ◀── FlushSessions ◀──────────┘
//! ```
//!
//! Each variant's `execute` runs one cycle. A state keeps control until a
//! cycle sets a next state of a different kind (see
//! [`SendingContext::execute_current_state`]). After every cycle, a
//! requested shutdown overrides whatever was set with the variant's
//! shutdown state.

use log::{debug, info, warn};
use std::time::Duration;

use super::context::SendingContext;
use crate::protocol::{BeaconRequest, ServerConfiguration, StatusResponse};
use crate::types::{duration_ms, now_ms};

/// Tag of a [`SendingState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKind {
    Init,
    CaptureOn,
    CaptureOff,
    FlushSessions,
    Terminal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendingState {
    /// Probing the collector until it answers or the re-init schedule runs out.
    Init { reinit_attempt: usize },
    /// Capturing allowed: new sessions are announced, data is flushed.
    CaptureOn,
    /// Capturing forbidden: only periodic status probes. `sleep` overrides
    /// the regular status check interval (set from a 429 retry-after).
    CaptureOff { sleep: Option<Duration> },
    /// Final flush of all sessions on shutdown.
    FlushSessions,
    Terminal,
}

impl SendingState {
    pub fn initial() -> Self {
        SendingState::Init { reinit_attempt: 0 }
    }

    pub fn kind(&self) -> StateKind {
        match self {
            SendingState::Init { .. } => StateKind::Init,
            SendingState::CaptureOn => StateKind::CaptureOn,
            SendingState::CaptureOff { .. } => StateKind::CaptureOff,
            SendingState::FlushSessions => StateKind::FlushSessions,
            SendingState::Terminal => StateKind::Terminal,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.kind() == StateKind::Terminal
    }

    /// State to move to when shutdown is requested while in this one.
    pub fn shutdown_state(&self) -> SendingState {
        match self {
            SendingState::CaptureOn | SendingState::CaptureOff { .. } => SendingState::FlushSessions,
            SendingState::Init { .. } | SendingState::FlushSessions | SendingState::Terminal => {
                SendingState::Terminal
            }
        }
    }

    /// Runs one cycle of this state against `ctx`.
    pub async fn execute(&mut self, ctx: &SendingContext) {
        match self {
            SendingState::Init { reinit_attempt } => execute_init(reinit_attempt, ctx).await,
            SendingState::CaptureOn => execute_capture_on(ctx).await,
            SendingState::CaptureOff { sleep } => execute_capture_off(sleep, ctx).await,
            SendingState::FlushSessions => execute_flush_sessions(ctx).await,
            SendingState::Terminal => ctx.request_shutdown(),
        }

        if ctx.is_shutdown_requested() {
            ctx.set_next_state(self.shutdown_state());
        }
    }
}

// ================================================================================================
// STATUS PROBES
// ================================================================================================

/// Sends a status request, retrying transport failures with a doubling
/// delay. Returns `None` when every attempt failed or shutdown was requested.
async fn send_status_request(ctx: &SendingContext) -> Option<StatusResponse> {
    let retries = ctx.config().status_request_retries;
    let mut delay = ctx.config().initial_retry_delay;

    for attempt in 0..=retries {
        if ctx.is_shutdown_requested() {
            return None;
        }
        let request = BeaconRequest::Status {
            server_id: ctx.current_server_id(),
        };
        let result = tokio::select! {
            biased;
            _ = ctx.shutdown_signal().wait() => return None,
            result = ctx.transport().send(request) => result,
        };

        match result {
            Ok(response) => return Some(response),
            Err(e) => warn!("Status request failed (attempt {}/{}): {}", attempt + 1, retries + 1, e),
        }

        if attempt < retries {
            if ctx.sleep(delay).await {
                return None;
            }
            delay = delay.saturating_mul(2);
        }
    }
    None
}

// ================================================================================================
// INIT
// ================================================================================================

async fn execute_init(reinit_attempt: &mut usize, ctx: &SendingContext) {
    let Some(response) = send_status_request(ctx).await else {
        if ctx.is_shutdown_requested() {
            ctx.init_completed(false);
            ctx.set_next_state(SendingState::Terminal);
            return;
        }

        let delays = &ctx.config().reinit_delays;
        match delays.get(*reinit_attempt) {
            Some(delay) => {
                *reinit_attempt += 1;
                info!(
                    "Collector unreachable, re-initializing in {:?} (attempt {}/{})",
                    delay,
                    reinit_attempt,
                    delays.len()
                );
                ctx.sleep(*delay).await;
            }
            None => {
                warn!("Collector unreachable after {} re-init attempts, giving up", delays.len());
                ctx.init_completed(false);
                ctx.set_next_state(SendingState::Terminal);
            }
        }
        return;
    };

    let now = now_ms();
    ctx.set_last_status_check_time(now);
    ctx.set_last_open_session_send_time(now);
    ctx.handle_status_response(&response);
    ctx.init_completed(true);

    if response.is_too_many_requests() {
        ctx.set_next_state(SendingState::CaptureOff {
            sleep: Some(response.retry_after()),
        });
    } else if ctx.is_capture_on() {
        ctx.set_next_state(SendingState::CaptureOn);
    } else {
        ctx.set_next_state(SendingState::CaptureOff { sleep: None });
    }
}

// ================================================================================================
// CAPTURE ON
// ================================================================================================

async fn execute_capture_on(ctx: &SendingContext) {
    let send_interval_ms = duration_ms(ctx.send_interval());
    let elapsed_ms = now_ms().saturating_sub(ctx.last_open_session_send_time());
    let remaining = Duration::from_millis(send_interval_ms.saturating_sub(elapsed_ms));
    let nap = remaining.min(ctx.config().capture_on_tick);
    if !nap.is_zero() && ctx.sleep(nap).await {
        return;
    }

    if let Some(throttled) = send_new_session_requests(ctx).await {
        ctx.handle_status_response(&throttled);
        ctx.set_next_state(SendingState::CaptureOff {
            sleep: Some(throttled.retry_after()),
        });
        return;
    }

    let mut last_response = send_finished_sessions(ctx).await;

    let now = now_ms();
    if now.saturating_sub(ctx.last_open_session_send_time()) >= send_interval_ms {
        if let Some(response) = send_open_sessions(ctx).await {
            last_response = Some(response);
        }
        ctx.set_last_open_session_send_time(now);
    }

    if let Some(response) = last_response {
        ctx.handle_status_response(&response);
        if response.is_too_many_requests() {
            ctx.set_next_state(SendingState::CaptureOff {
                sleep: Some(response.retry_after()),
            });
            return;
        }
    }

    if !ctx.is_capture_on() {
        ctx.set_next_state(SendingState::CaptureOff { sleep: None });
    }
}

/// Announces every unconfigured session and configures it from the answer.
///
/// Returns the response when the collector throttled us.
async fn send_new_session_requests(ctx: &SendingContext) -> Option<StatusResponse> {
    for session in ctx.not_configured_sessions() {
        if !session.can_send_new_session_request() {
            debug!("Session {} out of new-session requests, configuring with capture off", session.key());
            session.configure(ctx.last_server_configuration().with_capture_disabled());
            continue;
        }

        let request = BeaconRequest::NewSession {
            server_id: ctx.current_server_id(),
        };
        match ctx.transport().send(request).await {
            Ok(response) if response.is_too_many_requests() => return Some(response),
            Ok(response) if !response.is_error() => {
                let attributes = ctx.update_from(&response);
                session.configure(ServerConfiguration::from_attributes(
                    &attributes,
                    ctx.config().default_send_interval,
                ));
            }
            Ok(response) => {
                debug!("New-session request rejected with code {}", response.code);
                session.decrease_remaining_new_session_requests();
            }
            Err(e) => {
                warn!("New-session request failed: {}", e);
                session.decrease_remaining_new_session_requests();
            }
        }
    }
    None
}

/// Flushes finished sessions and unregisters them.
///
/// A session whose send failed stays registered with its data staged, and
/// the remaining sessions wait for the next cycle.
async fn send_finished_sessions(ctx: &SendingContext) -> Option<StatusResponse> {
    let mut last_response = None;
    for session in ctx.finished_and_configured_sessions() {
        if session.is_data_sending_allowed() {
            match session.send_beacon(ctx.transport(), ctx.current_server_id()).await {
                Ok(Some(response)) if response.is_error() => {
                    last_response = Some(response);
                    break;
                }
                Ok(response) => {
                    if response.is_some() {
                        last_response = response;
                    }
                }
                Err(e) => {
                    warn!("Sending finished session {} failed: {}", session.key(), e);
                    break;
                }
            }
        }

        session.clear_captured_data();
        ctx.remove_session(&session);
    }
    last_response
}

/// Flushes what open sessions collected so far.
async fn send_open_sessions(ctx: &SendingContext) -> Option<StatusResponse> {
    let mut last_response = None;
    for session in ctx.open_and_configured_sessions() {
        if !session.is_data_sending_allowed() {
            session.clear_captured_data();
            continue;
        }
        match session.send_beacon(ctx.transport(), ctx.current_server_id()).await {
            Ok(Some(response)) => {
                let rejected = response.is_error();
                last_response = Some(response);
                if rejected {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Sending open session {} failed: {}", session.key(), e),
        }
    }
    last_response
}

// ================================================================================================
// CAPTURE OFF
// ================================================================================================

async fn execute_capture_off(sleep: &mut Option<Duration>, ctx: &SendingContext) {
    let delay = match sleep.take() {
        Some(retry_after) => retry_after,
        None => {
            let interval_ms = duration_ms(ctx.config().status_check_interval);
            let since_ms = now_ms().saturating_sub(ctx.last_status_check_time());
            Duration::from_millis(interval_ms.saturating_sub(since_ms))
        }
    };

    debug!("Capture off, next status check in {:?}", delay);
    if ctx.sleep(delay).await {
        return;
    }

    let response = send_status_request(ctx).await;
    ctx.set_last_status_check_time(now_ms());

    let Some(response) = response else {
        return;
    };

    ctx.handle_status_response(&response);
    if response.is_too_many_requests() {
        *sleep = Some(response.retry_after());
    } else if ctx.is_capture_on() {
        ctx.set_last_open_session_send_time(now_ms());
        ctx.set_next_state(SendingState::CaptureOn);
    }
}

// ================================================================================================
// FLUSH SESSIONS
// ================================================================================================

async fn execute_flush_sessions(ctx: &SendingContext) {
    let config = ctx.last_server_configuration();
    for session in ctx.not_configured_sessions() {
        session.configure(config.clone());
    }
    for session in ctx.open_and_configured_sessions() {
        session.end();
    }

    let sessions = ctx.finished_and_configured_sessions();
    info!("Flushing {} sessions", sessions.len());
    for session in sessions {
        if session.is_data_sending_allowed() {
            if let Err(e) = session.send_beacon(ctx.transport(), ctx.current_server_id()).await {
                warn!("Final flush of session {} failed: {}", session.key(), e);
            }
        }
        session.clear_captured_data();
        ctx.remove_session(&session);
    }

    ctx.set_next_state(SendingState::Terminal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendingConfig;
    use crate::protocol::transport::mock::{Scripted, ScriptedTransport};
    use crate::protocol::ResponseAttributes;
    use crate::session::tests_support::{configured_session, unconfigured_session};
    use std::sync::Arc;

    fn fast_config() -> SendingConfig {
        SendingConfig {
            default_send_interval: Duration::from_millis(20),
            status_request_retries: 1,
            initial_retry_delay: Duration::from_millis(1),
            reinit_delays: vec![Duration::from_millis(1), Duration::from_millis(1)],
            status_check_interval: Duration::from_millis(5),
            capture_on_tick: Duration::from_millis(1),
            ..SendingConfig::default()
        }
    }

    fn context_with(transport: &Arc<ScriptedTransport>) -> SendingContext {
        SendingContext::new(Arc::clone(transport) as _, fast_config())
    }

    fn respond(code: u16) -> Scripted {
        Scripted::Respond(StatusResponse::new(code, ResponseAttributes::undefined()))
    }

    fn capture_on() -> Scripted {
        Scripted::Respond(StatusResponse::new(
            200,
            ResponseAttributes {
                capture: Some(true),
                ..ResponseAttributes::undefined()
            },
        ))
    }

    fn capture_off() -> Scripted {
        Scripted::Respond(StatusResponse::new(
            200,
            ResponseAttributes {
                capture: Some(false),
                ..ResponseAttributes::undefined()
            },
        ))
    }

    #[test]
    fn test_kinds_and_shutdown_states() {
        assert_eq!(SendingState::initial().kind(), StateKind::Init);
        assert!(SendingState::Terminal.is_terminal());
        assert!(!SendingState::FlushSessions.is_terminal());

        assert_eq!(SendingState::initial().shutdown_state(), SendingState::Terminal);
        assert_eq!(SendingState::CaptureOn.shutdown_state(), SendingState::FlushSessions);
        assert_eq!(
            SendingState::CaptureOff { sleep: None }.shutdown_state(),
            SendingState::FlushSessions
        );
        assert_eq!(SendingState::FlushSessions.shutdown_state(), SendingState::Terminal);
        assert_eq!(SendingState::Terminal.shutdown_state(), SendingState::Terminal);
    }

    #[tokio::test]
    async fn test_init_success_reaches_capture_on_and_stays() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context_with(&transport);

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOn);
        assert!(ctx.wait_for_init().await);

        for _ in 0..5 {
            ctx.execute_current_state().await;
            assert_eq!(ctx.current_state_kind(), StateKind::CaptureOn);
        }
    }

    #[tokio::test]
    async fn test_init_capture_off_response() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(capture_off());
        let ctx = context_with(&transport);

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOff);
        assert!(ctx.is_initialized());
    }

    #[tokio::test]
    async fn test_init_too_many_requests() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(Scripted::Respond(
            StatusResponse::new(429, ResponseAttributes::undefined()).with_retry_after(Duration::from_secs(3)),
        ));
        let ctx = context_with(&transport);

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOff);
        assert!(!ctx.is_capture_on());
        assert!(ctx.is_initialized());
    }

    #[tokio::test]
    async fn test_init_gives_up_after_reinit_schedule() {
        let transport = Arc::new(ScriptedTransport::new());
        // 2 attempts per probe, 3 probes (initial + 2 re-inits)
        for _ in 0..6 {
            transport.push_status(Scripted::Fail);
        }
        let ctx = context_with(&transport);

        for _ in 0..2 {
            ctx.execute_current_state().await;
            assert_eq!(ctx.current_state_kind(), StateKind::Init);
        }
        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::Terminal);
        assert!(!ctx.wait_for_init().await);
        assert_eq!(transport.count("status"), 6);
    }

    #[tokio::test]
    async fn test_init_retry_recovers() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(Scripted::Fail);
        let ctx = context_with(&transport);

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOn);
        assert_eq!(transport.count("status"), 2);
    }

    #[tokio::test]
    async fn test_shutdown_during_init_terminates() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context_with(&transport);
        ctx.request_shutdown();

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::Terminal);
        assert!(!ctx.wait_for_init().await);
    }

    #[tokio::test]
    async fn test_shutdown_in_capture_on_flushes_then_terminates() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOn);

        // even a pending rejection does not change the shutdown path
        transport.push_beacon(respond(500));
        let (open, _) = configured_session(1);
        ctx.add_session(Arc::clone(&open));
        ctx.request_shutdown();

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::FlushSessions);
        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::Terminal);
        assert_eq!(ctx.session_count(), 0);
    }

    #[tokio::test]
    async fn test_capture_on_configures_new_sessions() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_new_session(Scripted::Respond(StatusResponse::new(
            200,
            ResponseAttributes {
                multiplicity: Some(2),
                ..ResponseAttributes::undefined()
            },
        )));
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;
        let session = unconfigured_session(1);
        ctx.add_session(Arc::clone(&session));

        ctx.execute_current_state().await;
        assert!(session.is_configured());
        assert_eq!(transport.count("new-session"), 1);
        assert_eq!(ctx.last_server_configuration().multiplicity(), 2);
    }

    #[tokio::test]
    async fn test_new_session_retry_limit_configures_capture_off() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..4 {
            transport.push_new_session(Scripted::Fail);
        }
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;
        let session = unconfigured_session(1);
        ctx.add_session(Arc::clone(&session));

        for _ in 0..4 {
            ctx.execute_current_state().await;
            assert!(!session.is_configured());
        }
        ctx.execute_current_state().await;
        assert!(session.is_configured());
        assert!(!session.is_data_sending_allowed());
        assert_eq!(transport.count("new-session"), 4);
    }

    #[tokio::test]
    async fn test_finished_sessions_are_sent_and_removed() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;

        let (session, cache) = configured_session(1);
        session.end();
        ctx.add_session(Arc::clone(&session));

        ctx.execute_current_state().await;
        assert_eq!(ctx.session_count(), 0);
        assert_eq!(transport.count("beacon"), 1);
        assert_eq!(cache.num_bytes_in_cache(), 0);
    }

    #[tokio::test]
    async fn test_finished_session_kept_on_transport_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;

        let (session, cache) = configured_session(1);
        session.end();
        ctx.add_session(Arc::clone(&session));
        transport.push_beacon(Scripted::Fail);

        ctx.execute_current_state().await;
        assert_eq!(ctx.session_count(), 1);
        assert!(cache.num_bytes_in_cache() > 0);
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOn);

        // retried on the next cycle
        ctx.execute_current_state().await;
        assert_eq!(ctx.session_count(), 0);
        assert_eq!(transport.count("beacon"), 2);
    }

    #[tokio::test]
    async fn test_rejected_beacon_moves_to_capture_off() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;

        let (session, cache) = configured_session(1);
        session.end();
        ctx.add_session(Arc::clone(&session));
        transport.push_beacon(respond(400));

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOff);
        assert!(!ctx.is_capture_on());
        assert_eq!(cache.num_bytes_in_cache(), 0);
        assert_eq!(ctx.session_count(), 0);
    }

    #[tokio::test]
    async fn test_open_sessions_flushed_after_send_interval() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;

        let (session, _) = configured_session(1);
        ctx.add_session(Arc::clone(&session));
        ctx.set_last_open_session_send_time(0);

        ctx.execute_current_state().await;
        assert_eq!(transport.count("beacon"), 1);
        assert!(session.is_empty());
        // open sessions stay registered
        assert_eq!(ctx.session_count(), 1);
    }

    #[tokio::test]
    async fn test_capture_off_returns_to_capture_on() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(capture_off());
        transport.push_status(capture_on());
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOff);

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOn);
        assert_eq!(transport.count("beacon"), 0);
    }

    #[tokio::test]
    async fn test_capture_off_stays_on_repeated_throttling() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(capture_off());
        transport.push_status(Scripted::Respond(
            StatusResponse::new(429, ResponseAttributes::undefined()).with_retry_after(Duration::from_millis(2)),
        ));
        transport.push_status(capture_on());
        let ctx = context_with(&transport);
        ctx.execute_current_state().await;

        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOff);
        ctx.execute_current_state().await;
        assert_eq!(ctx.current_state_kind(), StateKind::CaptureOn);
    }

    #[tokio::test]
    async fn test_flush_sessions_ends_and_sends_everything() {
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context_with(&transport);
        let fresh = unconfigured_session(1);
        let (open, _) = configured_session(2);
        ctx.add_session(Arc::clone(&fresh));
        ctx.add_session(Arc::clone(&open));

        let mut state = SendingState::FlushSessions;
        state.execute(&ctx).await;

        assert_eq!(ctx.session_count(), 0);
        assert!(open.is_finished());
        assert!(fresh.is_configured());
        assert_eq!(transport.count("beacon"), 2);
        assert_eq!(ctx.current_state_kind(), StateKind::Init);

        let mut terminal = SendingState::Terminal;
        terminal.execute(&ctx).await;
        assert!(ctx.is_shutdown_requested());
    }
}
