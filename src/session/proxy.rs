//! A splittable session as seen by the application.
//!
//! The proxy forwards every report to its current [`Session`]. When the
//! current session reaches the event limit or the maximum duration, it is
//! finished and a new one with the next sequence number takes over. An idle
//! session is closed by the watchdog; the next report starts a new one.
//!
//! Split-off sessions stay registered with the sender until their final
//! flush, so nothing reported before a split is lost.

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::beacon::Beacon;
use super::null::NullAction;
use super::session::Session;
use super::watchdog::SessionWatchdog;
use super::{ActionHandle, ReportedValue, SessionHandle};
use crate::caching::BeaconCache;
use crate::config::OpenKitConfig;
use crate::sending::BeaconSender;
use crate::types::{duration_ms, now_ms, BeaconKey};

/// What a proxy needs from the facility that created it.
#[derive(Clone)]
pub struct ProxyContext {
    pub cache: Arc<BeaconCache>,
    pub config: Arc<OpenKitConfig>,
    pub sender: Arc<BeaconSender>,
    pub watchdog: Arc<SessionWatchdog>,
    /// Receives the proxy id once the proxy is ended
    pub closed: mpsc::UnboundedSender<u64>,
}

struct ProxyInner {
    current: Option<Arc<Session>>,
    next_sequence: u32,
    top_level_events: u32,
    session_start_ms: u64,
    last_interaction_ms: u64,
    user_tag: Option<String>,
    finished: bool,
}

pub struct SessionProxy {
    id: u64,
    session_number: u32,
    client_ip: Option<String>,
    device_id: Option<i64>,
    ctx: ProxyContext,
    inner: Mutex<ProxyInner>,
}

impl SessionProxy {
    /// Creates the proxy with its first session and hands it to the watchdog.
    pub fn new(
        id: u64,
        session_number: u32,
        client_ip: Option<String>,
        device_id: Option<i64>,
        start_ms: u64,
        ctx: ProxyContext,
    ) -> Arc<Self> {
        let proxy = Arc::new(Self {
            id,
            session_number,
            client_ip,
            device_id,
            ctx,
            inner: Mutex::new(ProxyInner {
                current: None,
                next_sequence: 0,
                top_level_events: 0,
                session_start_ms: start_ms,
                last_interaction_ms: start_ms,
                user_tag: None,
                finished: false,
            }),
        });
        {
            let mut inner = proxy.inner.lock();
            let session = proxy.start_session(&mut inner, start_ms);
            inner.current = Some(session);
        }
        proxy.ctx.watchdog.add_to_split_by_timeout(Arc::clone(&proxy));
        proxy
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// The session currently receiving reports, if any.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.inner.lock().current.clone()
    }

    /// Number of sessions started so far, split-offs included.
    pub fn session_count(&self) -> u32 {
        self.inner.lock().next_sequence
    }

    // ============================================================================================
    // SPLITTING
    // ============================================================================================

    fn start_session(&self, inner: &mut ProxyInner, start_ms: u64) -> Arc<Session> {
        let key = BeaconKey::new(self.session_number, inner.next_sequence);
        inner.next_sequence += 1;

        let mut beacon = Beacon::new(
            key,
            Arc::clone(&self.ctx.cache),
            Arc::clone(&self.ctx.config),
            self.client_ip.clone(),
            start_ms,
        );
        if let Some(device_id) = self.device_id {
            beacon = beacon.with_device_id(device_id);
        }
        let session = Session::create(beacon, &self.ctx.sender);
        if let Some(tag) = &inner.user_tag {
            session.identify_user(tag);
        }

        inner.top_level_events = 0;
        inner.session_start_ms = start_ms;
        inner.last_interaction_ms = start_ms;
        session
    }

    /// Finishes `session`, giving open actions half a send interval to complete.
    fn close_split_off(&self, session: Arc<Session>) {
        let grace = self.ctx.sender.last_server_configuration().send_interval() / 2;
        self.ctx.watchdog.close_or_enqueue_for_closing(session, grace);
    }

    fn max_events_per_session(&self) -> Option<u32> {
        self.ctx
            .sender
            .last_server_configuration()
            .max_events_per_session()
            .or(self.ctx.config.session.max_events_per_session)
    }

    fn max_session_duration(&self) -> Option<Duration> {
        self.ctx
            .sender
            .last_server_configuration()
            .max_session_duration()
            .or(self.ctx.config.session.max_session_duration)
    }

    fn session_timeout(&self) -> Option<Duration> {
        self.ctx
            .sender
            .last_server_configuration()
            .session_timeout()
            .or(self.ctx.config.session.session_timeout)
    }

    /// Session to report into, splitting or restarting first when needed.
    /// `None` once the proxy is finished.
    fn session_for_report(&self, top_level: bool) -> Option<Arc<Session>> {
        let mut split_off = None;
        let session = {
            let mut inner = self.inner.lock();
            if inner.finished {
                return None;
            }
            let now = now_ms();

            let limit_reached = top_level
                && self
                    .max_events_per_session()
                    .map_or(false, |max| inner.top_level_events >= max);
            if limit_reached {
                debug!("Proxy {} reached its event limit, splitting", self.id);
                split_off = inner.current.take();
            }

            let session = match inner.current.clone() {
                Some(session) => session,
                None => {
                    let session = self.start_session(&mut inner, now);
                    inner.current = Some(Arc::clone(&session));
                    session
                }
            };
            if top_level {
                inner.top_level_events += 1;
            }
            inner.last_interaction_ms = now;
            session
        };

        if let Some(old) = split_off {
            self.close_split_off(old);
        }
        Some(session)
    }

    /// Watchdog hook: closes an idle session and splits one that ran past
    /// the maximum duration. Returns `false` once the proxy is finished and
    /// needs no further tracking.
    pub fn split_by_timeout(&self, now: u64) -> bool {
        let idle_timeout = self.session_timeout();
        let max_duration = self.max_session_duration();

        let mut idle_closed = None;
        let mut split_off = None;
        {
            let mut inner = self.inner.lock();
            if inner.finished {
                return false;
            }
            if inner.current.is_none() {
                return true;
            }

            let idle = now.saturating_sub(inner.last_interaction_ms);
            let age = now.saturating_sub(inner.session_start_ms);
            if idle_timeout.map_or(false, |timeout| idle >= duration_ms(timeout)) {
                debug!("Proxy {} idle for {} ms, closing its session", self.id, idle);
                idle_closed = inner.current.take();
            } else if max_duration.map_or(false, |max| age >= duration_ms(max)) {
                debug!("Proxy {} session reached max duration, splitting", self.id);
                split_off = inner.current.take();
                let session = self.start_session(&mut inner, now);
                inner.current = Some(session);
            }
        }

        if let Some(session) = idle_closed {
            session.end();
        }
        if let Some(session) = split_off {
            self.close_split_off(session);
        }
        true
    }

    // ============================================================================================
    // CLOSING
    // ============================================================================================

    /// Ends the proxy and its current session. Returns `true` for exactly
    /// one caller; that caller also notifies the facility.
    pub fn end(&self) -> bool {
        let current = {
            let mut inner = self.inner.lock();
            if inner.finished {
                return false;
            }
            inner.finished = true;
            inner.current.take()
        };

        if let Some(session) = current {
            session.end();
        }
        self.ctx.watchdog.remove_from_split_by_timeout(self.id);
        if self.ctx.closed.send(self.id).is_err() {
            debug!("Facility gone, proxy {} closed silently", self.id);
        }
        true
    }
}

impl SessionHandle for SessionProxy {
    fn enter_action(&self, name: &str) -> Arc<dyn ActionHandle> {
        match self.session_for_report(true) {
            Some(session) => session.enter_action(name),
            None => Arc::new(NullAction),
        }
    }

    fn report_event(&self, name: &str) {
        if let Some(session) = self.session_for_report(true) {
            session.report_event(name);
        }
    }

    fn report_value(&self, name: &str, value: ReportedValue) {
        if let Some(session) = self.session_for_report(true) {
            session.report_value(name, &value);
        }
    }

    fn report_error(&self, name: &str, code: i32, reason: &str) {
        if let Some(session) = self.session_for_report(true) {
            session.report_error(name, code, reason);
        }
    }

    fn report_crash(&self, name: &str, reason: &str, stacktrace: &str) {
        if let Some(session) = self.session_for_report(false) {
            session.report_crash(name, reason, stacktrace);
        }
    }

    fn identify_user(&self, user_tag: &str) {
        let Some(session) = self.session_for_report(false) else {
            return;
        };
        self.inner.lock().user_tag = Some(user_tag.to_string());
        session.identify_user(user_tag);
    }

    fn end(&self) {
        SessionProxy::end(self);
    }
}
