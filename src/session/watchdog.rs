//! Background task closing sessions the application never closes itself.
//!
//! Two kinds of work are tracked:
//!
//! - sessions split off by a proxy while actions were still open; they get a
//!   grace period to finish those actions and are force-closed afterwards
//! - proxies with an idle timeout or maximum duration; the watchdog asks them
//!   on every scan to split or close their current session

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::proxy::SessionProxy;
use super::session::Session;
use crate::types::{duration_ms, now_ms, CompletionLatch, ShutdownSignal};

struct PendingClose {
    session: Arc<Session>,
    deadline_ms: u64,
}

#[derive(Default)]
struct Tracked {
    closing: Mutex<Vec<PendingClose>>,
    splitting: Mutex<HashMap<u64, Arc<SessionProxy>>>,
}

impl Tracked {
    /// One scan. Returns the number of sessions closed.
    fn scan(&self, now: u64) -> usize {
        let due: Vec<Arc<Session>> = {
            let mut closing = self.closing.lock();
            let (due, waiting): (Vec<_>, Vec<_>) = closing
                .drain(..)
                .partition(|p| p.deadline_ms <= now || p.session.open_action_count() == 0);
            *closing = waiting;
            due.into_iter().map(|p| p.session).collect()
        };
        let closed = due.iter().filter(|session| session.end()).count();
        if closed > 0 {
            debug!("Watchdog closed {} split-off sessions", closed);
        }

        let proxies: Vec<Arc<SessionProxy>> = self.splitting.lock().values().cloned().collect();
        for proxy in proxies {
            if !proxy.split_by_timeout(now) {
                self.splitting.lock().remove(&proxy.id());
            }
        }
        closed
    }

    fn close_all(&self) {
        let pending: Vec<PendingClose> = self.closing.lock().drain(..).collect();
        for p in pending {
            p.session.end();
        }
        self.splitting.lock().clear();
    }
}

enum Worker {
    NotStarted,
    Running(JoinHandle<()>),
    Released,
}

pub struct SessionWatchdog {
    interval: Duration,
    tracked: Arc<Tracked>,
    shutdown: Arc<ShutdownSignal>,
    stopped: Arc<CompletionLatch>,
    worker: Mutex<Worker>,
}

impl SessionWatchdog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tracked: Arc::new(Tracked::default()),
            shutdown: Arc::new(ShutdownSignal::new()),
            stopped: Arc::new(CompletionLatch::new()),
            worker: Mutex::new(Worker::NotStarted),
        }
    }

    /// Spawns the scan loop. Idempotent; does nothing once shutdown began.
    pub fn initialize(&self) {
        let mut worker = self.worker.lock();
        if !matches!(*worker, Worker::NotStarted) || self.shutdown.is_requested() {
            return;
        }
        *worker = Worker::Running(tokio::spawn(Self::run(
            Arc::clone(&self.tracked),
            self.interval,
            Arc::clone(&self.shutdown),
            Arc::clone(&self.stopped),
        )));
    }

    async fn run(
        tracked: Arc<Tracked>,
        interval: Duration,
        shutdown: Arc<ShutdownSignal>,
        stopped: Arc<CompletionLatch>,
    ) {
        info!("Session watchdog started (interval {:?})", interval);
        loop {
            tracked.scan(now_ms());
            if shutdown.sleep(interval).await {
                break;
            }
        }
        tracked.close_all();
        stopped.complete();
        info!("Session watchdog stopped");
    }

    /// Stops the scan loop, waits for it, and closes every session still
    /// waiting for its grace period. Idempotent; concurrent callers all
    /// return only after the loop exited and the sessions were closed.
    pub async fn shutdown(&self) {
        self.shutdown.request();

        let handle = match std::mem::replace(&mut *self.worker.lock(), Worker::Released) {
            Worker::Running(handle) => Some(handle),
            Worker::NotStarted => {
                self.tracked.close_all();
                self.stopped.complete();
                None
            }
            Worker::Released => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Session watchdog task ended abnormally: {}", e);
                self.tracked.close_all();
                self.stopped.complete();
            }
        }

        self.stopped.wait().await;
    }

    /// Ends `session` now if it has no open actions, otherwise once they
    /// are closed or `grace_period` elapsed, whichever comes first.
    pub fn close_or_enqueue_for_closing(&self, session: Arc<Session>, grace_period: Duration) {
        if session.open_action_count() == 0 {
            session.end();
            return;
        }
        debug!("Session {} has open actions, closing within {:?}", session.key(), grace_period);
        self.tracked.closing.lock().push(PendingClose {
            session,
            deadline_ms: now_ms().saturating_add(duration_ms(grace_period)),
        });
    }

    pub fn dequeue_from_closing(&self, session: &Arc<Session>) -> bool {
        let mut closing = self.tracked.closing.lock();
        let before = closing.len();
        closing.retain(|p| !Arc::ptr_eq(&p.session, session));
        closing.len() != before
    }

    pub fn add_to_split_by_timeout(&self, proxy: Arc<SessionProxy>) {
        self.tracked.splitting.lock().insert(proxy.id(), proxy);
    }

    pub fn remove_from_split_by_timeout(&self, proxy_id: u64) -> bool {
        self.tracked.splitting.lock().remove(&proxy_id).is_some()
    }

    pub fn pending_close_count(&self) -> usize {
        self.tracked.closing.lock().len()
    }

    pub fn tracked_proxy_count(&self) -> usize {
        self.tracked.splitting.lock().len()
    }

    /// Runs one scan immediately.
    pub fn scan_now(&self) -> usize {
        self.tracked.scan(now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests_support::configured_session;
    use crate::session::ActionHandle;

    #[test]
    fn test_session_without_actions_closes_immediately() {
        let watchdog = SessionWatchdog::new(Duration::from_secs(1));
        let (session, _) = configured_session(1);
        watchdog.close_or_enqueue_for_closing(Arc::clone(&session), Duration::from_secs(60));
        assert!(session.is_finished());
        assert_eq!(watchdog.pending_close_count(), 0);
    }

    #[test]
    fn test_grace_period_and_action_completion() {
        let watchdog = SessionWatchdog::new(Duration::from_secs(1));
        let (session, _) = configured_session(1);
        let action = session.enter_action("long running");

        watchdog.close_or_enqueue_for_closing(Arc::clone(&session), Duration::from_secs(60));
        assert!(!session.is_finished());
        assert_eq!(watchdog.scan_now(), 0);

        action.leave_action();
        assert_eq!(watchdog.scan_now(), 1);
        assert!(session.is_finished());
        assert_eq!(watchdog.pending_close_count(), 0);
    }

    #[test]
    fn test_expired_grace_period_forces_close() {
        let watchdog = SessionWatchdog::new(Duration::from_secs(1));
        let (session, _) = configured_session(1);
        let _action = session.enter_action("never left");

        watchdog.close_or_enqueue_for_closing(Arc::clone(&session), Duration::ZERO);
        assert_eq!(watchdog.scan_now(), 1);
        assert!(session.is_finished());
    }

    #[test]
    fn test_dequeue() {
        let watchdog = SessionWatchdog::new(Duration::from_secs(1));
        let (session, _) = configured_session(1);
        let _action = session.enter_action("open");
        watchdog.close_or_enqueue_for_closing(Arc::clone(&session), Duration::from_secs(60));

        assert!(watchdog.dequeue_from_closing(&session));
        assert!(!watchdog.dequeue_from_closing(&session));
        assert_eq!(watchdog.pending_close_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pending_sessions() {
        let watchdog = SessionWatchdog::new(Duration::from_millis(5));
        watchdog.initialize();
        watchdog.initialize();

        let (session, _) = configured_session(1);
        let _action = session.enter_action("open");
        watchdog.close_or_enqueue_for_closing(Arc::clone(&session), Duration::from_secs(3600));

        watchdog.shutdown().await;
        assert!(session.is_finished());
        watchdog.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_shutdowns_both_see_sessions_closed() {
        let watchdog = Arc::new(SessionWatchdog::new(Duration::from_millis(5)));
        watchdog.initialize();

        let sessions: Vec<_> = (0..4)
            .map(|n| {
                let (session, _) = configured_session(n);
                let action = session.enter_action("open");
                watchdog.close_or_enqueue_for_closing(Arc::clone(&session), Duration::from_secs(3600));
                (session, action)
            })
            .collect();

        let shutdowns: Vec<_> = (0..2)
            .map(|_| {
                let watchdog = Arc::clone(&watchdog);
                let sessions: Vec<_> = sessions.iter().map(|(s, _)| Arc::clone(s)).collect();
                tokio::spawn(async move {
                    watchdog.shutdown().await;
                    sessions.iter().all(|s| s.is_finished())
                })
            })
            .collect();
        for shutdown in shutdowns {
            assert!(shutdown.await.unwrap());
        }
        assert_eq!(watchdog.pending_close_count(), 0);

        // no restart after shutdown
        watchdog.initialize();
        assert!(matches!(*watchdog.worker.lock(), Worker::Released));
    }

    #[tokio::test]
    async fn test_shutdown_without_initialize_closes_pending_sessions() {
        let watchdog = SessionWatchdog::new(Duration::from_millis(5));
        let (session, _) = configured_session(1);
        let _action = session.enter_action("open");
        watchdog.close_or_enqueue_for_closing(Arc::clone(&session), Duration::from_secs(3600));

        watchdog.shutdown().await;
        assert!(session.is_finished());
    }
}
