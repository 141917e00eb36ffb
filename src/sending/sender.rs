//! Owner of the background worker driving the sending state machine.

use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::context::SendingContext;
use super::state::StateKind;
use crate::config::SendingConfig;
use crate::protocol::{BeaconTransport, ServerConfiguration};
use crate::session::Session;

enum Worker {
    NotStarted,
    Running(JoinHandle<()>),
    /// Handle taken by a shutdown caller, or never spawned before shutdown.
    Released,
}

pub struct BeaconSender {
    context: Arc<SendingContext>,
    worker: Mutex<Worker>,
}

impl BeaconSender {
    pub fn new(transport: Arc<dyn BeaconTransport>, config: SendingConfig) -> Self {
        Self {
            context: Arc::new(SendingContext::new(transport, config)),
            worker: Mutex::new(Worker::NotStarted),
        }
    }

    pub fn context(&self) -> &Arc<SendingContext> {
        &self.context
    }

    /// Spawns the worker and returns immediately. Later calls, and calls
    /// after shutdown, do nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(&self) {
        let mut worker = self.worker.lock();
        if !matches!(*worker, Worker::NotStarted) || self.context.is_shutdown_requested() {
            return;
        }
        let context = Arc::clone(&self.context);
        *worker = Worker::Running(tokio::spawn(Self::run(context)));
    }

    async fn run(context: Arc<SendingContext>) {
        info!("Beacon sender started");
        while !context.is_in_terminal_state() {
            context.execute_current_state().await;
        }
        context.request_shutdown();
        // terminal before init resolved counts as failed init
        context.init_completed(false);
        context.mark_terminated();
        info!("Beacon sender stopped");
    }

    /// Waits until initialization resolved; `true` if the collector answered.
    pub async fn wait_for_init(&self) -> bool {
        self.context.wait_for_init().await
    }

    /// Like [`wait_for_init`](Self::wait_for_init), giving up after `timeout`.
    pub async fn wait_for_init_timeout(&self, timeout: Duration) -> bool {
        self.context.wait_for_init_timeout(timeout).await
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_initialized()
    }

    /// Requests shutdown and waits until the worker has flushed everything
    /// and reached the terminal state. Idempotent; concurrent callers all
    /// block until the worker is gone.
    pub async fn shutdown(&self) {
        self.context.request_shutdown();

        // initialize checks the shutdown flag under this lock, so a worker
        // that was not started here never will be
        let handle = match std::mem::replace(&mut *self.worker.lock(), Worker::Released) {
            Worker::Running(handle) => Some(handle),
            Worker::NotStarted => {
                self.context.mark_terminated();
                None
            }
            Worker::Released => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Beacon sender worker ended abnormally: {}", e);
            }
            // covers a worker that panicked before marking itself
            self.context.mark_terminated();
        }

        self.context.wait_for_termination().await;
        self.context.init_completed(false);
    }

    pub fn current_state(&self) -> StateKind {
        self.context.current_state_kind()
    }

    // ============================================================================================
    // SESSION PASSTHROUGHS
    // ============================================================================================

    pub fn add_session(&self, session: Arc<Session>) {
        self.context.add_session(session);
    }

    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        self.context.remove_session(session)
    }

    pub fn last_server_configuration(&self) -> ServerConfiguration {
        self.context.last_server_configuration()
    }

    pub fn current_server_id(&self) -> u32 {
        self.context.current_server_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::mock::{Scripted, ScriptedTransport};
    use crate::protocol::StatusResponse;
    use crate::session::tests_support::configured_session;

    fn fast_config() -> SendingConfig {
        SendingConfig {
            default_send_interval: Duration::from_millis(50),
            status_request_retries: 0,
            initial_retry_delay: Duration::from_millis(1),
            reinit_delays: vec![Duration::from_millis(1)],
            capture_on_tick: Duration::from_millis(5),
            ..SendingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let transport = Arc::new(ScriptedTransport::new());
        let sender = BeaconSender::new(transport.clone(), fast_config());

        sender.initialize();
        sender.initialize();
        assert!(sender.wait_for_init_timeout(Duration::from_secs(5)).await);
        assert!(sender.is_initialized());
        assert_eq!(transport.count("status"), 1);

        sender.shutdown().await;
        assert_eq!(sender.current_state(), StateKind::Terminal);
        sender.shutdown().await;
        // waiting after shutdown stays side-effect free
        assert!(sender.wait_for_init().await);
    }

    #[tokio::test]
    async fn test_shutdown_without_initialize_resolves_init_false() {
        let sender = BeaconSender::new(Arc::new(ScriptedTransport::new()), fast_config());
        sender.shutdown().await;
        assert!(!sender.wait_for_init().await);

        // initialize after shutdown does not start anything
        sender.initialize();
        assert!(matches!(*sender.worker.lock(), Worker::Released));
        assert!(sender.context().is_terminated());
    }

    #[tokio::test]
    async fn test_unreachable_collector_fails_init() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(Scripted::Fail);
        transport.push_status(Scripted::Fail);
        let sender = BeaconSender::new(transport, fast_config());

        sender.initialize();
        assert!(!sender.wait_for_init().await);
        sender.shutdown().await;
        assert_eq!(sender.current_state(), StateKind::Terminal);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_registered_sessions() {
        let transport = Arc::new(ScriptedTransport::new());
        let sender = BeaconSender::new(transport.clone(), fast_config());
        sender.initialize();
        assert!(sender.wait_for_init().await);

        let (session, cache) = configured_session(1);
        sender.add_session(Arc::clone(&session));
        sender.shutdown().await;

        assert!(session.is_finished());
        assert_eq!(cache.num_bytes_in_cache(), 0);
        assert!(transport.count("beacon") >= 1);
        assert_eq!(sender.context().session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_shutdowns_wait_for_terminal_state() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_beacon(Scripted::Delayed(Duration::from_millis(300), StatusResponse::ok()));
        let sender = Arc::new(BeaconSender::new(transport.clone(), fast_config()));
        sender.initialize();
        assert!(sender.wait_for_init().await);

        let (session, cache) = configured_session(1);
        session.report_event("pending at shutdown");
        sender.add_session(Arc::clone(&session));

        let first = {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                sender.shutdown().await;
                sender.current_state()
            })
        };
        // let the first caller take the worker handle and start flushing
        tokio::time::sleep(Duration::from_millis(20)).await;

        sender.shutdown().await;
        assert_eq!(sender.current_state(), StateKind::Terminal);
        assert!(transport.count("beacon") >= 1);
        assert_eq!(cache.num_bytes_in_cache(), 0);

        assert_eq!(first.await.unwrap(), StateKind::Terminal);
        assert!(session.is_finished());
    }
}
