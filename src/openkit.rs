//! # OpenKit - top-level monitoring facility
//!
//! Wires the beacon cache, the cache evictor, the beacon sender and the
//! session watchdog together and hands out sessions.
//!
//! The facility owns every session it created in an id-addressed arena.
//! Sessions never call back into the facility; a session that ends sends
//! its id over a channel, and the facility drops it from the arena the next
//! time the arena is touched.
//!
//! ```no_run
//! use beaconkit::{OpenKit, OpenKitConfig, SessionHandle};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OpenKitConfig::new("https://collector.example.com/mbeacon", "my-app", 42);
//! let openkit = OpenKit::with_http_transport(config)?;
//! openkit.initialize();
//! openkit.wait_for_init_completion().await;
//!
//! let session = openkit.create_session("10.0.0.1");
//! let action = session.enter_action("checkout");
//! action.report_value("items", 3i64.into());
//! action.leave_action();
//! session.end();
//!
//! openkit.shutdown().await;
//! # Ok(())
//! # }
//! ```

use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::caching::{BeaconCache, CacheEvictor};
use crate::config::OpenKitConfig;
use crate::error::ConfigError;
use crate::protocol::{BeaconTransport, HttpTransport};
use crate::sending::BeaconSender;
use crate::session::{NullSession, ProxyContext, SessionHandle, SessionProxy, SessionWatchdog};
use crate::types::{now_ms, CompletionLatch};

struct SessionArena {
    sessions: HashMap<u64, Arc<SessionProxy>>,
    closed: mpsc::UnboundedReceiver<u64>,
}

impl SessionArena {
    /// Drops every session that reported its closure.
    fn drain_closed(&mut self) {
        while let Ok(id) = self.closed.try_recv() {
            self.sessions.remove(&id);
        }
    }
}

pub struct OpenKit {
    config: Arc<OpenKitConfig>,
    cache: Arc<BeaconCache>,
    evictor: CacheEvictor,
    sender: Arc<BeaconSender>,
    watchdog: Arc<SessionWatchdog>,
    arena: Mutex<SessionArena>,
    closed_tx: mpsc::UnboundedSender<u64>,
    next_proxy_id: AtomicU64,
    next_session_number: AtomicU32,
    is_shutdown: AtomicBool,
    shut_down: CompletionLatch,
}

impl OpenKit {
    /// Builds the facility on top of `transport`. Nothing runs until
    /// [`initialize`](Self::initialize).
    pub fn new(config: OpenKitConfig, transport: Arc<dyn BeaconTransport>) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let cache = Arc::new(BeaconCache::new());
        let evictor = CacheEvictor::new(Arc::clone(&cache), config.cache.clone());
        let sender = Arc::new(BeaconSender::new(transport, config.sending.clone()));
        let watchdog = Arc::new(SessionWatchdog::new(config.session.watchdog_interval));
        let (closed_tx, closed) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            cache,
            evictor,
            sender,
            watchdog,
            arena: Mutex::new(SessionArena {
                sessions: HashMap::new(),
                closed,
            }),
            closed_tx,
            next_proxy_id: AtomicU64::new(1),
            next_session_number: AtomicU32::new(rand::thread_rng().gen_range(1..i32::MAX as u32)),
            is_shutdown: AtomicBool::new(false),
            shut_down: CompletionLatch::new(),
        })
    }

    /// Builds the facility with the reqwest-backed transport.
    pub fn with_http_transport(config: OpenKitConfig) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(&config).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::new(config, Arc::new(transport))
    }

    /// Starts the background workers: cache evictor, session watchdog and
    /// beacon sender. Must be called from within a tokio runtime.
    pub fn initialize(&self) {
        if self.is_shutdown.load(Ordering::Acquire) {
            return;
        }
        info!(
            "Initializing OpenKit for application {} ({})",
            self.config.application_id, self.config.endpoint_url
        );
        self.evictor.start();
        self.watchdog.initialize();
        self.sender.initialize();
    }

    /// Waits until the first contact with the collector resolved.
    pub async fn wait_for_init_completion(&self) -> bool {
        self.sender.wait_for_init().await
    }

    pub async fn wait_for_init_completion_timeout(&self, timeout: Duration) -> bool {
        self.sender.wait_for_init_timeout(timeout).await
    }

    pub fn is_initialized(&self) -> bool {
        self.sender.is_initialized()
    }

    // ============================================================================================
    // SESSIONS
    // ============================================================================================

    pub fn create_session(&self, client_ip: &str) -> Arc<dyn SessionHandle> {
        self.create_proxy(client_ip, None, now_ms())
    }

    /// Session whose start is backdated to `timestamp_ms`.
    pub fn create_session_at(&self, client_ip: &str, timestamp_ms: u64) -> Arc<dyn SessionHandle> {
        self.create_proxy(client_ip, None, timestamp_ms)
    }

    /// Session reported under `device_id` instead of the configured one.
    pub fn create_session_with_device_id(&self, client_ip: &str, device_id: i64) -> Arc<dyn SessionHandle> {
        self.create_proxy(client_ip, Some(device_id), now_ms())
    }

    fn create_proxy(&self, client_ip: &str, device_id: Option<i64>, start_ms: u64) -> Arc<dyn SessionHandle> {
        let mut arena = self.arena.lock();
        // checked under the arena lock so shutdown cannot miss a new session
        if self.is_shutdown.load(Ordering::Acquire) {
            debug!("OpenKit is shut down, handing out a null session");
            return Arc::new(NullSession);
        }
        arena.drain_closed();

        let id = self.next_proxy_id.fetch_add(1, Ordering::Relaxed);
        let session_number = self.next_session_number.fetch_add(1, Ordering::Relaxed);
        let client_ip = Some(client_ip.trim())
            .filter(|ip| !ip.is_empty())
            .map(str::to_string);

        let proxy = SessionProxy::new(id, session_number, client_ip, device_id, start_ms, self.proxy_context());
        arena.sessions.insert(id, Arc::clone(&proxy));
        proxy
    }

    fn proxy_context(&self) -> ProxyContext {
        ProxyContext {
            cache: Arc::clone(&self.cache),
            config: Arc::clone(&self.config),
            sender: Arc::clone(&self.sender),
            watchdog: Arc::clone(&self.watchdog),
            closed: self.closed_tx.clone(),
        }
    }

    /// Sessions created and not yet ended.
    pub fn child_count(&self) -> usize {
        let mut arena = self.arena.lock();
        arena.drain_closed();
        arena.sessions.len()
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn config(&self) -> &OpenKitConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BeaconCache> {
        &self.cache
    }

    pub fn sender(&self) -> &Arc<BeaconSender> {
        &self.sender
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    // ============================================================================================
    // SHUTDOWN
    // ============================================================================================

    /// Ends every open session, stops the evictor and the watchdog, then
    /// lets the sender flush everything and stop. Idempotent; a caller
    /// arriving while another shutdown runs waits for that one to finish.
    pub async fn shutdown(&self) {
        let children: Option<Vec<Arc<SessionProxy>>> = {
            let mut arena = self.arena.lock();
            if self.is_shutdown.swap(true, Ordering::AcqRel) {
                None
            } else {
                arena.drain_closed();
                Some(arena.sessions.drain().map(|(_, proxy)| proxy).collect())
            }
        };
        let Some(children) = children else {
            self.shut_down.wait().await;
            return;
        };

        info!("Shutting down OpenKit, closing {} open sessions", children.len());
        for proxy in &children {
            proxy.end();
        }

        self.evictor.stop().await;
        self.watchdog.shutdown().await;
        self.sender.shutdown().await;
        self.shut_down.complete();
        info!("OpenKit shut down");
    }
}
