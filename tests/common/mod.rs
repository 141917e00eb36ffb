//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use beaconkit::{BeaconRequest, BeaconTransport, OpenKitConfig, ResponseAttributes, StatusResponse, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory collector. Answers every request with `200` unless told to
/// fail or reject, and records everything it receives.
#[derive(Default)]
pub struct CollectorStub {
    requests: Mutex<Vec<BeaconRequest>>,
    failures_left: AtomicUsize,
    reject_beacons: AtomicBool,
    capture_off: AtomicBool,
    beacon_delay: Mutex<Duration>,
}

impl CollectorStub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `count` requests fail at the transport level.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Answer beacon posts with `503`.
    pub fn reject_beacons(&self, reject: bool) {
        self.reject_beacons.store(reject, Ordering::SeqCst);
    }

    /// Report `capture=0` on status probes.
    pub fn set_capture_off(&self, off: bool) {
        self.capture_off.store(off, Ordering::SeqCst);
    }

    /// Hold every beacon post for `delay` before answering.
    pub fn set_beacon_delay(&self, delay: Duration) {
        *self.beacon_delay.lock() = delay;
    }

    pub fn count(&self, kind: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.kind() == kind).count()
    }

    pub fn beacon_payloads(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                BeaconRequest::Beacon { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of `et=<event_type>` records across every beacon received.
    pub fn records_of_type(&self, event_type: u8) -> usize {
        let needle = format!("et={}", event_type);
        self.beacon_payloads()
            .iter()
            .flat_map(|payload| payload.split('&').map(str::to_string).collect::<Vec<_>>())
            .filter(|pair| *pair == needle)
            .count()
    }
}

#[async_trait]
impl BeaconTransport for CollectorStub {
    async fn send(&self, request: BeaconRequest) -> Result<StatusResponse, TransportError> {
        let is_beacon = matches!(request, BeaconRequest::Beacon { .. });
        self.requests.lock().push(request);

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::MalformedResponse("collector unreachable".into()));
        }
        let delay = *self.beacon_delay.lock();
        if is_beacon && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if is_beacon && self.reject_beacons.load(Ordering::SeqCst) {
            return Ok(StatusResponse::new(503, ResponseAttributes::undefined()));
        }
        let attributes = ResponseAttributes {
            capture: Some(!self.capture_off.load(Ordering::SeqCst)),
            ..ResponseAttributes::undefined()
        };
        Ok(StatusResponse::new(200, attributes))
    }
}

/// Routes library logs to the test harness; `RUST_LOG` picks the level.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Configuration with every interval shrunk to test scale.
pub fn fast_config() -> OpenKitConfig {
    let mut config = OpenKitConfig::new("https://collector.example.com/mbeacon", "integration", 7);
    config.application_name = "integration".to_string();
    config.sending.default_send_interval = Duration::from_millis(20);
    config.sending.status_request_retries = 2;
    config.sending.initial_retry_delay = Duration::from_millis(1);
    config.sending.reinit_delays = vec![Duration::from_millis(1); 3];
    config.sending.status_check_interval = Duration::from_millis(10);
    config.sending.capture_on_tick = Duration::from_millis(2);
    config.session.watchdog_interval = Duration::from_millis(5);
    config
}
