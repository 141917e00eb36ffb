//! Sessions: beacon serialization, lifecycle, splitting and the watchdog,
//! plus the handles the application reports through.

pub mod action;
pub mod beacon;
pub mod null;
pub mod proxy;
#[allow(clippy::module_inception)]
pub mod session;
pub mod watchdog;

use std::sync::Arc;
use std::time::Duration;

pub use action::Action;
pub use beacon::Beacon;
pub use null::{NullAction, NullSession};
pub use proxy::{ProxyContext, SessionProxy};
pub use session::{Session, SessionState};
pub use watchdog::SessionWatchdog;

/// A value reported with [`SessionHandle::report_value`].
#[derive(Clone, Debug, PartialEq)]
pub enum ReportedValue {
    Int(i64),
    Double(f64),
    Text(String),
}

impl From<i64> for ReportedValue {
    fn from(value: i64) -> Self {
        ReportedValue::Int(value)
    }
}

impl From<i32> for ReportedValue {
    fn from(value: i32) -> Self {
        ReportedValue::Int(i64::from(value))
    }
}

impl From<f64> for ReportedValue {
    fn from(value: f64) -> Self {
        ReportedValue::Double(value)
    }
}

impl From<&str> for ReportedValue {
    fn from(value: &str) -> Self {
        ReportedValue::Text(value.to_string())
    }
}

impl From<String> for ReportedValue {
    fn from(value: String) -> Self {
        ReportedValue::Text(value)
    }
}

/// What the application holds for one session.
///
/// Reporting only appends to the local cache; it never waits on the network.
pub trait SessionHandle: Send + Sync {
    fn enter_action(&self, name: &str) -> Arc<dyn ActionHandle>;
    fn report_event(&self, name: &str);
    fn report_value(&self, name: &str, value: ReportedValue);
    fn report_error(&self, name: &str, code: i32, reason: &str);
    fn report_crash(&self, name: &str, reason: &str, stacktrace: &str);
    fn identify_user(&self, user_tag: &str);
    /// Ends the session. Later calls do nothing.
    fn end(&self);
}

/// What the application holds for one action.
pub trait ActionHandle: Send + Sync {
    fn report_event(&self, name: &str);
    fn report_value(&self, name: &str, value: ReportedValue);
    fn report_error(&self, name: &str, code: i32, reason: &str);
    /// Closes the action and records it. Later calls do nothing.
    fn leave_action(&self);
    /// Closes the action without recording it.
    fn cancel_action(&self);
    fn duration(&self) -> Duration;
}
