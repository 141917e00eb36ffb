//! Inert handles returned once reporting is no longer possible.

use std::sync::Arc;
use std::time::Duration;

use super::{ActionHandle, ReportedValue, SessionHandle};

/// Session handed out after shutdown. Every call is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSession;

/// Action handed out by finished sessions and [`NullSession`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAction;

impl SessionHandle for NullSession {
    fn enter_action(&self, _name: &str) -> Arc<dyn ActionHandle> {
        Arc::new(NullAction)
    }

    fn report_event(&self, _name: &str) {}

    fn report_value(&self, _name: &str, _value: ReportedValue) {}

    fn report_error(&self, _name: &str, _code: i32, _reason: &str) {}

    fn report_crash(&self, _name: &str, _reason: &str, _stacktrace: &str) {}

    fn identify_user(&self, _user_tag: &str) {}

    fn end(&self) {}
}

impl ActionHandle for NullAction {
    fn report_event(&self, _name: &str) {}

    fn report_value(&self, _name: &str, _value: ReportedValue) {}

    fn report_error(&self, _name: &str, _code: i32, _reason: &str) {}

    fn leave_action(&self) {}

    fn cancel_action(&self) {}

    fn duration(&self) -> Duration {
        Duration::ZERO
    }
}
