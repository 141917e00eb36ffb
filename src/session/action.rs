//! Timed actions within a session.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::beacon::Beacon;
use super::session::Session;
use super::{ActionHandle, ReportedValue};
use crate::types::now_ms;

#[derive(Clone, Copy, Debug)]
struct ActionEnd {
    time_ms: u64,
    sequence: u32,
}

/// A named, timed unit of work. The action record is written once, when the
/// action is left; reports made within it are written immediately with the
/// action as parent.
pub struct Action {
    session: Arc<Session>,
    id: u32,
    parent_id: u32,
    name: String,
    start_ms: u64,
    start_sequence: u32,
    end: Mutex<Option<ActionEnd>>,
}

impl Action {
    pub(crate) fn new(session: Arc<Session>, name: &str) -> Self {
        let beacon = session.beacon();
        let id = beacon.create_id();
        let start_sequence = beacon.create_sequence_number();
        Self {
            id,
            parent_id: 0,
            name: name.to_string(),
            start_ms: now_ms(),
            start_sequence,
            end: Mutex::new(None),
            session,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_time(&self) -> u64 {
        self.start_ms
    }

    pub fn start_sequence(&self) -> u32 {
        self.start_sequence
    }

    /// End time, or the start time while the action is still open.
    pub fn end_time(&self) -> u64 {
        self.end.lock().map_or(self.start_ms, |end| end.time_ms)
    }

    pub fn end_sequence(&self) -> u32 {
        self.end.lock().map_or(0, |end| end.sequence)
    }

    pub fn is_left(&self) -> bool {
        self.end.lock().is_some()
    }

    /// Writes through the session unless the action was left or the
    /// session ended.
    fn record(&self, write: impl FnOnce(&Beacon)) {
        if !self.is_left() {
            self.session.record_if_open(write);
        }
    }

    /// Closes the action. Only the first call (leave or cancel) counts.
    fn close(&self) -> bool {
        let mut end = self.end.lock();
        if end.is_some() {
            return false;
        }
        *end = Some(ActionEnd {
            time_ms: now_ms(),
            sequence: self.session.beacon().create_sequence_number(),
        });
        true
    }
}

impl ActionHandle for Action {
    fn report_event(&self, name: &str) {
        self.record(|beacon| beacon.report_event(self.id, name));
    }

    fn report_value(&self, name: &str, value: ReportedValue) {
        self.record(|beacon| beacon.report_value(self.id, name, &value));
    }

    fn report_error(&self, name: &str, code: i32, reason: &str) {
        self.record(|beacon| beacon.report_error(self.id, name, code, reason));
    }

    fn leave_action(&self) {
        if self.close() {
            self.session.beacon().add_action(self);
            self.session.on_action_closed();
        }
    }

    fn cancel_action(&self) {
        if self.close() {
            self.session.on_action_closed();
        }
    }

    fn duration(&self) -> Duration {
        let end = match *self.end.lock() {
            Some(end) => end.time_ms,
            None => now_ms(),
        };
        Duration::from_millis(end.saturating_sub(self.start_ms))
    }
}
