use std::time::Instant;

use hwif::HwStatus;
use tracing::trace;

/// Acquisition status of the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Exposure,
    Readout,
    Latency,
    Fault,
}

impl From<Status> for HwStatus {
    fn from(orig: Status) -> Self {
        match orig {
            Status::Ready => HwStatus::Ready,
            Status::Exposure => HwStatus::Exposure,
            Status::Readout => HwStatus::Readout,
            Status::Latency => HwStatus::Latency,
            Status::Fault => HwStatus::Fault,
        }
    }
}

/// Status of the current session. `Fault` sticks until forced away.
#[derive(Debug)]
pub(crate) struct SessionStatus {
    current: Status,
    since: Instant,
}

impl SessionStatus {
    pub(crate) fn new() -> Self {
        Self {
            current: Status::Ready,
            since: Instant::now(),
        }
    }

    pub(crate) fn get(&self) -> Status {
        self.current
    }

    /// Change the status unless in [Status::Fault].
    pub(crate) fn set(&mut self, status: Status) {
        if self.current == Status::Fault {
            return;
        }
        self.transition(status);
    }

    pub(crate) fn force(&mut self, status: Status) {
        self.transition(status);
    }

    fn transition(&mut self, status: Status) {
        if status == self.current {
            return;
        }
        trace!(
            "status {:?} -> {:?} after {} ms",
            self.current,
            status,
            self.since.elapsed().as_millis()
        );
        self.current = status;
        self.since = Instant::now();
    }
}
