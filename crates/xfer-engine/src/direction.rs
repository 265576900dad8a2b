//! Transfer directions and the per-direction copy → record → wait state machine.

use std::fmt;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device → host.
    Fetch,
    /// Host → device.
    Assign,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Assign => "assign",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => f.write_str("fetch (device->host)"),
            Self::Assign => f.write_str("assign (host->device)"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Idle,
    CopyIssued,
    Recorded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("record issued without a copy since the last record")]
    RecordWithoutCopy,
    #[error("wait issued before any record")]
    WaitWithoutRecord,
    #[error("wait issued with copies that were never recorded")]
    WaitWithUnrecordedCopies,
}

/// Tracks one direction of one channel.
///
/// Transitions are checked before anything is submitted, so a violation leaves both the
/// tracker and the queues untouched.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DirectionTracker {
    state: ChannelState,
    ever_recorded: bool,
}

impl DirectionTracker {
    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn ever_recorded(&self) -> bool {
        self.ever_recorded
    }

    pub(crate) fn on_copy(&mut self) {
        self.state = ChannelState::CopyIssued;
    }

    pub(crate) fn check_record(&self) -> Result<(), ProtocolViolation> {
        match self.state {
            ChannelState::CopyIssued => Ok(()),
            ChannelState::Idle | ChannelState::Recorded => {
                Err(ProtocolViolation::RecordWithoutCopy)
            }
        }
    }

    pub(crate) fn on_record(&mut self) {
        self.state = ChannelState::Recorded;
        self.ever_recorded = true;
    }

    pub(crate) fn check_wait(&self) -> Result<(), ProtocolViolation> {
        match self.state {
            ChannelState::Recorded => Ok(()),
            // The marker was reached by an earlier wait; waiting again returns immediately.
            ChannelState::Idle if self.ever_recorded => Ok(()),
            ChannelState::Idle => Err(ProtocolViolation::WaitWithoutRecord),
            ChannelState::CopyIssued => Err(ProtocolViolation::WaitWithUnrecordedCopies),
        }
    }

    pub(crate) fn on_wait(&mut self) {
        self.state = ChannelState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_returns_to_idle() {
        let mut t = DirectionTracker::default();
        assert_eq!(t.state(), ChannelState::Idle);

        t.on_copy();
        assert_eq!(t.state(), ChannelState::CopyIssued);
        t.check_record().unwrap();
        t.on_record();
        assert_eq!(t.state(), ChannelState::Recorded);
        t.check_wait().unwrap();
        t.on_wait();
        assert_eq!(t.state(), ChannelState::Idle);
        assert!(t.ever_recorded());
    }

    #[test]
    fn record_requires_a_copy() {
        let mut t = DirectionTracker::default();
        assert_eq!(t.check_record(), Err(ProtocolViolation::RecordWithoutCopy));

        t.on_copy();
        t.on_record();
        assert_eq!(
            t.check_record(),
            Err(ProtocolViolation::RecordWithoutCopy),
            "second record without a new copy"
        );
    }

    #[test]
    fn wait_preconditions() {
        let mut t = DirectionTracker::default();
        assert_eq!(t.check_wait(), Err(ProtocolViolation::WaitWithoutRecord));

        t.on_copy();
        assert_eq!(t.check_wait(), Err(ProtocolViolation::WaitWithUnrecordedCopies));

        t.on_record();
        t.on_wait();
        assert_eq!(t.check_wait(), Ok(()), "repeated wait is idempotent");
    }

    #[test]
    fn copies_may_pile_up_before_a_record() {
        let mut t = DirectionTracker::default();
        t.on_copy();
        t.on_copy();
        t.on_copy();
        assert_eq!(t.check_record(), Ok(()));
    }

    #[test]
    fn display_names_the_direction() {
        assert_eq!(Direction::Fetch.to_string(), "fetch (device->host)");
        assert_eq!(Direction::Assign.as_str(), "assign");
        assert_eq!(
            ProtocolViolation::WaitWithoutRecord.to_string(),
            "wait issued before any record"
        );
    }
}
