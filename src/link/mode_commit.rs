//! Confirming mode changes that the hardware applies some time after the
//! command byte lands.
//!
//! A driver records the request in a [`ModeCommitRecord`] and writes the
//! mode byte. Before the sub-device is used again, [`complete_mode_switch`]
//! polls the mode register once per read cycle until the device reports the
//! new mode, resending the command whenever it has waited too long.

use crate::link::{
    error::Result,
    last_known::LastKnown,
    wire::WireByte,
};

/// Default number of read cycles to wait before resending a mode byte.
pub const DEFAULT_WAIT_COUNT_MAX: u32 = 4;

/// Register access the completion loop needs for one sub-device.
pub trait CommitTarget {
    type Mode: Copy + PartialEq + WireByte;

    /// Current contents of the sub-device's mode register.
    fn read_mode(&self, index: usize) -> Result<u8>;

    fn write_mode(&self, index: usize, mode: Self::Mode) -> Result<()>;

    /// Blocks for one read cycle; `false` if the device went away.
    fn wait_for_next_read(&self) -> bool;

    fn is_armed(&self) -> bool;

    /// Whether the device reporting `reported` has applied `requested`.
    fn is_confirmed(&self, requested: Self::Mode, reported: u8) -> bool {
        reported == requested.to_wire_byte()
    }
}

/// How a completion loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The device reports the requested mode.
    Confirmed { resends: u32 },
    /// The device stopped being armed first.
    Abandoned { resends: u32 },
}

impl CommitOutcome {
    pub fn resends(self) -> u32 {
        match self {
            CommitOutcome::Confirmed { resends } | CommitOutcome::Abandoned { resends } => resends,
        }
    }

    pub fn is_confirmed(self) -> bool {
        matches!(self, CommitOutcome::Confirmed { .. })
    }
}

/// Per sub-device bookkeeping for an in-flight mode switch.
#[derive(Debug, Clone)]
pub struct ModeCommitRecord<M: Clone + PartialEq> {
    pub last_known_mode: LastKnown<M>,
    pub pending_mode: Option<M>,
    pub prev_mode: Option<M>,
    pub prev_value: f64,
    pub wait_count: u32,
    pub wait_count_max: u32,
    pub completion_needed: bool,
}

impl<M: Copy + PartialEq> ModeCommitRecord<M> {
    pub fn new(wait_count_max: u32) -> Self {
        Self {
            last_known_mode: LastKnown::new(),
            pending_mode: None,
            prev_mode: None,
            prev_value: 0.0,
            wait_count: 0,
            wait_count_max,
            completion_needed: false,
        }
    }

    /// Records a newly written mode request. Any earlier request must be
    /// completed first.
    pub fn begin(&mut self, requested: M, prev_mode: Option<M>, prev_value: f64) {
        debug_assert!(!self.completion_needed, "mode switch already pending");
        self.pending_mode = Some(requested);
        self.prev_mode = prev_mode;
        self.prev_value = prev_value;
        self.wait_count = 0;
        self.completion_needed = true;
    }

    pub fn finish(&mut self) {
        self.pending_mode = None;
        self.completion_needed = false;
    }
}

/// Polls until `index` reports the pending mode, resending it each time
/// the wait count passes its maximum. Returns immediately when nothing is
/// pending. Leaves the record's completion flag for the caller to clear.
pub fn complete_mode_switch<T: CommitTarget>(
    target: &T,
    index: usize,
    record: &mut ModeCommitRecord<T::Mode>,
) -> Result<CommitOutcome> {
    let Some(requested) = record.pending_mode.filter(|_| record.completion_needed) else {
        return Ok(CommitOutcome::Confirmed { resends: 0 });
    };

    let mut resends = 0;
    loop {
        if !target.is_armed() {
            return Ok(CommitOutcome::Abandoned { resends });
        }

        let reported = target.read_mode(index)?;
        if target.is_confirmed(requested, reported) {
            return Ok(CommitOutcome::Confirmed { resends });
        }

        let waited = record.wait_count;
        record.wait_count += 1;
        if waited >= record.wait_count_max {
            tracing::debug!(
                index,
                wait = waited,
                mode = requested.to_wire_byte(),
                current = reported,
                "mode resend"
            );
            target.write_mode(index, requested)?;
            record.wait_count = 0;
            resends += 1;
        }

        // The register only changes once per read cycle
        if !target.wait_for_next_read() {
            return Ok(CommitOutcome::Abandoned { resends });
        }
    }
}
