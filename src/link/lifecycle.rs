//! Arming states shared between a controller's lifecycle and its write gate.

use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::link::{error::Result, transport::Transport};

/// Where a controller is in its arm / pretend / disarm cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArmingState {
    Disarmed = 0,
    ToArmed = 1,
    Armed = 2,
    ToPretending = 3,
    Pretending = 4,
    ToDisarmed = 5,
    Closed = 6,
}

impl ArmingState {
    pub fn name(self) -> &'static str {
        match self {
            ArmingState::Disarmed => "DISARMED",
            ArmingState::ToArmed => "TO_ARMED",
            ArmingState::Armed => "ARMED",
            ArmingState::ToPretending => "TO_PRETENDING",
            ArmingState::Pretending => "PRETENDING",
            ArmingState::ToDisarmed => "TO_DISARMED",
            ArmingState::Closed => "CLOSED",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ArmingState::ToArmed,
            2 => ArmingState::Armed,
            3 => ArmingState::ToPretending,
            4 => ArmingState::Pretending,
            5 => ArmingState::ToDisarmed,
            6 => ArmingState::Closed,
            _ => ArmingState::Disarmed,
        }
    }
}

impl core::fmt::Display for ArmingState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock-free arming state, readable from the polling thread and every
/// waiter without touching the lifecycle lock.
#[derive(Debug)]
pub struct ArmingCell(AtomicU8);

impl ArmingCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ArmingState::Disarmed as u8))
    }

    pub fn get(&self) -> ArmingState {
        ArmingState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ArmingState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Only a real, fully armed device counts; pretending does not.
    pub fn is_armed(&self) -> bool {
        self.get() == ArmingState::Armed
    }

    pub fn is_pretending(&self) -> bool {
        self.get() == ArmingState::Pretending
    }

    pub fn is_armed_or_pretending(&self) -> bool {
        matches!(self.get(), ArmingState::Armed | ArmingState::Pretending)
    }
}

impl Default for ArmingCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver-specific steps run inside lifecycle transitions.
pub trait DeviceHooks: Send + Sync {
    /// Runs once the transport is up, before writes are accepted. Creates
    /// the driver's segments. Also runs when pretending.
    fn on_arm(&self, transport: &Arc<dyn Transport>) -> Result<()>;

    /// Runs after the transport is gone. Forgets cached register values.
    fn on_disarm(&self) {}

    /// Runs on close while still armed, before disarming.
    fn on_safe_state(&self) {}
}
