pub mod bytes;
pub mod causality;
pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
pub mod helpers;
pub mod last_known;
pub mod lifecycle;
pub mod mode_commit;
pub mod multiplexer;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use bytes::{Registers, RegistersMut};
pub use causality::{CausalityController, ReadOutcome, WriteOutcome, WriteStatus};
pub use config::LinkConfig;
pub use controller::{CycleHub, UsbController};
pub use devices::{
    DeviceInterfaceModule, DigitalChannelMode, LegacyModule, MotorController, PidCoefficients,
    ServoController, ZeroPowerBehavior,
};
pub use error::{ConfigError, LinkError, Result};
pub use last_known::LastKnown;
pub use lifecycle::{ArmingState, DeviceHooks};
pub use mode_commit::{CommitOutcome, CommitTarget, ModeCommitRecord};
pub use multiplexer::{PortLayout, PortMultiplexer, PortReadyBeginEnd, PortReadyCallback};
pub use transport::{
    CycleEvents, LinkFactory, PollingTransport, PretendLink, RegisterLink, SegmentId,
    SimulatedFactory, SimulatedLink, Transport, TransportFactory, Window,
};
pub use wire::{ActionFlag, AnalogOutputMode, PidLock, PwmStatus, RunMode, WireByte};

pub mod prelude {
    pub use super::{
        AnalogOutputMode, ArmingState, CausalityController, DeviceInterfaceModule,
        DigitalChannelMode, LegacyModule, LinkConfig, LinkError, LinkFactory, MotorController,
        PidCoefficients, PortMultiplexer, PortReadyBeginEnd, PortReadyCallback, PretendLink,
        PwmStatus, ReadOutcome, RegisterLink, RunMode, ServoController, SimulatedFactory,
        SimulatedLink, TransportFactory, UsbController, WriteOutcome, ZeroPowerBehavior,
    };
}
