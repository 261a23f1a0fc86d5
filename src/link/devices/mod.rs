//! Drivers for the individual controller modules.
//!
//! Each driver owns a [`UsbController`](crate::link::controller::UsbController)
//! and implements [`DeviceHooks`](crate::link::lifecycle::DeviceHooks) for it;
//! the lifecycle methods below are generated once per driver.

/// Generates the lifecycle surface of a driver that keeps its controller in
/// a field named `usb`.
macro_rules! lifecycle_methods {
    () => {
        /// Connects to the device.
        pub fn arm(&self) -> $crate::link::error::Result<()> {
            self.usb.arm(self)
        }

        /// Runs against a stand-in that acknowledges writes and reads zeros.
        pub fn pretend(&self) -> $crate::link::error::Result<()> {
            self.usb.pretend(self)
        }

        pub fn arm_or_pretend(&self) -> $crate::link::error::Result<()> {
            self.usb.arm_or_pretend(self)
        }

        pub fn disarm(&self) -> $crate::link::error::Result<()> {
            self.usb.disarm(self)
        }

        /// Puts the device in its safe state if armed, then disarms for good.
        pub fn close(&self) -> $crate::link::error::Result<()> {
            self.usb.close(self)
        }

        pub fn arming_state(&self) -> $crate::link::lifecycle::ArmingState {
            self.usb.arming_state()
        }

        pub fn is_armed(&self) -> bool {
            self.usb.is_armed()
        }

        /// Firmware version byte from the device header.
        pub fn version(&self) -> $crate::link::error::Result<u8> {
            self.usb.version()
        }

        pub fn usb(&self) -> &$crate::link::controller::UsbController {
            &self.usb
        }
    };
}

pub mod interface_module;
pub mod legacy;
pub mod motor;
pub mod servo;

pub use interface_module::{DeviceInterfaceModule, DigitalChannelMode};
pub use legacy::LegacyModule;
pub use motor::{MotorController, PidCoefficients, ZeroPowerBehavior};
pub use servo::ServoController;
