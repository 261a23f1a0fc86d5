//! Causality-preserving register synchronization for USB-attached controller
//! modules.
//!
//! Each module exposes a flat 256-byte register space. A background polling
//! task keeps a local copy of a register window in sync with the device,
//! alternating a read cycle and a write cycle. Application threads never
//! talk to the link directly: they go through a write gate that orders their
//! reads after their own writes.
//!
//! # Features
//!
//! - **Read-your-writes** - a read waits until every earlier write has been
//!   carried to the device and read back
//! - **Arming lifecycle** - connect, pretend, disarm and close, with a safe
//!   state entered before the link goes away
//! - **Port multiplexing** - several I2C ports share one module through
//!   per-port segments and a ready-status byte
//! - **Device drivers** - motor, servo, device interface and legacy modules
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   write / read   ┌─────────────────────┐
//! │  Driver (app)    │─────────────────▶│ CausalityController │
//! │                  │◀─────────────────│   (write gate)      │
//! └──────────────────┘  fresh bytes     └──────────┬──────────┘
//!                                                  │ stage / copy
//!                                       ┌──────────▼──────────┐
//!                                       │  PollingTransport   │
//!                                       │ read cycle, write   │
//!                                       │ cycle, segments     │
//!                                       └──────────┬──────────┘
//!                                                  │ RegisterLink
//!                                                  ▼
//!                                              device
//! ```
//!
//! - **Writes** are staged in the transport's write cache and mark the gate
//!   dirty
//! - **Write cycles** carry staged bytes to the device
//! - **Read cycles** after a write cycle release waiting readers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use usb_register_sync::prelude::*;
//!
//! let link = Arc::new(SimulatedLink::new());
//! let motors = MotorController::new(
//!     "drive motors",
//!     LinkConfig::default(),
//!     SimulatedFactory::new(link),
//! );
//! motors.arm_or_pretend().unwrap();
//!
//! motors.set_motor_mode(1, RunMode::RunUsingEncoder).unwrap();
//! motors.set_motor_power(1, 0.5).unwrap();
//! let position = motors.motor_current_position(1).unwrap();
//! # let _ = position;
//!
//! motors.close().unwrap();
//! ```

#![deny(unsafe_code)]

pub mod link;

pub mod prelude {
    pub use crate::link::prelude::*;
}
