//! One USB controller module: its lifecycle, its write gate and the
//! transport that serves both.
//!
//! Drivers own a [`UsbController`] and hand it their [`DeviceHooks`] for
//! every transition.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::link::{
    causality::CausalityController,
    config::LinkConfig,
    error::{LinkError, Result},
    lifecycle::{ArmingCell, ArmingState, DeviceHooks},
    transport::{CycleEvents, OpenRequest, Transport, TransportFactory, Window},
};

/// Register holding the firmware version on every module.
pub const ADDRESS_VERSION: u8 = 0x00;

/// Fans cycle events out to the write gate, then to an optional listener.
pub struct CycleHub {
    gate: Arc<CausalityController>,
    listener: RwLock<Option<Arc<dyn CycleEvents>>>,
}

impl CycleHub {
    pub fn new(gate: Arc<CausalityController>) -> Self {
        Self {
            gate,
            listener: RwLock::new(None),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn CycleEvents>) {
        *self.listener.write() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn CycleEvents>> {
        self.listener.read().clone()
    }
}

impl CycleEvents for CycleHub {
    fn startup_complete(&self) {
        self.gate.startup_complete();
        if let Some(listener) = self.listener() {
            listener.startup_complete();
        }
    }

    fn read_completed(&self) {
        self.gate.read_completed();
        if let Some(listener) = self.listener() {
            listener.read_completed();
        }
    }

    fn write_completed(&self) {
        self.gate.write_completed();
        if let Some(listener) = self.listener() {
            listener.write_completed();
        }
    }

    fn shutdown_complete(&self) {
        if let Some(listener) = self.listener() {
            listener.shutdown_complete();
        }
        self.gate.shutdown_complete();
    }
}

pub struct UsbController {
    name: String,
    window: Window,
    config: LinkConfig,
    factory: Box<dyn TransportFactory>,
    arming: Arc<ArmingCell>,
    gate: Arc<CausalityController>,
    hub: Arc<CycleHub>,
    transitions: Mutex<()>,
}

impl UsbController {
    pub fn new(
        name: impl Into<String>,
        window: Window,
        config: LinkConfig,
        factory: impl TransportFactory + 'static,
    ) -> Self {
        let arming = Arc::new(ArmingCell::new());
        let gate = Arc::new(CausalityController::new(arming.clone()));
        let hub = Arc::new(CycleHub::new(gate.clone()));
        Self {
            name: name.into(),
            window,
            config,
            factory: Box::new(factory),
            arming,
            gate,
            hub,
            transitions: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<CausalityController> {
        &self.gate
    }

    pub fn hub(&self) -> &Arc<CycleHub> {
        &self.hub
    }

    pub fn arming_state(&self) -> ArmingState {
        self.arming.get()
    }

    pub fn is_armed(&self) -> bool {
        self.arming.is_armed()
    }

    pub fn is_pretending(&self) -> bool {
        self.arming.is_pretending()
    }

    /// Firmware version byte.
    pub fn version(&self) -> Result<u8> {
        self.gate.read8(ADDRESS_VERSION)
    }

    /// Connects to the real device. A no-op when already armed.
    pub fn arm(&self, hooks: &dyn DeviceHooks) -> Result<()> {
        let _transition = self.transitions.lock();
        match self.arming.get() {
            ArmingState::Armed => Ok(()),
            ArmingState::Disarmed => self.bring_up(hooks, false),
            state => Err(LinkError::IllegalState {
                op: "arm",
                state: state.name(),
            }),
        }
    }

    /// Runs against a stand-in that acknowledges writes and reads zeros.
    pub fn pretend(&self, hooks: &dyn DeviceHooks) -> Result<()> {
        let _transition = self.transitions.lock();
        match self.arming.get() {
            ArmingState::Pretending => Ok(()),
            ArmingState::Disarmed => self.bring_up(hooks, true),
            state => Err(LinkError::IllegalState {
                op: "pretend",
                state: state.name(),
            }),
        }
    }

    /// Arms, falling back to pretending if the device cannot be reached.
    pub fn arm_or_pretend(&self, hooks: &dyn DeviceHooks) -> Result<()> {
        match self.arm(hooks) {
            Ok(()) => Ok(()),
            Err(err @ LinkError::IllegalState { .. }) => Err(err),
            Err(err) => {
                tracing::warn!(device = %self.name, %err, "arming failed; pretending");
                self.pretend(hooks)
            }
        }
    }

    /// Stops the transport and forgets everything cached. Idempotent.
    pub fn disarm(&self, hooks: &dyn DeviceHooks) -> Result<()> {
        let _transition = self.transitions.lock();
        match self.arming.get() {
            ArmingState::Disarmed | ArmingState::Closed => Ok(()),
            _ => {
                self.arming.set(ArmingState::ToDisarmed);
                self.tear_down(hooks);
                self.arming.set(ArmingState::Disarmed);
                Ok(())
            }
        }
    }

    /// Puts actuators in their safe state if armed, then disarms for good.
    pub fn close(&self, hooks: &dyn DeviceHooks) -> Result<()> {
        let _transition = self.transitions.lock();
        let state = self.arming.get();
        if state == ArmingState::Closed {
            return Ok(());
        }
        tracing::debug!(device = %self.name, from = %state, "closing");
        if state == ArmingState::Armed {
            hooks.on_safe_state();
        }
        if state != ArmingState::Disarmed {
            self.arming.set(ArmingState::ToDisarmed);
            self.tear_down(hooks);
        }
        self.arming.set(ArmingState::Closed);
        Ok(())
    }

    fn bring_up(&self, hooks: &dyn DeviceHooks, pretend: bool) -> Result<()> {
        let (during, after) = if pretend {
            (ArmingState::ToPretending, ArmingState::Pretending)
        } else {
            (ArmingState::ToArmed, ArmingState::Armed)
        };
        tracing::debug!(device = %self.name, pretend, "arming");
        self.arming.set(during);

        match self.open(hooks, pretend) {
            Ok(()) => {
                self.arming.set(after);
                tracing::debug!(device = %self.name, state = %after, "arming complete");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(device = %self.name, %err, "arming failed");
                self.arming.set(ArmingState::Disarmed);
                self.tear_down(hooks);
                Err(err)
            }
        }
    }

    fn open(&self, hooks: &dyn DeviceHooks, pretend: bool) -> Result<()> {
        let request = OpenRequest {
            window: self.window,
            config: &self.config,
            events: self.hub.clone(),
        };
        let transport: Arc<dyn Transport> = if pretend {
            self.factory.open_pretend(request)?
        } else {
            self.factory.open(request)?
        };
        self.gate.attach(transport.clone());
        hooks.on_arm(&transport)?;
        transport.set_accepting_writes(true);
        Ok(())
    }

    fn tear_down(&self, hooks: &dyn DeviceHooks) {
        tracing::debug!(device = %self.name, "disarming");
        if let Some(transport) = self.gate.transport() {
            transport.set_accepting_writes(false);
            transport.drain_pending_writes();
            transport.close();
        }
        self.gate.detach();
        hooks.on_disarm();
        tracing::debug!(device = %self.name, "disarming complete");
    }
}

impl core::fmt::Debug for UsbController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UsbController")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("state", &self.arming.get())
            .finish_non_exhaustive()
    }
}
