//! Six-channel servo controller.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::link::{
    config::LinkConfig,
    controller::UsbController,
    error::Result,
    helpers::{check_sub_device, clip_checked, scale},
    last_known::LastKnown,
    lifecycle::DeviceHooks,
    transport::{Transport, TransportFactory, Window},
    wire::{PwmStatus, WireByte},
};

pub const SERVO_FIRST: usize = 1;
pub const SERVO_LAST: usize = 6;
const SERVO_COUNT: usize = SERVO_LAST - SERVO_FIRST + 1;

pub const WINDOW: Window = Window::new(0x40, 0x09);

const ADDRESS_CHANNEL: [u8; SERVO_COUNT] = [0x42, 0x43, 0x44, 0x45, 0x46, 0x47];
const ADDRESS_PWM: u8 = 0x48;

const POSITION_BYTE_MAX: f64 = 255.0;

struct ServoState {
    commanded: [LastKnown<f64>; SERVO_COUNT],
    pwm_enabled: LastKnown<bool>,
}

impl ServoState {
    fn forget(&mut self) {
        for position in &mut self.commanded {
            position.invalidate();
        }
        self.pwm_enabled.invalidate();
    }
}

pub struct ServoController {
    usb: UsbController,
    state: Mutex<ServoState>,
}

impl ServoController {
    pub fn new(
        name: impl Into<String>,
        config: LinkConfig,
        factory: impl TransportFactory + 'static,
    ) -> Self {
        let freshness = config.value_freshness();
        let state = ServoState {
            commanded: core::array::from_fn(|_| LastKnown::with_freshness(freshness)),
            pwm_enabled: LastKnown::with_freshness(freshness),
        };
        Self {
            usb: UsbController::new(name, WINDOW, config, factory),
            state: Mutex::new(state),
        }
    }

    lifecycle_methods!();

    /// Disables PWM, letting every servo go limp.
    pub fn initialize_hardware(&self) -> Result<()> {
        self.pwm_disable()
    }

    pub fn reset_for_op_mode(&self) -> Result<()> {
        self.pwm_disable()
    }

    /// Commands `servo` to `position` in `[0, 1]` (clipped; NaN rejected)
    /// and enables PWM. Nothing is written when the position is unchanged.
    pub fn set_servo_position(&self, servo: usize, position: f64) -> Result<()> {
        check_sub_device(servo, SERVO_FIRST, SERVO_LAST)?;
        let position = clip_checked("servo position", position, 0.0, 1.0)?;

        let mut state = self.state.lock();
        if state.commanded[servo - SERVO_FIRST].update_value(position) {
            let byte = scale(position, 0.0, 1.0, 0.0, POSITION_BYTE_MAX) as u8;
            let _ = self
                .usb
                .gate()
                .write8(ADDRESS_CHANNEL[servo - SERVO_FIRST], byte)?;
            self.enable_locked(&mut state)?;
        }
        Ok(())
    }

    /// Last commanded position, even if it has since gone stale or PWM was
    /// disabled. `None` if nothing was ever commanded.
    pub fn servo_position(&self, servo: usize) -> Result<Option<f64>> {
        check_sub_device(servo, SERVO_FIRST, SERVO_LAST)?;
        Ok(self.state.lock().commanded[servo - SERVO_FIRST].raw_value())
    }

    pub fn pwm_enable(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.enable_locked(&mut state)
    }

    fn enable_locked(&self, state: &mut ServoState) -> Result<()> {
        if state.pwm_enabled.update_value(true) {
            let _ = self
                .usb
                .gate()
                .write8(ADDRESS_PWM, PwmStatus::Enabled.to_wire_byte())?;
        }
        Ok(())
    }

    /// Disables PWM. Commanded positions are marked stale, so the next
    /// command is written even if it repeats the last one.
    pub fn pwm_disable(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.pwm_enabled.update_value(false) {
            let _ = self
                .usb
                .gate()
                .write8(ADDRESS_PWM, PwmStatus::Disabled.to_wire_byte())?;
            for position in &mut state.commanded {
                position.invalidate();
            }
        }
        Ok(())
    }

    pub fn pwm_status(&self) -> Result<PwmStatus> {
        Ok(PwmStatus::from_wire_byte(self.usb.gate().read8(ADDRESS_PWM)?))
    }
}

impl DeviceHooks for ServoController {
    fn on_arm(&self, _transport: &Arc<dyn Transport>) -> Result<()> {
        self.state.lock().forget();
        Ok(())
    }

    fn on_disarm(&self) {
        self.state.lock().forget();
    }

    fn on_safe_state(&self) {
        if let Err(err) = self.pwm_disable() {
            tracing::warn!(device = %self.usb.name(), %err, "could not disable pwm");
        }
    }
}

impl core::fmt::Debug for ServoController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServoController")
            .field("usb", &self.usb)
            .finish_non_exhaustive()
    }
}
