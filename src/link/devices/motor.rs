//! Two-channel DC motor controller.
//!
//! Mode changes are applied by the firmware some cycles after the mode byte
//! lands, so every motor operation first completes any switch still in
//! flight on that motor (see [`crate::link::mode_commit`]).

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};

use crate::link::{
    bytes::{Registers, RegistersMut},
    causality::CausalityController,
    config::LinkConfig,
    controller::UsbController,
    error::{LinkError, Result},
    helpers::{check_sub_device, clip_checked, scale},
    last_known::LastKnown,
    lifecycle::DeviceHooks,
    mode_commit::{CommitTarget, ModeCommitRecord, complete_mode_switch},
    transport::{SegmentId, Transport, TransportFactory, Window},
    wire::{MODE_SELECTION_MASK, PidLock, RunMode, WireByte},
};

pub const MOTOR_FIRST: usize = 1;
pub const MOTOR_LAST: usize = 2;
const MOTOR_COUNT: usize = MOTOR_LAST - MOTOR_FIRST + 1;

pub const WINDOW: Window = Window::new(0x40, 0x1E);

const ADDRESS_MODE: [u8; MOTOR_COUNT] = [0x44, 0x47];
const ADDRESS_POWER: [u8; MOTOR_COUNT] = [0x45, 0x46];
const ADDRESS_TARGET_ENCODER: [u8; MOTOR_COUNT] = [0x40, 0x48];
const ADDRESS_CURRENT_ENCODER: [u8; MOTOR_COUNT] = [0x4C, 0x50];
const ADDRESS_GEAR_RATIO: [u8; MOTOR_COUNT] = [0x56, 0x5A];
const ADDRESS_PID: [u8; MOTOR_COUNT] = [0x57, 0x5B];
const ADDRESS_BATTERY: u8 = 0x54;
const ADDRESS_PID_LOCK: u8 = 0x03;

const ENCODER_LEN: usize = 4;
/// Gear ratio followed by the three PID coefficients.
pub const PID_PARAMS_LEN: usize = 4;
const PID_LOCK_SEGMENT: SegmentId = SegmentId(0);

const POWER_MAX: i8 = 100;
const POWER_MIN: i8 = -100;
pub const POWER_FLOAT: i8 = -128;
pub const POWER_BRAKE: i8 = 0;
const RATIO_MAX: f64 = 127.0;
const PID_COEFFICIENT_MAX: f64 = 255.0;
const DEFAULT_PID: [u8; 3] = [0x80, 0x40, 0xB8];

/// Encoder ticks between target and current position still counted as
/// arrived.
pub const BUSY_THRESHOLD: u32 = 5;

const BATTERY_MAX_MEASURABLE: u16 = 1023;
const BATTERY_MAX_VOLTAGE: f64 = 20.4;

// Time the EEPROM needs after the lock byte lands.
const PID_SETTLE: Duration = Duration::from_millis(150);

/// What a motor does when its power is set to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroPowerBehavior {
    #[default]
    Brake,
    Float,
}

/// Closed-loop coefficients as stored on the controller (0..=255 each).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidCoefficients {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl PidCoefficients {
    pub fn new(p: f64, i: f64, d: f64) -> Self {
        Self { p, i, d }
    }

    fn to_bytes(self) -> [u8; 3] {
        [self.p, self.i, self.d].map(|c| c.clamp(0.0, PID_COEFFICIENT_MAX) as u8)
    }
}

struct MotorState {
    commit: ModeCommitRecord<RunMode>,
    power_byte: LastKnown<i8>,
    target_position: LastKnown<i32>,
    zero_power: ZeroPowerBehavior,
}

impl MotorState {
    fn new(config: &LinkConfig) -> Self {
        let freshness = config.value_freshness();
        let mut commit = ModeCommitRecord::new(config.mode_wait_count_max);
        commit.last_known_mode = LastKnown::with_freshness(freshness);
        Self {
            commit,
            power_byte: LastKnown::with_freshness(freshness),
            target_position: LastKnown::with_freshness(freshness),
            zero_power: ZeroPowerBehavior::default(),
        }
    }

    fn forget(&mut self) {
        self.commit.last_known_mode.invalidate();
        self.power_byte.invalidate();
        self.target_position.invalidate();
    }
}

/// Mode registers of both motors, as seen by the completion loop.
struct MotorChannels<'a> {
    gate: &'a CausalityController,
}

impl CommitTarget for MotorChannels<'_> {
    type Mode = RunMode;

    fn read_mode(&self, motor: usize) -> Result<u8> {
        Ok(self.gate.read8(mode_addr(motor))? & MODE_SELECTION_MASK)
    }

    fn write_mode(&self, motor: usize, mode: RunMode) -> Result<()> {
        let _ = self.gate.write8(mode_addr(motor), mode.to_wire_byte())?;
        Ok(())
    }

    fn wait_for_next_read(&self) -> bool {
        self.gate.wait_for_next_read_completed()
    }

    fn is_armed(&self) -> bool {
        self.gate.is_armed()
    }

    fn is_confirmed(&self, requested: RunMode, reported: u8) -> bool {
        let current = RunMode::from_wire_byte(reported);
        // Firmware 2.0 passes through reset on its own and lands in
        // run-without-encoder
        current == requested
            || (requested == RunMode::StopAndResetEncoder && current == RunMode::RunWithoutEncoder)
    }
}

fn slot(motor: usize) -> usize {
    motor - MOTOR_FIRST
}

fn mode_addr(motor: usize) -> u8 {
    ADDRESS_MODE[slot(motor)]
}

fn power_addr(motor: usize) -> u8 {
    ADDRESS_POWER[slot(motor)]
}

fn power_from_byte(byte: i8) -> f64 {
    if byte == POWER_FLOAT {
        // Floating counts as zero power
        0.0
    } else {
        scale(byte as f64, POWER_MIN as f64, POWER_MAX as f64, -1.0, 1.0)
    }
}

pub struct MotorController {
    usb: UsbController,
    // One lock per motor, so a switch in flight on one leaves the other free
    motors: [Mutex<MotorState>; MOTOR_COUNT],
}

impl MotorController {
    pub fn new(
        name: impl Into<String>,
        config: LinkConfig,
        factory: impl TransportFactory + 'static,
    ) -> Self {
        let motors = core::array::from_fn(|_| Mutex::new(MotorState::new(&config)));
        Self {
            usb: UsbController::new(name, WINDOW, config, factory),
            motors,
        }
    }

    lifecycle_methods!();

    fn gate(&self) -> &Arc<CausalityController> {
        self.usb.gate()
    }

    fn channels(&self) -> MotorChannels<'_> {
        MotorChannels { gate: self.gate() }
    }

    fn lock(&self, motor: usize) -> MutexGuard<'_, MotorState> {
        self.motors[slot(motor)].lock()
    }

    fn validate(motor: usize) -> Result<()> {
        check_sub_device(motor, MOTOR_FIRST, MOTOR_LAST)
    }

    /// Floats both motors and loads the default PID coefficients.
    pub fn initialize_hardware(&self) -> Result<()> {
        self.float_all()?;
        for motor in MOTOR_FIRST..=MOTOR_LAST {
            let _ = self.gate().write(ADDRESS_PID[slot(motor)], &DEFAULT_PID)?;
        }
        Ok(())
    }

    /// Floats the motors, drops them back to running without encoders and
    /// forgets everything cached.
    pub fn reset_for_op_mode(&self) -> Result<()> {
        self.float_all()?;
        for motor in MOTOR_FIRST..=MOTOR_LAST {
            self.set_motor_mode(motor, RunMode::RunWithoutEncoder)?;
        }
        for state in &self.motors {
            let mut state = state.lock();
            state.zero_power = ZeroPowerBehavior::Brake;
            state.forget();
        }
        Ok(())
    }

    fn float_all(&self) -> Result<()> {
        for motor in MOTOR_FIRST..=MOTOR_LAST {
            self.set_motor_power_float(motor)?;
        }
        Ok(())
    }

    fn forget_all(&self) {
        for state in &self.motors {
            state.lock().forget();
        }
    }

    /// Requests `mode` and returns without waiting for the firmware to
    /// apply it; the next operation on this motor does the waiting. This
    /// lets both motors switch in parallel.
    pub fn set_motor_mode(&self, motor: usize, mode: RunMode) -> Result<()> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;

        let prev_mode = state.commit.last_known_mode.non_timed_value();
        if state.commit.last_known_mode.update_value(mode) {
            let prev_power = self.cached_or_queried_power(motor, state)?;
            state.commit.begin(mode, prev_mode, prev_power);
            let _ = self.gate().write8(mode_addr(motor), mode.to_wire_byte())?;
        }
        Ok(())
    }

    pub fn motor_mode(&self, motor: usize) -> Result<RunMode> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;
        self.cached_or_queried_mode(motor, state)
    }

    fn finish_mode_switch(&self, motor: usize, state: &mut MotorState) -> Result<()> {
        if !state.commit.completion_needed {
            return Ok(());
        }
        let result = self.drive_mode_switch(motor, state);
        // Whatever happened, the cached view of this motor is suspect now
        state.forget();
        state.commit.finish();
        result
    }

    fn drive_mode_switch(&self, motor: usize, state: &mut MotorState) -> Result<()> {
        let mode = match state.commit.pending_mode {
            Some(mode) => mode,
            None => self.cached_or_queried_mode(motor, state)?,
        };
        let outcome = complete_mode_switch(&self.channels(), motor, &mut state.commit)?;
        tracing::trace!(motor, ?mode, ?outcome, "mode switch");

        let prev_mode = state.commit.prev_mode;
        if mode.is_pid_mode() && !prev_mode.is_some_and(RunMode::is_pid_mode) {
            let power = state.commit.prev_value;
            // Run-to-position takes a magnitude only
            let power = if mode == RunMode::RunToPosition {
                power.abs()
            } else {
                power
            };
            self.set_power(motor, state, power)?;
        } else if mode == RunMode::RunToPosition {
            let power = self.query_power(motor, state)?;
            if power < 0.0 {
                self.set_power(motor, state, power.abs())?;
            }
        }

        if mode == RunMode::StopAndResetEncoder {
            self.await_encoder_reset(motor, mode)?;
        }
        Ok(())
    }

    /// Polls the encoder until it reads zero, resending the reset each time
    /// the resend interval passes without it.
    fn await_encoder_reset(&self, motor: usize, mode: RunMode) -> Result<()> {
        let interval = self.usb.config().reset_resend_interval();
        let mut deadline = Instant::now() + interval;
        while self.query_current_position(motor)? != 0 {
            let now = Instant::now();
            if now > deadline {
                tracing::debug!(device = %self.usb.name(), motor, ?mode, "mode resend");
                let _ = self.gate().write8(mode_addr(motor), mode.to_wire_byte())?;
                deadline = now + interval;
            }
            if !self.gate().is_armed() || !self.gate().wait_for_next_read_completed() {
                break;
            }
        }
        Ok(())
    }

    fn query_mode(&self, motor: usize, state: &mut MotorState) -> Result<RunMode> {
        let mode = RunMode::from_wire_byte(self.gate().read8(mode_addr(motor))?);
        state.commit.last_known_mode.set_value(mode);
        Ok(mode)
    }

    fn cached_or_queried_mode(&self, motor: usize, state: &mut MotorState) -> Result<RunMode> {
        match state.commit.last_known_mode.non_timed_value() {
            Some(mode) => Ok(mode),
            None => self.query_mode(motor, state),
        }
    }

    pub fn set_motor_power(&self, motor: usize, power: f64) -> Result<()> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;
        self.set_power(motor, state, power)
    }

    /// Power read back from the controller, in `[-1, 1]`.
    pub fn motor_power(&self, motor: usize) -> Result<f64> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;
        self.query_power(motor, state)
    }

    fn set_power(&self, motor: usize, state: &mut MotorState, power: f64) -> Result<()> {
        let power = clip_checked("motor power", power, -1.0, 1.0)?;
        let byte = if power == 0.0 && state.zero_power == ZeroPowerBehavior::Float {
            POWER_FLOAT
        } else {
            scale(power, -1.0, 1.0, POWER_MIN as f64, POWER_MAX as f64) as i8
        };
        self.set_power_byte(motor, state, byte)
    }

    fn set_power_byte(&self, motor: usize, state: &mut MotorState, byte: i8) -> Result<()> {
        if state.power_byte.update_value(byte) {
            let _ = self.gate().write8(power_addr(motor), byte as u8)?;
        }
        Ok(())
    }

    fn query_power(&self, motor: usize, state: &mut MotorState) -> Result<f64> {
        let byte = self.gate().read8(power_addr(motor))? as i8;
        state.power_byte.set_value(byte);
        Ok(power_from_byte(byte))
    }

    fn cached_or_queried_power(&self, motor: usize, state: &mut MotorState) -> Result<f64> {
        match state.power_byte.non_timed_value() {
            Some(byte) => Ok(power_from_byte(byte)),
            None => self.query_power(motor, state),
        }
    }

    pub fn set_motor_power_float(&self, motor: usize) -> Result<()> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;
        let _ = self.gate().write8(power_addr(motor), POWER_FLOAT as u8)?;
        state.power_byte.set_value(POWER_FLOAT);
        Ok(())
    }

    pub fn motor_power_float(&self, motor: usize) -> Result<bool> {
        Self::validate(motor)?;
        self.finish_mode_switch(motor, &mut self.lock(motor))?;
        Ok(self.gate().read8(power_addr(motor))? as i8 == POWER_FLOAT)
    }

    /// Takes effect at once if the motor is currently stopped.
    pub fn set_zero_power_behavior(&self, motor: usize, behavior: ZeroPowerBehavior) -> Result<()> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;

        if state.zero_power != behavior {
            state.zero_power = behavior;
            if self.cached_or_queried_power(motor, state)? == 0.0 {
                state.power_byte.invalidate();
                self.set_power(motor, state, 0.0)?;
            }
        }
        Ok(())
    }

    pub fn zero_power_behavior(&self, motor: usize) -> Result<ZeroPowerBehavior> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;
        Ok(state.zero_power)
    }

    pub fn set_motor_target_position(&self, motor: usize, position: i32) -> Result<()> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;

        if state.target_position.update_value(position) {
            let mut raw = [0u8; ENCODER_LEN];
            RegistersMut::new(&mut raw).set_i32_be_at(0, position);
            let _ = self.gate().write(ADDRESS_TARGET_ENCODER[slot(motor)], &raw)?;
        }
        Ok(())
    }

    pub fn motor_target_position(&self, motor: usize) -> Result<i32> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;
        self.query_target_position(motor, state)
    }

    fn query_target_position(&self, motor: usize, state: &mut MotorState) -> Result<i32> {
        let outcome = self
            .gate()
            .read(ADDRESS_TARGET_ENCODER[slot(motor)], ENCODER_LEN)?;
        let position = Registers::new(outcome.bytes()).i32_be_at(0);
        state.target_position.set_value(position);
        Ok(position)
    }

    pub fn motor_current_position(&self, motor: usize) -> Result<i32> {
        Self::validate(motor)?;
        self.finish_mode_switch(motor, &mut self.lock(motor))?;
        self.query_current_position(motor)
    }

    fn query_current_position(&self, motor: usize) -> Result<i32> {
        let outcome = self
            .gate()
            .read(ADDRESS_CURRENT_ENCODER[slot(motor)], ENCODER_LEN)?;
        Ok(Registers::new(outcome.bytes()).i32_be_at(0))
    }

    /// Whether the motor is still short of its target position.
    ///
    /// Compares positions rather than trusting the firmware's busy flag,
    /// which can lag a run-to-position command by up to 50 ms.
    pub fn is_busy(&self, motor: usize) -> Result<bool> {
        Self::validate(motor)?;
        let mut guard = self.lock(motor);
        let state = &mut *guard;
        self.finish_mode_switch(motor, state)?;
        let target = self.query_target_position(motor, state)?;
        let current = self.query_current_position(motor)?;
        Ok(target.abs_diff(current) > BUSY_THRESHOLD)
    }

    /// Battery voltage with 20 mV resolution.
    pub fn battery_voltage(&self) -> Result<f64> {
        let outcome = self.gate().read(ADDRESS_BATTERY, 2)?;
        let regs = Registers::new(outcome.bytes());
        // Top eight bits in the first byte, bottom two in the second
        let raw = (((regs.u8_at(0) as u16) << 2) | (regs.u8_at(1) & 0x03) as u16)
            & BATTERY_MAX_MEASURABLE;
        Ok(raw as f64 / BATTERY_MAX_MEASURABLE as f64 * BATTERY_MAX_VOLTAGE)
    }

    pub fn set_gear_ratio(&self, motor: usize, ratio: f64) -> Result<()> {
        Self::validate(motor)?;
        if !(-1.0..=1.0).contains(&ratio) {
            return Err(LinkError::InvalidValue {
                what: "gear ratio",
                value: ratio,
            });
        }
        let byte = (ratio * RATIO_MAX) as i8;
        let _ = self
            .gate()
            .write8(ADDRESS_GEAR_RATIO[slot(motor)], byte as u8)?;
        Ok(())
    }

    pub fn gear_ratio(&self, motor: usize) -> Result<f64> {
        Self::validate(motor)?;
        let byte = self.gate().read8(ADDRESS_GEAR_RATIO[slot(motor)])? as i8;
        Ok(byte as f64 / RATIO_MAX)
    }

    /// Coefficients above 255 are clamped.
    pub fn set_pid_coefficients(&self, motor: usize, pid: PidCoefficients) -> Result<()> {
        Self::validate(motor)?;
        let _ = self.gate().write(ADDRESS_PID[slot(motor)], &pid.to_bytes())?;
        Ok(())
    }

    pub fn pid_coefficients(&self, motor: usize) -> Result<PidCoefficients> {
        Self::validate(motor)?;
        let outcome = self.gate().read(ADDRESS_PID[slot(motor)], 3)?;
        let bytes = outcome.bytes();
        Ok(PidCoefficients::new(
            bytes[0] as f64,
            bytes[1] as f64,
            bytes[2] as f64,
        ))
    }

    /// Stores gear ratio and PID coefficients in the controller's EEPROM.
    ///
    /// Reads are suspended for the whole unlock, write, lock sequence and
    /// the settle time after it. Returns whether the parameters read back
    /// as written; `false` when the device is not armed.
    pub fn update_pid_params(&self, motor: usize, params: [u8; PID_PARAMS_LEN]) -> Result<bool> {
        Self::validate(motor)?;
        if !self.gate().is_armed() {
            return Ok(false);
        }
        tracing::trace!(device = %self.usb.name(), motor, ?params, "updating motor params");

        self.gate().suppress_reads(true);
        let written = self.write_pid_params(motor, &params);
        self.gate().suppress_reads(false);
        // The first completion may still belong to a cycle that skipped its read
        for _ in 0..2 {
            self.gate().wait_for_next_read_completed();
        }
        written?;

        let outcome = self
            .gate()
            .read(ADDRESS_GEAR_RATIO[slot(motor)], PID_PARAMS_LEN)?;
        Ok(outcome.is_fresh() && outcome.bytes() == params)
    }

    fn write_pid_params(&self, motor: usize, params: &[u8]) -> Result<()> {
        let gate = self.gate();
        let _ = gate.write_segment(PID_LOCK_SEGMENT, &[PidLock::Unlocked.to_wire_byte()])?;
        let written = gate.write_segment(SegmentId(motor as u8), params);
        // Relock even if the write failed; the EEPROM commits on relock
        let locked = gate.write_segment(PID_LOCK_SEGMENT, &[PidLock::Locked.to_wire_byte()]);
        thread::sleep(PID_SETTLE);
        written?;
        locked?;
        Ok(())
    }

    #[cfg(test)]
    fn caches_valid(&self, motor: usize) -> (bool, bool, bool) {
        let state = self.lock(motor);
        (
            state.commit.last_known_mode.non_timed_value().is_some(),
            state.power_byte.non_timed_value().is_some(),
            state.target_position.non_timed_value().is_some(),
        )
    }
}

impl DeviceHooks for MotorController {
    fn on_arm(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        self.forget_all();
        transport.create_segment(PID_LOCK_SEGMENT, ADDRESS_PID_LOCK, 1)?;
        for motor in MOTOR_FIRST..=MOTOR_LAST {
            transport.create_segment(
                SegmentId(motor as u8),
                ADDRESS_GEAR_RATIO[slot(motor)],
                PID_PARAMS_LEN,
            )?;
        }
        Ok(())
    }

    fn on_disarm(&self) {
        self.forget_all();
    }

    fn on_safe_state(&self) {
        if let Err(err) = self.float_all() {
            tracing::warn!(device = %self.usb.name(), %err, "could not float motors");
        }
    }
}

impl core::fmt::Debug for MotorController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MotorController")
            .field("usb", &self.usb)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::link::{
        lifecycle::ArmingState,
        test_support::{self, MotorFirmware, SETTLE},
    };

    #[test]
    fn power_round_trips_through_the_register() {
        let (motors, link) = test_support::armed_motor_controller();

        motors.set_motor_power(1, 0.5).unwrap();
        assert_eq!(motors.motor_power(1).unwrap(), 0.5);
        assert_eq!(link.peek(0x45, 1).unwrap(), vec![50]);

        // Out of range is clipped, NaN is refused
        motors.set_motor_power(2, -3.0).unwrap();
        assert_eq!(motors.motor_power(2).unwrap(), -1.0);
        assert!(matches!(
            motors.set_motor_power(2, f64::NAN),
            Err(LinkError::InvalidValue { .. })
        ));
        assert_eq!(
            motors.set_motor_power(3, 0.0),
            Err(LinkError::InvalidSubDevice {
                index: 3,
                first: 1,
                last: 2
            })
        );
        motors.close().unwrap();
    }

    #[test]
    fn zero_power_behavior_reissues_when_stopped() {
        let (motors, link) = test_support::armed_motor_controller();
        motors.set_motor_power(1, 0.0).unwrap();
        assert_eq!(motors.motor_power(1).unwrap(), 0.0);
        assert_eq!(link.peek(0x45, 1).unwrap(), vec![POWER_BRAKE as u8]);

        motors
            .set_zero_power_behavior(1, ZeroPowerBehavior::Float)
            .unwrap();
        assert!(motors.motor_power_float(1).unwrap());
        assert_eq!(motors.motor_power(1).unwrap(), 0.0);
        assert_eq!(
            motors.zero_power_behavior(1).unwrap(),
            ZeroPowerBehavior::Float
        );

        // Running motors keep their power
        motors.set_motor_power(2, 0.3).unwrap();
        motors
            .set_zero_power_behavior(2, ZeroPowerBehavior::Float)
            .unwrap();
        assert!(!motors.motor_power_float(2).unwrap());
        motors.close().unwrap();
    }

    #[test]
    fn positions_are_big_endian() {
        let (motors, link) = test_support::armed_motor_controller();

        motors.set_motor_target_position(2, 1440).unwrap();
        assert_eq!(motors.motor_target_position(2).unwrap(), 1440);
        assert_eq!(link.peek(0x48, 4).unwrap(), vec![0, 0, 0x05, 0xA0]);

        // Current encoder is driven by the device
        link.poke(0x50, &(-1437i32).to_be_bytes()).unwrap();
        test_support::settle(motors.usb().gate());
        assert_eq!(motors.motor_current_position(2).unwrap(), -1437);

        motors.set_motor_target_position(2, -1440).unwrap();
        assert!(!motors.is_busy(2).unwrap());
        motors.set_motor_target_position(2, 0).unwrap();
        assert!(motors.is_busy(2).unwrap());
        motors.close().unwrap();
    }

    #[test]
    fn mode_switch_reasserts_power() {
        let (motors, link) = test_support::armed_motor_controller();
        motors.set_motor_power(1, -0.4).unwrap();

        motors.set_motor_mode(1, RunMode::RunToPosition).unwrap();
        assert_eq!(motors.motor_mode(1).unwrap(), RunMode::RunToPosition);
        // Run-to-position only takes a magnitude
        let power = motors.motor_power(1).unwrap();
        assert!((power - 0.4).abs() < 0.015, "power {power}");
        assert_eq!(link.peek(0x44, 1).unwrap(), vec![0x02]);

        // Unchanged mode leaves the fresh cache alone
        motors.set_motor_mode(1, RunMode::RunToPosition).unwrap();
        assert!(motors.caches_valid(1).0);
        motors.close().unwrap();
    }

    #[test]
    fn reset_waits_for_the_encoder_and_forgets_caches() {
        let (motors, link) = test_support::armed_motor_controller();
        link.set_firmware(MotorFirmware::new(3));
        link.poke(0x4C, &1440i32.to_be_bytes()).unwrap();
        test_support::settle(motors.usb().gate());

        motors.set_motor_power(1, 0.5).unwrap();
        motors.set_motor_target_position(1, 2000).unwrap();
        assert_eq!(motors.caches_valid(1), (false, true, true));

        let before = motors.usb().gate().read_completion_count();
        motors
            .set_motor_mode(1, RunMode::StopAndResetEncoder)
            .unwrap();
        assert_eq!(motors.motor_current_position(1).unwrap(), 0);

        // Three encoder reads at least, then nothing cached survives
        let cycles = motors.usb().gate().read_completion_count() - before;
        assert!(cycles >= 3, "returned after {cycles} cycles");
        assert_eq!(motors.caches_valid(1), (false, false, false));
        motors.close().unwrap();
    }

    #[test]
    fn pending_switch_leaves_the_other_motor_free() {
        let (motors, link) = test_support::armed_motor_controller();
        // Firmware that never applies motor 1's mode byte
        link.set_read_only(0x44, 1).unwrap();
        motors.set_motor_mode(1, RunMode::RunUsingEncoder).unwrap();

        let motors = Arc::new(motors);
        let switching = {
            let motors = motors.clone();
            thread::spawn(move || motors.motor_mode(1))
        };
        thread::sleep(SETTLE);

        let (tx, rx) = mpsc::channel();
        {
            let motors = motors.clone();
            thread::spawn(move || {
                let power = motors
                    .set_motor_power(2, 0.3)
                    .and_then(|()| motors.motor_power(2));
                let _ = tx.send(power);
            });
        }
        let power = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("motor 2 waited on motor 1")
            .unwrap();
        assert!((power - 0.3).abs() < 0.015, "power {power}");

        // Disarming abandons the switch that can never confirm
        motors.disarm().unwrap();
        assert!(switching.join().unwrap().is_ok());
        motors.close().unwrap();
    }

    #[test]
    fn gear_ratio_and_pid_coefficients() {
        let (motors, _link) = test_support::armed_motor_controller();

        motors.set_gear_ratio(1, -0.5).unwrap();
        assert_eq!(motors.gear_ratio(1).unwrap(), -63.0 / 127.0);
        assert!(matches!(
            motors.set_gear_ratio(1, 1.5),
            Err(LinkError::InvalidValue { what: "gear ratio", .. })
        ));

        motors
            .set_pid_coefficients(2, PidCoefficients::new(300.0, 64.0, 184.0))
            .unwrap();
        assert_eq!(
            motors.pid_coefficients(2).unwrap(),
            PidCoefficients::new(255.0, 64.0, 184.0)
        );
        motors.close().unwrap();
    }

    #[test]
    fn pid_params_go_through_the_eeprom_lock() {
        let (motors, link) = test_support::armed_motor_controller();

        assert!(motors.update_pid_params(2, [0x10, 0x80, 0x40, 0xB8]).unwrap());
        assert_eq!(link.peek(0x5A, 4).unwrap(), vec![0x10, 0x80, 0x40, 0xB8]);
        // Left locked
        assert_eq!(link.peek(0x03, 1).unwrap(), vec![0x00]);
        assert!(
            link.recent_writes()
                .iter()
                .any(|&(addr, len)| addr == 0x5A && len == 4)
        );
        motors.close().unwrap();
    }

    #[test]
    fn initialize_and_reset_for_op_mode() {
        let (motors, link) = test_support::armed_motor_controller();

        motors.initialize_hardware().unwrap();
        assert!(motors.motor_power_float(1).unwrap());
        assert!(motors.motor_power_float(2).unwrap());
        assert_eq!(link.peek(0x57, 3).unwrap(), DEFAULT_PID.to_vec());
        assert_eq!(
            motors.pid_coefficients(1).unwrap(),
            PidCoefficients::new(128.0, 64.0, 184.0)
        );

        motors.set_motor_mode(2, RunMode::RunUsingEncoder).unwrap();
        motors
            .set_zero_power_behavior(2, ZeroPowerBehavior::Float)
            .unwrap();
        motors.reset_for_op_mode().unwrap();
        assert_eq!(motors.motor_mode(2).unwrap(), RunMode::RunWithoutEncoder);
        assert_eq!(
            motors.zero_power_behavior(2).unwrap(),
            ZeroPowerBehavior::Brake
        );
        motors.close().unwrap();
    }

    #[test]
    fn close_floats_the_motors() {
        let (motors, link) = test_support::armed_motor_controller();
        motors.set_motor_power(1, 0.8).unwrap();
        motors.set_motor_power(2, -0.8).unwrap();
        let _ = motors.motor_power(2).unwrap();

        motors.close().unwrap();
        assert_eq!(motors.arming_state(), ArmingState::Closed);
        assert_eq!(link.peek(0x45, 2).unwrap(), vec![0x80, 0x80]);
    }

    #[test]
    fn battery_voltage_uses_ten_bits() {
        let (motors, link) = test_support::armed_motor_controller();
        link.poke(0x54, &[0xFF, 0x03]).unwrap();
        test_support::settle(motors.usb().gate());
        assert_eq!(motors.battery_voltage().unwrap(), 20.4);

        link.poke(0x54, &[0x80, 0x00]).unwrap();
        test_support::settle(motors.usb().gate());
        let half = 512.0 / 1023.0 * 20.4;
        assert!((motors.battery_voltage().unwrap() - half).abs() < 1e-9);
        motors.close().unwrap();
    }

    #[test]
    fn pretending_absorbs_everything() {
        test_support::init_tracing();
        let motors = MotorController::new(
            "pretend motors",
            test_support::fast_config(),
            test_support::unavailable_factory(),
        );
        motors.arm_or_pretend().unwrap();
        assert_eq!(motors.arming_state(), ArmingState::Pretending);

        motors.set_motor_mode(1, RunMode::StopAndResetEncoder).unwrap();
        assert_eq!(motors.motor_current_position(1).unwrap(), 0);
        assert!(!motors.update_pid_params(1, [0; 4]).unwrap());
        assert_eq!(motors.version().unwrap(), 0);
        motors.close().unwrap();
    }
}
