//! Simulated drive: a motor controller and a servo controller against
//! simulated modules.
//!
//! This demo shows:
//! - Arming drivers over a simulated link
//! - Read-your-writes through the write gate
//! - An encoder reset confirmed by simulated firmware
//! - Closing into the safe state (motors float, servos go limp)
//!
//! Run with `RUST_LOG=usb_register_sync=debug` to watch the mode handshake.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use usb_register_sync::{
    link::{helpers::REGISTER_SPACE, transport::Firmware},
    prelude::*,
};

// ============ Register Layout ============
// Motor 1 mode byte and its current encoder (big-endian i32).
const MOTOR1_MODE: usize = 0x44;
const MOTOR1_ENCODER: usize = 0x4C;
const RESET: u8 = 0x03;

/// Clears the encoder as soon as a reset is commanded.
struct InstantReset;

impl Firmware for InstantReset {
    fn on_write(&mut self, _addr: u8, _bytes: &[u8], regs: &mut [u8; REGISTER_SPACE]) {
        if regs[MOTOR1_MODE] & RESET == RESET {
            regs[MOTOR1_ENCODER..MOTOR1_ENCODER + 4].fill(0);
        }
    }
}

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = LinkConfig::default();

    // ========== Motors ==========
    let motor_link = Arc::new(SimulatedLink::new());
    motor_link.set_firmware(InstantReset);
    motor_link.set_read_only(MOTOR1_ENCODER as u8, 10).unwrap();
    motor_link
        .poke(MOTOR1_ENCODER as u8, &1440i32.to_be_bytes())
        .unwrap();

    let motors = MotorController::new(
        "drive motors",
        config.clone(),
        SimulatedFactory::new(motor_link),
    );
    motors.arm().unwrap();
    motors.initialize_hardware().unwrap();

    println!("encoder before reset: {}", motors.motor_current_position(1).unwrap());
    motors
        .set_motor_mode(1, RunMode::StopAndResetEncoder)
        .unwrap();
    println!("encoder after reset:  {}", motors.motor_current_position(1).unwrap());

    motors.set_motor_mode(1, RunMode::RunUsingEncoder).unwrap();
    motors.set_motor_power(1, 0.75).unwrap();
    // Reads are ordered after our own writes
    println!("motor 1 power: {:.2}", motors.motor_power(1).unwrap());

    // ========== Servos ==========
    let servos = ServoController::new(
        "arm servos",
        config,
        SimulatedFactory::new(Arc::new(SimulatedLink::new())),
    );
    servos.arm().unwrap();
    servos.set_servo_position(1, 0.25).unwrap();
    println!("pwm: {:?}", servos.pwm_status().unwrap());

    // ========== Shutdown ==========
    motors.close().unwrap();
    servos.close().unwrap();
    println!("closed: {:?} / {:?}", motors.arming_state(), servos.arming_state());
}
